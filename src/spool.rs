//! # Spool Directory
//!
//! A [`DocumentSource`] backed by a directory: every regular file is a
//! pending document whose id is its file name and whose payload is its
//! contents. Marking a document printed renames `NAME` to `NAME.printed`.
//!
//! Hidden files (leading `.`) are ignored so writers can stage a document
//! under a dot-name and rename it into place once complete.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CounterprintError, Result};
use crate::queue::{Document, DocumentSource};

/// Suffix given to printed documents
pub const PRINTED_SUFFIX: &str = ".printed";

#[derive(Debug, Clone)]
pub struct SpoolDirectory {
    root: PathBuf,
}

impl SpoolDirectory {
    /// Use `root` as the spool, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, document_id: &str) -> Result<PathBuf> {
        if document_id.is_empty()
            || document_id.starts_with('.')
            || document_id.contains(['/', '\\'])
        {
            return Err(CounterprintError::Config(format!(
                "Invalid document id: {:?}",
                document_id
            )));
        }
        Ok(self.root.join(document_id))
    }
}

#[async_trait]
impl DocumentSource for SpoolDirectory {
    async fn list_unprinted(&self) -> Result<Vec<Document>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!("Skipping non-UTF-8 file name in spool");
                continue;
            };
            if name.starts_with('.') || name.ends_with(PRINTED_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut documents = Vec::with_capacity(names.len());
        for name in names {
            let payload = tokio::fs::read(self.root.join(&name)).await?;
            documents.push(Document::new(name, payload));
        }
        Ok(documents)
    }

    async fn mark_printed(&self, document_id: &str) -> Result<()> {
        let from = self.path_for(document_id)?;
        let to = self.root.join(format!("{}{}", document_id, PRINTED_SUFFIX));
        tokio::fs::rename(&from, &to).await?;
        debug!("Marked {} printed", document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lists_sorted_and_skips_printed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0002-order"), "second").unwrap();
        std::fs::write(dir.path().join("0001-order"), "first").unwrap();
        std::fs::write(dir.path().join("0000-order.printed"), "done").unwrap();
        std::fs::write(dir.path().join(".staging"), "partial").unwrap();
        std::fs::create_dir(dir.path().join("archive")).unwrap();

        let spool = SpoolDirectory::open(dir.path()).await.unwrap();
        let documents = spool.list_unprinted().await.unwrap();

        assert_eq!(
            documents,
            vec![
                Document::new("0001-order", "first"),
                Document::new("0002-order", "second"),
            ]
        );
    }

    #[tokio::test]
    async fn test_mark_printed_renames() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("order-7"), "receipt").unwrap();
        let spool = SpoolDirectory::open(dir.path()).await.unwrap();

        spool.mark_printed("order-7").await.unwrap();

        assert!(spool.list_unprinted().await.unwrap().is_empty());
        assert!(dir.path().join("order-7.printed").exists());
    }

    #[tokio::test]
    async fn test_mark_missing_document_fails() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolDirectory::open(dir.path()).await.unwrap();
        assert!(matches!(
            spool.mark_printed("ghost").await,
            Err(CounterprintError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let dir = TempDir::new().unwrap();
        let spool = SpoolDirectory::open(dir.path()).await.unwrap();
        for id in ["../etc/passwd", "a/b", "", ".hidden"] {
            assert!(matches!(
                spool.mark_printed(id).await,
                Err(CounterprintError::Config(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("spool");
        SpoolDirectory::open(&root).await.unwrap();
        assert!(root.is_dir());
    }
}
