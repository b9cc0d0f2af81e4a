//! # Permission Gate
//!
//! Every scan and connection attempt is preceded by a check that the host
//! granted Bluetooth-connect, Bluetooth-scan and location access. A denial is
//! fatal for that call and surfaces as
//! [`CounterprintError::PermissionDenied`]; nothing is retried here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Debug};

use crate::error::{CounterprintError, Result};

/// Platform permissions the Bluetooth core depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    BluetoothConnect,
    BluetoothScan,
    Location,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::BluetoothConnect => write!(f, "bluetooth-connect"),
            Permission::BluetoothScan => write!(f, "bluetooth-scan"),
            Permission::Location => write!(f, "location"),
        }
    }
}

/// The permission set required before any Bluetooth operation
pub const BLUETOOTH_PERMISSIONS: [Permission; 3] = [
    Permission::BluetoothConnect,
    Permission::BluetoothScan,
    Permission::Location,
];

/// Answers whether a permission is currently granted
#[async_trait]
pub trait PermissionGate: Send + Sync + Debug {
    async fn is_granted(&self, permission: Permission) -> bool;
}

/// Fail with `PermissionDenied` naming every missing permission.
pub async fn require(gate: &dyn PermissionGate, permissions: &[Permission]) -> Result<()> {
    let mut missing = Vec::new();
    for permission in permissions {
        if !gate.is_granted(*permission).await {
            missing.push(permission.to_string());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CounterprintError::PermissionDenied(missing.join(", ")))
    }
}

/// A fixed answer, set at construction
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    denied: HashSet<Permission>,
}

impl StaticPermissions {
    /// Grant everything. Used on desktop hosts where access control happens
    /// at the device node.
    pub fn all_granted() -> Self {
        Self::default()
    }

    /// Deny the given permissions, grant the rest.
    pub fn denying(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            denied: permissions.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PermissionGate for StaticPermissions {
    async fn is_granted(&self, permission: Permission) -> bool {
        !self.denied.contains(&permission)
    }
}
