//! Whole-store backup format.

use pickup_core::{AuditEntry, Child, Guardian, Link};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Every record in the store, as exported for backup and accepted for restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub guardians: Vec<Guardian>,
    #[serde(default)]
    pub children: Vec<Child>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            guardians: Vec::new(),
            children: Vec::new(),
            links: Vec::new(),
            audit: Vec::new(),
        }
    }
}

/// Record counts written by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub guardians: usize,
    pub children: usize,
    pub links: usize,
    pub audit: usize,
}
