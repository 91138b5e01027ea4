//! Persisted record types.

use serde::{Deserialize, Serialize};

/// An administrative lock that was in force when it was recorded.
///
/// One record exists per locked node; it is erased when the node is
/// unlocked, so whatever is left at startup is the lock intent of the
/// previous run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedNodeRecord {
    pub node_source: String,
    pub node_url: String,
    /// Name of the client that applied the lock.
    pub locked_by: String,
    /// Unix timestamp (seconds) when the lock was applied.
    pub locked_at: u64,
}

impl LockedNodeRecord {
    /// Build the composite key for the locked nodes table.
    pub fn table_key(&self) -> String {
        locked_node_key(&self.node_source, &self.node_url)
    }
}

/// Composite key of a locked node: `{node_source}/{node_url}`.
pub fn locked_node_key(node_source: &str, node_url: &str) -> String {
    format!("{node_source}/{node_url}")
}
