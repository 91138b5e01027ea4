//! redb table definitions for the gridrm state store.
//!
//! Tables use `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Locked nodes keyed by `{node_source}/{node_url}`.
pub const LOCKED_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("locked_nodes");
