//! StateStore — redb-backed persistence for gridrm.
//!
//! Holds one record per administratively locked node. Records are written
//! on lock, erased on unlock, erased per node source when a source goes
//! away, and listed once at startup. Values are JSON in redb's `&[u8]`
//! columns; the in-memory backend serves tests and runs without a data
//! directory.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(LOCKED_NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Locked nodes ───────────────────────────────────────────────

    /// Insert or update a locked-node record.
    pub fn put_locked_node(&self, record: &LockedNodeRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKED_NODES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "locked node stored");
        Ok(())
    }

    /// List every stored lock record.
    pub fn list_locked_nodes(&self) -> StateResult<Vec<LockedNodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKED_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: LockedNodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete the lock record of a node. Returns true if it existed.
    pub fn delete_locked_node(&self, node_source: &str, node_url: &str) -> StateResult<bool> {
        let key = locked_node_key(node_source, node_url);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOCKED_NODES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "locked node deleted");
        Ok(existed)
    }

    /// Delete all lock records of a node source. Returns number deleted.
    pub fn delete_locked_nodes_for_source(&self, node_source: &str) -> StateResult<u32> {
        let prefix = format!("{node_source}/");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LOCKED_NODES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0u32;
        {
            let mut table = txn.open_table(LOCKED_NODES).map_err(map_err!(Table))?;
            for key in &keys {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_source, count, "locked nodes deleted for source");
        Ok(count)
    }
}
