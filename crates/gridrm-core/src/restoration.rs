//! Lock restoration — administrative locks that survive a restart.
//!
//! Lock status lives in the in-memory registry, so a restart would silently
//! return every locked node to scheduling. While restoration is enabled the
//! manager writes each lock intent to a [`LockStore`] and, on the next run,
//! loads what is left and re-applies it as the affected nodes show up again
//! (when they are freed, go down or are declared lost).
//!
//! With restoration disabled the manager is never initialised and
//! [`NodesLockRestorationManager::handle`] never asks for a lock, so the
//! core can call it unconditionally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use gridrm_state::{LockedNodeRecord, StateStore};

use crate::error::RmResult;
use crate::node::NodeRecord;

/// What was recorded about a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockIntent {
    pub locked_by: String,
    pub locked_at: u64,
}

/// Lock intents keyed by `(node_source, node_url)`.
pub type LockIntentTable = HashMap<(String, String), LockIntent>;

/// Persistence of lock intents.
pub trait LockStore: Send + Sync {
    /// Every lock intent recorded and not erased since.
    fn find_locked_nodes(&self) -> RmResult<LockIntentTable>;

    fn save_lock(&self, node_source: &str, node_url: &str, intent: &LockIntent) -> RmResult<()>;

    fn remove_lock(&self, node_source: &str, node_url: &str) -> RmResult<()>;

    /// Erase every intent of `node_source`. Returns how many were erased.
    fn remove_locks_for_source(&self, node_source: &str) -> RmResult<usize>;
}

impl LockStore for StateStore {
    fn find_locked_nodes(&self) -> RmResult<LockIntentTable> {
        let table = self
            .list_locked_nodes()?
            .into_iter()
            .map(|record| {
                (
                    (record.node_source, record.node_url),
                    LockIntent {
                        locked_by: record.locked_by,
                        locked_at: record.locked_at,
                    },
                )
            })
            .collect();
        Ok(table)
    }

    fn save_lock(&self, node_source: &str, node_url: &str, intent: &LockIntent) -> RmResult<()> {
        self.put_locked_node(&LockedNodeRecord {
            node_source: node_source.to_string(),
            node_url: node_url.to_string(),
            locked_by: intent.locked_by.clone(),
            locked_at: intent.locked_at,
        })?;
        Ok(())
    }

    fn remove_lock(&self, node_source: &str, node_url: &str) -> RmResult<()> {
        self.delete_locked_node(node_source, node_url)?;
        Ok(())
    }

    fn remove_locks_for_source(&self, node_source: &str) -> RmResult<usize> {
        Ok(self.delete_locked_nodes_for_source(node_source)? as usize)
    }
}

/// Lock store kept in memory, for tests and for runs without a data directory.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<LockIntentTable>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with the given intents.
    pub fn with_locks(locks: LockIntentTable) -> Self {
        Self {
            locks: Mutex::new(locks),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LockStore for MemoryLockStore {
    fn find_locked_nodes(&self) -> RmResult<LockIntentTable> {
        Ok(self
            .locks
            .lock()
            .map(|locks| locks.clone())
            .unwrap_or_default())
    }

    fn save_lock(&self, node_source: &str, node_url: &str, intent: &LockIntent) -> RmResult<()> {
        if let Ok(mut locks) = self.locks.lock() {
            locks.insert(
                (node_source.to_string(), node_url.to_string()),
                intent.clone(),
            );
        }
        Ok(())
    }

    fn remove_lock(&self, node_source: &str, node_url: &str) -> RmResult<()> {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&(node_source.to_string(), node_url.to_string()));
        }
        Ok(())
    }

    fn remove_locks_for_source(&self, node_source: &str) -> RmResult<usize> {
        let Ok(mut locks) = self.locks.lock() else {
            return Ok(0);
        };
        let before = locks.len();
        locks.retain(|(source, _), _| source != node_source);
        Ok(before - locks.len())
    }
}

pub struct NodesLockRestorationManager {
    store: Arc<dyn LockStore>,
    enabled: bool,
    initialized: bool,
    /// Intents of the previous run not yet re-applied.
    pending: LockIntentTable,
    restored: usize,
    handled: u64,
}

impl NodesLockRestorationManager {
    pub fn new(store: Arc<dyn LockStore>, enabled: bool) -> Self {
        Self {
            store,
            enabled,
            initialized: false,
            pending: HashMap::new(),
            restored: 0,
            handled: 0,
        }
    }

    /// A manager that never restores or records anything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(MemoryLockStore::new()), false)
    }

    /// Load the intents of the previous run.
    pub fn initialize(&mut self) -> RmResult<()> {
        self.pending = self.store.find_locked_nodes()?;
        self.initialized = true;
        info!(pending = self.pending.len(), "nodes lock restoration initialized");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Intents still waiting for their node.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Locks re-applied during this run.
    pub fn restored_count(&self) -> usize {
        self.restored
    }

    /// Number of nodes passed to [`handle`](Self::handle) so far.
    pub fn handled_count(&self) -> u64 {
        self.handled
    }

    /// Inspect a node that was just freed, went down or was lost.
    ///
    /// Returns the intent to re-apply when the node was locked on the
    /// previous run and has not been restored yet. Each intent is handed
    /// out at most once.
    pub fn handle(&mut self, node: &NodeRecord) -> Option<LockIntent> {
        self.handled += 1;
        if !self.initialized || self.pending.is_empty() {
            return None;
        }

        let key = (node.node_source.clone(), node.url.clone());
        let intent = self.pending.remove(&key)?;
        if node.locked {
            debug!(node_url = %node.url, "node already locked, nothing to restore");
            return None;
        }

        self.restored += 1;
        info!(
            node_url = %node.url,
            locked_by = %intent.locked_by,
            remaining = self.pending.len(),
            "restoring lock from previous run"
        );
        Some(intent)
    }

    /// Drop every intent of a node source that no longer exists, both the
    /// ones still pending and the persisted ones.
    pub fn forget_source(&mut self, node_source: &str) {
        self.pending.retain(|(source, _), _| source != node_source);
        if !self.enabled {
            return;
        }
        match self.store.remove_locks_for_source(node_source) {
            Ok(0) => {}
            Ok(erased) => info!(%node_source, erased, "persisted node locks erased"),
            Err(e) => {
                warn!(%node_source, error = %e, "failed to erase persisted node locks");
            }
        }
    }

    /// Persist the lock just applied to `node`.
    pub fn record_lock(&self, node: &NodeRecord) {
        if !self.enabled {
            return;
        }
        let intent = LockIntent {
            locked_by: node.lock_owner.clone().unwrap_or_default(),
            locked_at: node.locked_at.unwrap_or_default(),
        };
        if let Err(e) = self.store.save_lock(&node.node_source, &node.url, &intent) {
            warn!(node_url = %node.url, error = %e, "failed to persist node lock");
        }
    }

    /// Erase the persisted lock of `node`.
    pub fn record_unlock(&self, node: &NodeRecord) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.store.remove_lock(&node.node_source, &node.url) {
            warn!(node_url = %node.url, error = %e, "failed to erase persisted node lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistration, NodeState};
    use crate::source::LoggingEndpoint;

    fn node(url: &str) -> NodeRecord {
        let reg = NodeRegistration::from_url(url, Arc::new(LoggingEndpoint));
        NodeRecord::new(reg, "static", "p", NodeState::Free)
    }

    fn intents(urls: &[&str]) -> LockIntentTable {
        urls.iter()
            .map(|url| {
                (
                    ("static".to_string(), url.to_string()),
                    LockIntent {
                        locked_by: "admin".to_string(),
                        locked_at: 1000,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn uninitialized_manager_only_observes() {
        let store = Arc::new(MemoryLockStore::with_locks(intents(&["n1"])));
        let mut manager = NodesLockRestorationManager::new(store, false);

        assert!(manager.handle(&node("n1")).is_none());
        assert_eq!(manager.handled_count(), 1);
        assert!(!manager.is_initialized());
    }

    #[test]
    fn restores_each_intent_once() {
        let store = Arc::new(MemoryLockStore::with_locks(intents(&["n1", "n2"])));
        let mut manager = NodesLockRestorationManager::new(store, true);
        manager.initialize().unwrap();
        assert_eq!(manager.pending_count(), 2);

        let intent = manager.handle(&node("n1")).unwrap();
        assert_eq!(intent.locked_by, "admin");
        assert!(manager.handle(&node("n1")).is_none());
        assert!(manager.handle(&node("n3")).is_none());

        assert_eq!(manager.restored_count(), 1);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.handled_count(), 3);
    }

    #[test]
    fn already_locked_nodes_consume_the_intent() {
        let store = Arc::new(MemoryLockStore::with_locks(intents(&["n1"])));
        let mut manager = NodesLockRestorationManager::new(store, true);
        manager.initialize().unwrap();

        let mut locked = node("n1");
        locked.locked = true;
        assert!(manager.handle(&locked).is_none());
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.restored_count(), 0);
    }

    #[test]
    fn records_only_when_enabled() {
        let store = Arc::new(MemoryLockStore::new());
        let mut locked = node("n1");
        locked.locked = true;
        locked.lock_owner = Some("admin".to_string());
        locked.locked_at = Some(42);

        NodesLockRestorationManager::new(store.clone(), false).record_lock(&locked);
        assert!(store.is_empty());

        let manager = NodesLockRestorationManager::new(store.clone(), true);
        manager.record_lock(&locked);
        let saved = store.find_locked_nodes().unwrap();
        assert_eq!(
            saved.get(&("static".to_string(), "n1".to_string())),
            Some(&LockIntent {
                locked_by: "admin".to_string(),
                locked_at: 42,
            })
        );

        manager.record_unlock(&locked);
        assert!(store.is_empty());
    }

    #[test]
    fn state_store_round_trips_intents() {
        let store = StateStore::open_in_memory().unwrap();
        let intent = LockIntent {
            locked_by: "admin".to_string(),
            locked_at: 7,
        };
        store.save_lock("static", "pnp://a/1", &intent).unwrap();
        store.save_lock("cloud", "pnp://b/1", &intent).unwrap();

        let table = store.find_locked_nodes().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(&("static".to_string(), "pnp://a/1".to_string())),
            Some(&intent)
        );

        store.remove_lock("static", "pnp://a/1").unwrap();
        assert_eq!(store.find_locked_nodes().unwrap().len(), 1);
    }

    #[test]
    fn forgetting_a_source_drops_its_intents() {
        let mut table = intents(&["n1", "n2"]);
        table.insert(
            ("cloud".to_string(), "n3".to_string()),
            LockIntent {
                locked_by: "admin".to_string(),
                locked_at: 1000,
            },
        );
        let store = Arc::new(MemoryLockStore::with_locks(table));
        let mut manager = NodesLockRestorationManager::new(store.clone(), true);
        manager.initialize().unwrap();

        manager.forget_source("static");
        assert_eq!(manager.pending_count(), 1);
        assert!(manager.handle(&node("n1")).is_none());
        assert_eq!(
            store.find_locked_nodes().unwrap().into_keys().collect::<Vec<_>>(),
            vec![("cloud".to_string(), "n3".to_string())]
        );
    }

    #[test]
    fn state_store_erases_intents_per_source() {
        let store = StateStore::open_in_memory().unwrap();
        let intent = LockIntent {
            locked_by: "admin".to_string(),
            locked_at: 7,
        };
        store.save_lock("static", "pnp://a/1", &intent).unwrap();
        store.save_lock("static", "pnp://a/2", &intent).unwrap();
        store.save_lock("cloud", "pnp://b/1", &intent).unwrap();

        assert_eq!(store.remove_locks_for_source("static").unwrap(), 2);
        assert_eq!(store.remove_locks_for_source("static").unwrap(), 0);
        assert_eq!(store.find_locked_nodes().unwrap().len(), 1);
    }
}
