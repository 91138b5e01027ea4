//! Node registry — the authoritative node table and the free pool.
//!
//! Nodes are stored by URL. The free pool is a set of URLs kept in step
//! with the node table: after every mutation made through the registry a
//! node is in the pool exactly when it is FREE and unlocked. Node sources
//! are stored by name; nodes refer to their source by name only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::node::{NodeCategory, NodeRecord, NodeView};
use crate::source::NodeSource;

/// Fleet snapshot, computed on demand from the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmState {
    pub total_nodes: usize,
    pub free_nodes: usize,
    /// Total minus DOWN and LOST nodes.
    pub alive_nodes: usize,
    pub busy_nodes: usize,
    pub down_nodes: usize,
    pub deploying_nodes: usize,
    pub locked_nodes: usize,
    pub node_sources: usize,
}

struct SourceEntry {
    source: Arc<dyn NodeSource>,
    /// Set by a graceful removal; the entry goes away with its last node.
    shutting_down: bool,
}

/// Node table, free pool and node sources.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, NodeRecord>,
    free: BTreeSet<String>,
    sources: BTreeMap<String, SourceEntry>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Node sources ───────────────────────────────────────────────

    /// Register a node source. Returns false if the name is taken.
    pub fn add_source(&mut self, source: Arc<dyn NodeSource>) -> bool {
        let name = source.name().to_string();
        if self.sources.contains_key(&name) {
            return false;
        }
        self.sources.insert(
            name,
            SourceEntry {
                source,
                shutting_down: false,
            },
        );
        true
    }

    /// A registered node source, including one that is shutting down.
    pub fn source(&self, name: &str) -> Option<&Arc<dyn NodeSource>> {
        self.sources.get(name).map(|entry| &entry.source)
    }

    /// A node source that still accepts new nodes.
    pub fn accepting_source(&self, name: &str) -> Option<&Arc<dyn NodeSource>> {
        self.sources
            .get(name)
            .filter(|entry| !entry.shutting_down)
            .map(|entry| &entry.source)
    }

    pub fn is_source_shutting_down(&self, name: &str) -> bool {
        self.sources.get(name).is_some_and(|entry| entry.shutting_down)
    }

    /// Stop a source from accepting nodes. Returns false if unknown.
    pub fn mark_source_shutting_down(&mut self, name: &str) -> bool {
        match self.sources.get_mut(name) {
            Some(entry) => {
                entry.shutting_down = true;
                true
            }
            None => false,
        }
    }

    pub fn remove_source(&mut self, name: &str) -> Option<Arc<dyn NodeSource>> {
        self.sources.remove(name).map(|entry| entry.source)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// URLs of all nodes belonging to a source.
    pub fn nodes_of_source(&self, name: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.node_source == name)
            .map(|node| node.url.clone())
            .collect()
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn contains(&self, url: &str) -> bool {
        self.nodes.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<&NodeRecord> {
        self.nodes.get(url)
    }

    /// Insert (or replace) a node record.
    pub fn insert(&mut self, node: NodeRecord) {
        let url = node.url.clone();
        self.nodes.insert(url.clone(), node);
        self.sync_free_pool(&url);
    }

    /// Mutate a node in place, re-syncing its free pool membership afterwards.
    pub fn update<R>(&mut self, url: &str, f: impl FnOnce(&mut NodeRecord) -> R) -> Option<R> {
        let result = f(self.nodes.get_mut(url)?);
        self.sync_free_pool(url);
        Some(result)
    }

    /// Delete a node record and evict it from the free pool.
    pub fn remove(&mut self, url: &str) -> Option<NodeRecord> {
        self.free.remove(url);
        self.nodes.remove(url)
    }

    pub fn all_views(&self) -> Vec<NodeView> {
        self.nodes.values().map(NodeRecord::view).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ── Free pool ──────────────────────────────────────────────────

    pub fn is_free(&self, url: &str) -> bool {
        self.free.contains(url)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Snapshot of the free pool.
    pub fn free_views(&self) -> Vec<NodeView> {
        self.free
            .iter()
            .filter_map(|url| self.nodes.get(url))
            .map(NodeRecord::view)
            .collect()
    }

    fn sync_free_pool(&mut self, url: &str) {
        let schedulable = self.nodes.get(url).is_some_and(NodeRecord::is_schedulable);
        let changed = if schedulable {
            self.free.insert(url.to_string())
        } else {
            self.free.remove(url)
        };
        if changed {
            debug!(node_url = %url, free = schedulable, "free pool updated");
        }
    }

    // ── Accounting ─────────────────────────────────────────────────

    pub fn snapshot(&self) -> RmState {
        let mut state = RmState {
            total_nodes: self.len(),
            free_nodes: self.free.len(),
            node_sources: self.sources.len(),
            ..RmState::default()
        };
        for node in self.nodes.values() {
            match node.state().category() {
                NodeCategory::Busy => state.busy_nodes += 1,
                NodeCategory::Down => state.down_nodes += 1,
                NodeCategory::Deploying => state.deploying_nodes += 1,
                NodeCategory::Free => {}
            }
            if node.locked {
                state.locked_nodes += 1;
            }
        }
        state.alive_nodes = state.total_nodes - state.down_nodes;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistration, NodeState};
    use crate::source::{LoggingEndpoint, StaticNodeSource};

    fn record(url: &str, state: NodeState) -> NodeRecord {
        let registration = NodeRegistration::from_url(url, Arc::new(LoggingEndpoint));
        NodeRecord::new(registration, "static", "provider", state)
    }

    #[test]
    fn insert_keeps_free_pool_in_step() {
        let mut registry = NodeRegistry::new();
        registry.insert(record("n1", NodeState::Free));
        registry.insert(record("n2", NodeState::Busy));

        assert!(registry.is_free("n1"));
        assert!(!registry.is_free("n2"));
        assert_eq!(registry.free_count(), 1);
    }

    #[test]
    fn update_resyncs_membership() {
        let mut registry = NodeRegistry::new();
        registry.insert(record("n1", NodeState::Free));

        registry.update("n1", |node| node.locked = true).unwrap();
        assert!(!registry.is_free("n1"));

        registry.update("n1", |node| node.locked = false).unwrap();
        assert!(registry.is_free("n1"));

        registry
            .update("n1", |node| node.transition(NodeState::Down))
            .unwrap()
            .unwrap();
        assert!(!registry.is_free("n1"));
    }

    #[test]
    fn update_of_unknown_node_is_none() {
        let mut registry = NodeRegistry::new();
        assert!(registry.update("nope", |node| node.locked = true).is_none());
    }

    #[test]
    fn remove_evicts_from_free_pool() {
        let mut registry = NodeRegistry::new();
        registry.insert(record("n1", NodeState::Free));

        assert!(registry.remove("n1").is_some());
        assert!(!registry.is_free("n1"));
        assert!(registry.remove("n1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_counts_buckets() {
        let mut registry = NodeRegistry::new();
        registry.insert(record("f1", NodeState::Free));
        registry.insert(record("f2", NodeState::Free));
        registry.insert(record("b1", NodeState::Busy));
        registry.insert(record("d1", NodeState::Down));
        registry.insert(record("l1", NodeState::Lost));
        registry.insert(NodeRecord::deploying("deploying://static/p1", "static", "provider"));
        registry.update("f2", |node| node.locked = true).unwrap();

        let state = registry.snapshot();
        assert_eq!(state.total_nodes, 6);
        assert_eq!(state.free_nodes, 1);
        assert_eq!(state.busy_nodes, 1);
        assert_eq!(state.down_nodes, 2);
        assert_eq!(state.deploying_nodes, 1);
        assert_eq!(state.alive_nodes, 4);
        assert_eq!(state.locked_nodes, 1);
    }

    #[test]
    fn sources_are_unique_and_can_shut_down() {
        let mut registry = NodeRegistry::new();
        assert!(registry.add_source(StaticNodeSource::new("static")));
        assert!(!registry.add_source(StaticNodeSource::new("static")));

        assert!(registry.accepting_source("static").is_some());
        assert!(registry.mark_source_shutting_down("static"));
        assert!(registry.accepting_source("static").is_none());
        assert!(registry.source("static").is_some());
        assert!(registry.is_source_shutting_down("static"));

        assert!(registry.remove_source("static").is_some());
        assert!(registry.source_names().is_empty());
        assert!(!registry.mark_source_shutting_down("static"));
    }

    #[test]
    fn nodes_of_source_filters_by_name() {
        let mut registry = NodeRegistry::new();
        registry.insert(record("n1", NodeState::Free));
        let mut other = record("n2", NodeState::Free);
        other.node_source = "cloud".to_string();
        registry.insert(other);

        assert_eq!(registry.nodes_of_source("static"), vec!["n1".to_string()]);
        assert_eq!(registry.nodes_of_source("cloud"), vec!["n2".to_string()]);
    }
}
