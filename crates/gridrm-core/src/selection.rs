//! Node selection — which free nodes satisfy a request.
//!
//! The core hands the selector a snapshot of the free pool and takes back a
//! list of URLs; it never lets the selector touch the pool itself. Anything
//! returned that is not free any more is ignored by the core.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::auth::Client;
use crate::node::NodeView;

/// Placement constraint between the selected nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyDescriptor {
    #[default]
    Arbitrary,
    /// All nodes on one host.
    SingleHost,
}

/// A request for nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    /// Number of nodes wanted. Negative counts are rejected by the core.
    pub size: i32,
    pub topology: TopologyDescriptor,
    /// Only take nodes from these sources (empty = any).
    pub node_sources: BTreeSet<String>,
    /// Only take nodes on these hosts (empty = any).
    pub hosts: BTreeSet<String>,
    /// URLs that must not be selected.
    pub exclusion: BTreeSet<String>,
    /// Accept fewer nodes than `size`.
    pub best_effort: bool,
}

impl Criteria {
    pub fn new(size: i32) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn topology(mut self, topology: TopologyDescriptor) -> Self {
        self.topology = topology;
        self
    }

    pub fn from_sources<I: IntoIterator<Item = String>>(mut self, sources: I) -> Self {
        self.node_sources.extend(sources);
        self
    }

    pub fn on_hosts<I: IntoIterator<Item = String>>(mut self, hosts: I) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn exclude<I: IntoIterator<Item = String>>(mut self, urls: I) -> Self {
        self.exclusion.extend(urls);
        self
    }

    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    /// Whether `node` passes the source, host and exclusion filters.
    pub fn accepts(&self, node: &NodeView) -> bool {
        !self.exclusion.contains(&node.url)
            && (self.node_sources.is_empty() || self.node_sources.contains(&node.node_source))
            && (self.hosts.is_empty() || self.hosts.contains(&node.host))
    }
}

/// Picks nodes out of the free pool.
pub trait NodeSelector: Send + Sync {
    fn select_nodes(
        &self,
        criteria: &Criteria,
        requester: &Client,
        free_nodes: &[NodeView],
    ) -> Vec<String>;
}

/// Takes the first matching nodes in URL order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFitSelector;

impl NodeSelector for FirstFitSelector {
    fn select_nodes(
        &self,
        criteria: &Criteria,
        _requester: &Client,
        free_nodes: &[NodeView],
    ) -> Vec<String> {
        let wanted = usize::try_from(criteria.size).unwrap_or(0);
        let candidates = free_nodes.iter().filter(|node| criteria.accepts(node));

        match criteria.topology {
            TopologyDescriptor::Arbitrary => candidates
                .take(wanted)
                .map(|node| node.url.clone())
                .collect(),
            TopologyDescriptor::SingleHost => {
                let mut by_host: BTreeMap<&str, Vec<&NodeView>> = BTreeMap::new();
                for node in candidates {
                    by_host.entry(node.host.as_str()).or_default().push(node);
                }
                // Smallest host that fits, otherwise the largest one.
                let fitting = by_host
                    .values()
                    .filter(|nodes| nodes.len() >= wanted)
                    .min_by_key(|nodes| nodes.len());
                let chosen = fitting.or_else(|| by_host.values().max_by_key(|nodes| nodes.len()));
                chosen
                    .map(|nodes| {
                        nodes
                            .iter()
                            .take(wanted)
                            .map(|node| node.url.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    }
}
