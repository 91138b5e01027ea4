//! Node records and the node state machine.
//!
//! A [`NodeRecord`] is owned by the registry and keyed by its URL; the rest
//! of the system only ever sees [`NodeView`] projections. Every state change
//! goes through [`NodeRecord::transition`], which enforces the transition
//! table below.
//!
//! ```text
//! DEPLOYING ──► FREE ◄──► BUSY ──► TO_BE_REMOVED
//!     │          │  ▲       │            │
//!     │          │  └─ re-registration   │
//!     ▼          ▼          ▼            ▼
//!   DOWN / LOST (any live state may fail) ──► removed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::NodeEndpoint;

/// URL scheme of nodes that are still being provisioned by their source.
pub const DEPLOYING_PROTOCOL: &str = "deploying";

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Deploying,
    Free,
    Busy,
    /// Busy, and evicted instead of freed once its holder lets go.
    ToBeRemoved,
    Down,
    Lost,
}

/// Mutually exclusive buckets used for fleet accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeCategory {
    Free,
    Busy,
    Down,
    Deploying,
}

impl NodeState {
    pub fn category(self) -> NodeCategory {
        match self {
            NodeState::Free => NodeCategory::Free,
            NodeState::Busy | NodeState::ToBeRemoved => NodeCategory::Busy,
            NodeState::Down | NodeState::Lost => NodeCategory::Down,
            NodeState::Deploying => NodeCategory::Deploying,
        }
    }

    /// Whether the node has failed (DOWN or LOST).
    pub fn is_down(self) -> bool {
        self.category() == NodeCategory::Down
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// Staying in the same state is always allowed and is a no-op.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Deploying, Free | Down | Lost)
                | (Free, Busy | Down | Lost)
                | (Busy, Free | ToBeRemoved | Down | Lost)
                | (ToBeRemoved, Down | Lost)
                | (Down, Free | Lost)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Deploying => "DEPLOYING",
            NodeState::Free => "FREE",
            NodeState::Busy => "BUSY",
            NodeState::ToBeRemoved => "TO_BE_REMOVED",
            NodeState::Down => "DOWN",
            NodeState::Lost => "LOST",
        };
        f.write_str(s)
    }
}

/// A transition rejected by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition of {node_url}: {from} -> {to}")]
pub struct IllegalTransition {
    pub node_url: String,
    pub from: NodeState,
    pub to: NodeState,
}

/// What a node source hands back once it has provisioned a node.
#[derive(Clone)]
pub struct NodeRegistration {
    pub url: String,
    pub name: String,
    pub host: String,
    /// Handle to the underlying resource.
    pub endpoint: Arc<dyn NodeEndpoint>,
}

impl NodeRegistration {
    /// Build a registration deriving name and host from a node URL of the
    /// form `scheme://host[:port]/name`.
    pub fn from_url(url: &str, endpoint: Arc<dyn NodeEndpoint>) -> Self {
        let (host, name) = split_node_url(url);
        Self {
            url: url.to_string(),
            name: name.to_string(),
            host: host.to_string(),
            endpoint,
        }
    }
}

impl fmt::Debug for NodeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistration")
            .field("url", &self.url)
            .field("name", &self.name)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Authoritative record of one node, owned by the registry.
pub struct NodeRecord {
    pub url: String,
    pub name: String,
    pub host: String,
    /// Name of the node source this node belongs to.
    pub node_source: String,
    state: NodeState,
    pub locked: bool,
    /// Client that applied the current lock.
    pub lock_owner: Option<String>,
    pub locked_at: Option<u64>,
    /// Client currently holding the node (set while BUSY).
    pub owner: Option<String>,
    /// Client that contributed the node.
    pub provider: String,
    pub state_changed_at: u64,
    /// `None` for placeholders whose resource does not exist yet.
    pub endpoint: Option<Arc<dyn NodeEndpoint>>,
}

impl NodeRecord {
    /// A freshly registered node in the given initial state.
    pub fn new(
        registration: NodeRegistration,
        node_source: &str,
        provider: &str,
        state: NodeState,
    ) -> Self {
        Self {
            url: registration.url,
            name: registration.name,
            host: registration.host,
            node_source: node_source.to_string(),
            state,
            locked: false,
            lock_owner: None,
            locked_at: None,
            owner: None,
            provider: provider.to_string(),
            state_changed_at: epoch_secs(),
            endpoint: Some(registration.endpoint),
        }
    }

    /// A DEPLOYING placeholder for a node its source is still provisioning.
    pub fn deploying(url: &str, node_source: &str, provider: &str) -> Self {
        let (host, name) = split_node_url(url);
        Self {
            url: url.to_string(),
            name: name.to_string(),
            host: host.to_string(),
            node_source: node_source.to_string(),
            state: NodeState::Deploying,
            locked: false,
            lock_owner: None,
            locked_at: None,
            owner: None,
            provider: provider.to_string(),
            state_changed_at: epoch_secs(),
            endpoint: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: NodeState) -> Result<NodeState, IllegalTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(IllegalTransition {
                node_url: self.url.clone(),
                from,
                to,
            });
        }
        if from != to {
            self.state = to;
            self.state_changed_at = epoch_secs();
        }
        Ok(from)
    }

    /// Whether the node belongs in the free pool: FREE and not locked.
    pub fn is_schedulable(&self) -> bool {
        self.state == NodeState::Free && !self.locked
    }

    /// Replace the provisioning details after a re-registration.
    pub fn refresh(&mut self, registration: NodeRegistration, provider: &str) {
        self.name = registration.name;
        self.host = registration.host;
        self.endpoint = Some(registration.endpoint);
        self.provider = provider.to_string();
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            url: self.url.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            node_source: self.node_source.clone(),
            state: self.state,
            locked: self.locked,
            lock_owner: self.lock_owner.clone(),
            owner: self.owner.clone(),
            provider: self.provider.clone(),
        }
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("url", &self.url)
            .field("node_source", &self.node_source)
            .field("state", &self.state)
            .field("locked", &self.locked)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of a node, safe to hand out of the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub url: String,
    pub name: String,
    pub host: String,
    pub node_source: String,
    pub state: NodeState,
    pub locked: bool,
    pub lock_owner: Option<String>,
    pub owner: Option<String>,
    pub provider: String,
}

/// A set of nodes handed to a requester.
pub type NodeSet = Vec<NodeView>;

/// URL of a node that `node_source` is still provisioning.
pub fn deploying_url(node_source: &str, node_name: &str) -> String {
    format!("{DEPLOYING_PROTOCOL}://{node_source}/{node_name}")
}

/// Split a deploying URL into `(node_source, node_name)`.
pub fn parse_deploying_url(url: &str) -> Option<(&str, &str)> {
    let rest = url
        .strip_prefix(DEPLOYING_PROTOCOL)?
        .strip_prefix("://")?;
    let (source, name) = rest.split_once('/')?;
    if source.is_empty() || name.is_empty() {
        return None;
    }
    Some((source, name))
}

/// Split `scheme://host[:port]/path/name` into `(host, name)`.
///
/// Anything that does not look like a URL is both its own host and name.
fn split_node_url(url: &str) -> (&str, &str) {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = authority.split(':').next().unwrap_or(authority);
    let name = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(rest);
    (host, name)
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
