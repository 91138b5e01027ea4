//! Capacity enforcer — the fleet-size ceiling.
//!
//! The ceiling bounds the number of schedulable nodes (the free pool). A
//! candidate is admitted when the pool size after admission stays within the
//! ceiling. Only a candidate that admission would put into the pool counts:
//! a fresh node, or an unlocked DEPLOYING or DOWN node about to be promoted
//! to FREE. Re-registering a node that is already free, in use or locked
//! adds nothing.

use std::fmt;

use tracing::warn;

use crate::error::AddingNodesError;
use crate::node::NodeState;
use crate::registry::NodeRegistry;

/// Validated form of `maximum_number_of_nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityLimit {
    #[default]
    Unlimited,
    AtMost(u64),
}

impl CapacityLimit {
    /// Interpret the configured value: absent or `-1` is unlimited, other
    /// negative values are rejected.
    pub fn from_config(value: Option<i64>) -> Option<Self> {
        match value {
            None | Some(-1) => Some(CapacityLimit::Unlimited),
            Some(n) if n >= 0 => Some(CapacityLimit::AtMost(n as u64)),
            Some(_) => None,
        }
    }
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityLimit::Unlimited => f.write_str("unlimited"),
            CapacityLimit::AtMost(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityEnforcer {
    limit: CapacityLimit,
}

impl CapacityEnforcer {
    pub fn new(limit: CapacityLimit) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> CapacityLimit {
        self.limit
    }

    pub fn set_limit(&mut self, limit: CapacityLimit) {
        self.limit = limit;
    }

    /// Decide whether `candidate_url` may be admitted.
    pub fn check_capacity(
        &self,
        candidate_url: &str,
        registry: &NodeRegistry,
    ) -> Result<(), AddingNodesError> {
        let CapacityLimit::AtMost(maximum) = self.limit else {
            return Ok(());
        };

        let joins_pool = joins_free_pool(candidate_url, registry);
        let after = registry.free_count() as u64 + u64::from(joins_pool);
        if after > maximum {
            warn!(
                node_url = %candidate_url,
                maximum,
                schedulable = after,
                "node refused, capacity ceiling reached"
            );
            return Err(AddingNodesError::CapacityExceeded {
                node_url: candidate_url.to_string(),
                maximum,
            });
        }
        Ok(())
    }
}

/// Whether registering `url` would add it to the free pool.
fn joins_free_pool(url: &str, registry: &NodeRegistry) -> bool {
    match registry.get(url) {
        None => true,
        Some(node) => {
            !node.locked && matches!(node.state(), NodeState::Deploying | NodeState::Down)
        }
    }
}
