//! Lock manager — administrative locks on top of the registry.
//!
//! Locking is guarded, not toggling: locking a locked node or unlocking an
//! unlocked one changes nothing and reports a failure, so a batch caller can
//! tell that part of its request had no effect. Locks are independent of the
//! node state; they only decide free pool membership of FREE nodes.

use tracing::{debug, info};

use crate::auth::Client;
use crate::node::epoch_secs;
use crate::registry::NodeRegistry;

/// Result of a single lock or unlock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock status changed.
    Applied,
    AlreadyLocked,
    NotLocked,
    UnknownNode,
}

impl LockOutcome {
    pub fn is_applied(self) -> bool {
        self == LockOutcome::Applied
    }
}

/// Lock `url` on behalf of `by`, evicting it from the free pool.
pub fn lock_node(registry: &mut NodeRegistry, url: &str, by: &Client) -> LockOutcome {
    let outcome = registry.update(url, |node| {
        if node.locked {
            return LockOutcome::AlreadyLocked;
        }
        node.locked = true;
        node.lock_owner = Some(by.name().to_string());
        node.locked_at = Some(epoch_secs());
        LockOutcome::Applied
    });

    match outcome {
        Some(LockOutcome::Applied) => {
            info!(node_url = %url, by = %by, "node locked");
            LockOutcome::Applied
        }
        Some(other) => {
            debug!(node_url = %url, "node already locked");
            other
        }
        None => {
            debug!(node_url = %url, "cannot lock unknown node");
            LockOutcome::UnknownNode
        }
    }
}

/// Unlock `url`, returning it to the free pool if it is FREE.
pub fn unlock_node(registry: &mut NodeRegistry, url: &str, by: &Client) -> LockOutcome {
    let outcome = registry.update(url, |node| {
        if !node.locked {
            return LockOutcome::NotLocked;
        }
        node.locked = false;
        node.lock_owner = None;
        node.locked_at = None;
        LockOutcome::Applied
    });

    match outcome {
        Some(LockOutcome::Applied) => {
            info!(node_url = %url, by = %by, "node unlocked");
            LockOutcome::Applied
        }
        Some(other) => {
            debug!(node_url = %url, "node not locked");
            other
        }
        None => {
            debug!(node_url = %url, "cannot unlock unknown node");
            LockOutcome::UnknownNode
        }
    }
}
