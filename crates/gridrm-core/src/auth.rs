//! Caller identity and permission checks.
//!
//! Authentication happens outside the manager. Operations only see a
//! [`Client`] and ask the configured [`Authorizer`] whether it may act on
//! a resource; a refusal is returned before any state is touched.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name the manager uses when it acts on its own behalf.
const INTERNAL_CLIENT: &str = "rm";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Client {
    name: String,
}

impl Client {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The resource manager itself.
    pub fn internal() -> Self {
        Self::new(INTERNAL_CLIENT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_internal(&self) -> bool {
        self.name == INTERNAL_CLIENT
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Permissions consulted by gated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Acquire and release nodes.
    NodeUsage,
    /// Lock, unlock and remove nodes.
    NodeAdmin,
    /// Contribute nodes to a node source.
    NodeProvider,
    /// Register and remove node sources.
    NodeSourceAdmin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::NodeUsage => "node usage",
            Permission::NodeAdmin => "node admin",
            Permission::NodeProvider => "node provider",
            Permission::NodeSourceAdmin => "node source admin",
        };
        f.write_str(s)
    }
}

/// Decides whether a caller may exercise a permission on a resource.
///
/// `resource_owner` is the name of the client owning the resource (the
/// provider of a node, the holder of a busy node), when there is one.
pub trait Authorizer: Send + Sync {
    fn check_permission(
        &self,
        caller: &Client,
        permission: Permission,
        resource_owner: Option<&str>,
    ) -> bool;
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check_permission(&self, _: &Client, _: Permission, _: Option<&str>) -> bool {
        true
    }
}

/// Administrators may do anything; everybody else only acts on resources
/// they own, and never on node sources.
#[derive(Debug, Default, Clone)]
pub struct OwnerOrAdmin {
    admins: HashSet<String>,
}

impl OwnerOrAdmin {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for OwnerOrAdmin {
    fn check_permission(
        &self,
        caller: &Client,
        permission: Permission,
        resource_owner: Option<&str>,
    ) -> bool {
        if caller.is_internal() || self.admins.contains(caller.name()) {
            return true;
        }
        match permission {
            Permission::NodeSourceAdmin => false,
            Permission::NodeUsage | Permission::NodeProvider => {
                resource_owner.is_none_or(|owner| owner == caller.name())
            }
            Permission::NodeAdmin => resource_owner == Some(caller.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_client_is_recognised() {
        assert!(Client::internal().is_internal());
        assert!(!Client::new("alice").is_internal());
    }

    #[test]
    fn owner_or_admin_grants_admins_everything() {
        let auth = OwnerOrAdmin::new(["root"]);
        let root = Client::new("root");
        assert!(auth.check_permission(&root, Permission::NodeSourceAdmin, None));
        assert!(auth.check_permission(&root, Permission::NodeAdmin, Some("bob")));
    }

    #[test]
    fn owner_or_admin_restricts_others_to_their_resources() {
        let auth = OwnerOrAdmin::new(["root"]);
        let alice = Client::new("alice");

        assert!(auth.check_permission(&alice, Permission::NodeAdmin, Some("alice")));
        assert!(!auth.check_permission(&alice, Permission::NodeAdmin, Some("bob")));
        assert!(!auth.check_permission(&alice, Permission::NodeAdmin, None));
        assert!(auth.check_permission(&alice, Permission::NodeUsage, None));
        assert!(!auth.check_permission(&alice, Permission::NodeUsage, Some("bob")));
        assert!(!auth.check_permission(&alice, Permission::NodeSourceAdmin, None));
    }

    #[test]
    fn internal_client_bypasses_checks() {
        let auth = OwnerOrAdmin::default();
        assert!(auth.check_permission(
            &Client::internal(),
            Permission::NodeSourceAdmin,
            None
        ));
    }
}
