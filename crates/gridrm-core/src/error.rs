//! Resource manager error types.

use thiserror::Error;

use crate::auth::Permission;
use crate::config::ConfigError;

/// Reasons a node could not be admitted into the registry.
///
/// Both variants are fatal to the add call that raised them and are
/// raised before the registry is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddingNodesError {
    #[error("cannot add node {node_url}: maximum number of nodes ({maximum}) reached")]
    CapacityExceeded { node_url: String, maximum: u64 },

    #[error("cannot add node {node_url}: unknown node source {node_source}")]
    UnknownNodeSource {
        node_url: String,
        node_source: String,
    },
}

/// Errors returned by resource manager operations.
#[derive(Debug, Error)]
pub enum RmError {
    #[error(transparent)]
    AddingNodes(#[from] AddingNodesError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{caller} does not hold the {permission} permission")]
    PermissionDenied {
        caller: String,
        permission: Permission,
    },

    #[error("resource manager is not running")]
    Unavailable,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("state store error: {0}")]
    Persistence(#[from] gridrm_state::StateError),
}

pub type RmResult<T> = Result<T, RmError>;
