//! gridrm-core — the resource manager core.
//!
//! Tracks every compute node contributed by the node sources, hands free
//! nodes to requesters, and keeps the fleet consistent across node failures,
//! administrative locks and restarts.
//!
//! # Architecture
//!
//! ```text
//! RmHandle (per caller) ──commands──► core task ──owns──► RmCore
//!                                        │                  │
//!                     spawned calls ◄────┘                  ├── NodeRegistry + free pool
//!   (node sources, node endpoints)                          ├── CapacityEnforcer
//!                                                           ├── lock manager
//!                                                           ├── NodesLockRestorationManager ──► LockStore
//!                                                           └── EventBus ──► EventDispatcher ──► RmMonitor
//! ```
//!
//! All registry mutations happen on the core task, one command at a time.

pub mod actor;
pub mod auth;
pub mod capacity;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod node;
pub mod registry;
pub mod restoration;
pub mod rm_core;
pub mod selection;
pub mod source;

pub use actor::{ResourceManager, ResourceManagerBuilder, RmHandle};
pub use auth::{AllowAll, Authorizer, Client, OwnerOrAdmin, Permission};
pub use capacity::{CapacityEnforcer, CapacityLimit};
pub use config::{ConfigError, CoreConfig, NodeSourceConfig, RmConfig, StateConfig};
pub use error::{AddingNodesError, RmError, RmResult};
pub use event::{EventBus, EventDispatcher, LoggingMonitor, RmEvent, RmMonitor};
pub use lock::LockOutcome;
pub use node::{
    deploying_url, parse_deploying_url, NodeRecord, NodeRegistration, NodeSet, NodeState,
    NodeView, DEPLOYING_PROTOCOL,
};
pub use registry::{NodeRegistry, RmState};
pub use restoration::{LockIntent, LockStore, MemoryLockStore, NodesLockRestorationManager};
pub use rm_core::{OutboundCall, RmCore};
pub use selection::{Criteria, FirstFitSelector, NodeSelector, TopologyDescriptor};
pub use source::{BoxFuture, LoggingEndpoint, NodeEndpoint, NodeSource, StaticNodeSource};
