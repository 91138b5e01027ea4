//! gridrm-state — embedded state store for the gridrm resource manager.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the state that has to outlive a manager restart. Today that
//! is the set of administratively locked nodes, which the lock restoration
//! manager replays when nodes come back.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns under
//! composite `{node_source}/{node_url}` keys, so all locks of one node
//! source can be found with a prefix scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
