//! Errors raised by the lock record store.
//!
//! redb and serde_json errors are flattened to strings so callers in the
//! resource manager core only ever match on the stage that failed.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The redb file could not be created or opened.
    #[error("cannot open lock record store: {0}")]
    Open(String),

    #[error("lock record transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open locked_nodes table: {0}")]
    Table(String),

    #[error("reading lock records failed: {0}")]
    Read(String),

    #[error("writing lock record failed: {0}")]
    Write(String),

    #[error("cannot encode lock record: {0}")]
    Serialize(String),

    /// A stored record no longer matches `LockedNodeRecord`.
    #[error("corrupt lock record: {0}")]
    Deserialize(String),
}
