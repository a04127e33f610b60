//! Durable checkpoint store.
//!
//! Persists sessions, checkpoints, and story executions in an embedded
//! column-family backend. Rows are serialized as JSON for debuggability.
//! All mutations go through the store; multi-row mutations use an atomic
//! write batch so a story mutation and its checkpoint commit together.

mod schema;
mod store;
mod types;

pub use schema::{CF_CHECKPOINTS, CF_EXECUTIONS, CF_SESSIONS};
pub use store::{NewCheckpoint, SharedStateStore, StateStore, StoreBatch};
pub use types::{
    CheckpointType, SessionStatus, StoryExecution, StoryStatus, WaveCheckpoint, WaveSession,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
