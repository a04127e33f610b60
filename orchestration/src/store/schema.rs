//! Column families and key layout for the checkpoint store.
//!
//! Keys are built so a prefix scan returns rows in the order queries
//! need: checkpoints sort by (session, created-at, id), executions by
//! (session, story). Secondary `*id:` keys index rows by bare id.

/// Session rows.
pub const CF_SESSIONS: &str = "wave_sessions";

/// Checkpoint rows plus their id index.
pub const CF_CHECKPOINTS: &str = "wave_checkpoints";

/// Story execution rows plus their id index.
pub const CF_EXECUTIONS: &str = "wave_story_executions";

/// All column families, for open-time registration.
pub const ALL_CFS: &[&str] = &[CF_SESSIONS, CF_CHECKPOINTS, CF_EXECUTIONS];

pub mod keys {
    /// Session row key.
    pub fn session(session_id: &str) -> String {
        format!("sess:{session_id}")
    }

    pub const SESSION_PREFIX: &str = "sess:";

    /// Checkpoint row key, ordered by creation time with the id as a
    /// deterministic tie-break.
    pub fn checkpoint(session_id: &str, created_at_nanos: i64, checkpoint_id: &str) -> String {
        format!("cp:{session_id}:{created_at_nanos:020}:{checkpoint_id}")
    }

    /// Prefix covering every checkpoint of a session.
    pub fn checkpoint_prefix(session_id: &str) -> String {
        format!("cp:{session_id}:")
    }

    /// Index entry mapping a checkpoint id to its row key.
    pub fn checkpoint_index(checkpoint_id: &str) -> String {
        format!("cpid:{checkpoint_id}")
    }

    /// Execution row key.
    pub fn execution(session_id: &str, story_id: &str) -> String {
        format!("exec:{session_id}:{story_id}")
    }

    /// Prefix covering every execution of a session.
    pub fn execution_prefix(session_id: &str) -> String {
        format!("exec:{session_id}:")
    }

    /// Index entry mapping an execution id to its row key.
    pub fn execution_index(execution_id: &str) -> String {
        format!("execid:{execution_id}")
    }
}
