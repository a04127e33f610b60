//! Embedded column-family store with atomic write batches.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::execution::gates::GATE_SEQUENCE;

use super::schema::{self, keys, ALL_CFS};
use super::types::*;
use super::{StoreError, StoreResult};

/// Shared reference to a [`StateStore`].
pub type SharedStateStore = Arc<StateStore>;

/// Fields for a new checkpoint; the id and timestamp are assigned by the
/// store.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub session_id: String,
    pub checkpoint_type: CheckpointType,
    pub checkpoint_name: String,
    pub state: Value,
    pub story_id: Option<String>,
    pub gate: Option<String>,
    pub agent_id: Option<String>,
    pub parent_checkpoint_id: Option<String>,
}

enum BatchOp {
    Put {
        cf: &'static str,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: String,
    },
}

/// Queued mutations applied atomically on [`commit`](StoreBatch::commit).
///
/// This is how the checkpointing contract is kept: a story mutation and
/// the checkpoint recording it go into one batch, so readers see both or
/// neither.
pub struct StoreBatch<'a> {
    store: &'a StateStore,
    ops: Vec<BatchOp>,
}

impl<'a> StoreBatch<'a> {
    pub fn put_session(&mut self, session: &WaveSession) -> StoreResult<()> {
        self.ops.push(BatchOp::Put {
            cf: schema::CF_SESSIONS,
            key: keys::session(&session.id),
            value: encode(session)?,
        });
        Ok(())
    }

    pub fn put_execution(&mut self, execution: &StoryExecution) -> StoreResult<()> {
        let row_key = keys::execution(&execution.session_id, &execution.story_id);
        self.ops.push(BatchOp::Put {
            cf: schema::CF_EXECUTIONS,
            key: row_key.clone(),
            value: encode(execution)?,
        });
        self.ops.push(BatchOp::Put {
            cf: schema::CF_EXECUTIONS,
            key: keys::execution_index(&execution.id),
            value: row_key.into_bytes(),
        });
        Ok(())
    }

    /// Validate and queue a checkpoint write. Returns the checkpoint as
    /// it will be persisted.
    pub fn put_checkpoint(&mut self, new: NewCheckpoint) -> StoreResult<WaveCheckpoint> {
        let checkpoint = self.store.build_checkpoint(new)?;
        let row_key = keys::checkpoint(
            &checkpoint.session_id,
            checkpoint.created_at.timestamp_nanos_opt().unwrap_or(0),
            &checkpoint.id,
        );
        self.ops.push(BatchOp::Put {
            cf: schema::CF_CHECKPOINTS,
            key: row_key.clone(),
            value: encode(&checkpoint)?,
        });
        self.ops.push(BatchOp::Put {
            cf: schema::CF_CHECKPOINTS,
            key: keys::checkpoint_index(&checkpoint.id),
            value: row_key.into_bytes(),
        });
        Ok(checkpoint)
    }

    fn delete(&mut self, cf: &'static str, key: String) {
        self.ops.push(BatchOp::Delete { cf, key });
    }

    /// Apply every queued mutation atomically.
    pub fn commit(self) -> StoreResult<()> {
        let db = self.store.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut batch = WriteBatch::default();
        for op in &self.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let handle = db
                        .cf_handle(cf)
                        .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.to_string()))?;
                    batch.put_cf(&handle, key.as_bytes(), value);
                }
                BatchOp::Delete { cf, key } => {
                    let handle = db
                        .cf_handle(cf)
                        .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.to_string()))?;
                    batch.delete_cf(&handle, key.as_bytes());
                }
            }
        }
        db.write(batch)?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Embedded persistent store for sessions, checkpoints, and executions.
pub struct StateStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl StateStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store.
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Start an atomic batch of mutations.
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            store: self,
            ops: Vec::new(),
        }
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), encode(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_raw(&self, cf_name: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        Ok(db.get_cf(&cf, key.as_bytes())?)
    }

    /// Scan rows under a key prefix, in key order.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &str,
    ) -> StoreResult<Vec<(String, T)>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut rows = Vec::new();
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for result in iter {
            let (key, value) = result?;
            let key = String::from_utf8_lossy(&key).to_string();
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, decode(&value)?));
        }
        Ok(rows)
    }

    fn scan_prefix_keys(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut found = Vec::new();
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for result in iter {
            let (key, _) = result?;
            let key = String::from_utf8_lossy(&key).to_string();
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key);
        }
        Ok(found)
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    /// Create and persist a new session row.
    pub fn create_session(
        &self,
        project_name: &str,
        wave_number: u32,
        budget_usd: f64,
    ) -> StoreResult<WaveSession> {
        if budget_usd < 0.0 {
            return Err(StoreError::Validation(
                "budget_usd must be non-negative".to_string(),
            ));
        }
        let session = WaveSession::new(project_name, wave_number, budget_usd);
        self.put_session(&session)?;
        debug!(session_id = %session.id, project = project_name, "Session created");
        Ok(session)
    }

    pub fn put_session(&self, session: &WaveSession) -> StoreResult<()> {
        self.put(schema::CF_SESSIONS, &keys::session(&session.id), session)
    }

    pub fn get_session(&self, session_id: &str) -> StoreResult<Option<WaveSession>> {
        self.get(schema::CF_SESSIONS, &keys::session(session_id))
    }

    /// Fetch a session or fail with `NotFound`.
    pub fn require_session(&self, session_id: &str) -> StoreResult<WaveSession> {
        self.get_session(session_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<WaveSession>> {
        let mut sessions: Vec<WaveSession> = self
            .scan_prefix(schema::CF_SESSIONS, keys::SESSION_PREFIX)?
            .into_iter()
            .map(|(_, session)| session)
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Delete a session, cascading to its checkpoints and executions.
    pub fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        if self.get_session(session_id)?.is_none() {
            return Ok(false);
        }

        let mut batch = self.batch();
        batch.delete(schema::CF_SESSIONS, keys::session(session_id));

        for (key, checkpoint) in self.scan_prefix::<WaveCheckpoint>(
            schema::CF_CHECKPOINTS,
            &keys::checkpoint_prefix(session_id),
        )? {
            batch.delete(schema::CF_CHECKPOINTS, key);
            batch.delete(schema::CF_CHECKPOINTS, keys::checkpoint_index(&checkpoint.id));
        }
        for (key, execution) in self.scan_prefix::<StoryExecution>(
            schema::CF_EXECUTIONS,
            &keys::execution_prefix(session_id),
        )? {
            batch.delete(schema::CF_EXECUTIONS, key);
            batch.delete(schema::CF_EXECUTIONS, keys::execution_index(&execution.id));
        }
        batch.commit()?;
        Ok(true)
    }

    // =========================================================================
    // Checkpoint operations
    // =========================================================================

    /// Validate a [`NewCheckpoint`] and stamp it with an id and timestamp.
    pub(crate) fn build_checkpoint(&self, new: NewCheckpoint) -> StoreResult<WaveCheckpoint> {
        if let Some(gate) = &new.gate {
            if !GATE_SEQUENCE.contains(&gate.as_str()) {
                return Err(StoreError::Validation(format!("invalid gate '{gate}'")));
            }
        }
        if new.checkpoint_type == CheckpointType::Gate && new.gate.is_none() {
            return Err(StoreError::Validation(
                "gate checkpoints must name their gate".to_string(),
            ));
        }
        if let Some(parent_id) = &new.parent_checkpoint_id {
            let parent = self
                .get_checkpoint(parent_id)?
                .ok_or_else(|| StoreError::NotFound(format!("checkpoint {parent_id}")))?;
            if parent.session_id != new.session_id {
                return Err(StoreError::Validation(
                    "parent checkpoint belongs to a different session".to_string(),
                ));
            }
        }

        Ok(WaveCheckpoint {
            id: Uuid::new_v4().to_string(),
            session_id: new.session_id,
            checkpoint_type: new.checkpoint_type,
            checkpoint_name: new.checkpoint_name,
            story_id: new.story_id,
            gate: new.gate,
            state: new.state,
            agent_id: new.agent_id,
            parent_checkpoint_id: new.parent_checkpoint_id,
            created_at: Utc::now(),
        })
    }

    /// Create a checkpoint in its own atomic write.
    pub fn create_checkpoint(&self, new: NewCheckpoint) -> StoreResult<WaveCheckpoint> {
        let mut batch = self.batch();
        let checkpoint = batch.put_checkpoint(new)?;
        batch.commit()?;
        Ok(checkpoint)
    }

    pub fn get_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<WaveCheckpoint>> {
        let Some(row_key) =
            self.get_raw(schema::CF_CHECKPOINTS, &keys::checkpoint_index(checkpoint_id))?
        else {
            return Ok(None);
        };
        let row_key = String::from_utf8_lossy(&row_key).to_string();
        match self.get_raw(schema::CF_CHECKPOINTS, &row_key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Most recent checkpoint for a session (created-at order, id
    /// tie-break — both baked into the key).
    pub fn latest_checkpoint(&self, session_id: &str) -> StoreResult<Option<WaveCheckpoint>> {
        Ok(self
            .scan_prefix::<WaveCheckpoint>(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .next_back())
    }

    /// All checkpoints for a session, most recent first.
    pub fn list_checkpoints(
        &self,
        session_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<WaveCheckpoint>> {
        let mut rows: Vec<WaveCheckpoint> = self
            .scan_prefix(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    /// Checkpoints for one story, most recent first.
    pub fn list_story_checkpoints(
        &self,
        session_id: &str,
        story_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<WaveCheckpoint>> {
        let mut rows: Vec<WaveCheckpoint> = self
            .scan_prefix::<WaveCheckpoint>(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .filter(|checkpoint| checkpoint.story_id.as_deref() == Some(story_id))
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    /// Checkpoints of one type, most recent first.
    pub fn list_checkpoints_by_type(
        &self,
        session_id: &str,
        checkpoint_type: CheckpointType,
        limit: usize,
    ) -> StoreResult<Vec<WaveCheckpoint>> {
        let mut rows: Vec<WaveCheckpoint> = self
            .scan_prefix::<WaveCheckpoint>(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .filter(|checkpoint| checkpoint.checkpoint_type == checkpoint_type)
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    /// Checkpoints at one gate, most recent first.
    pub fn list_checkpoints_by_gate(
        &self,
        session_id: &str,
        gate: &str,
        limit: usize,
    ) -> StoreResult<Vec<WaveCheckpoint>> {
        let mut rows: Vec<WaveCheckpoint> = self
            .scan_prefix::<WaveCheckpoint>(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .filter(|checkpoint| checkpoint.gate.as_deref() == Some(gate))
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    /// Latest `gate`-type checkpoint for a story at a specific gate.
    pub fn gate_checkpoint(
        &self,
        session_id: &str,
        story_id: &str,
        gate: &str,
    ) -> StoreResult<Option<WaveCheckpoint>> {
        Ok(self
            .scan_prefix::<WaveCheckpoint>(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .filter(|checkpoint| {
                checkpoint.checkpoint_type == CheckpointType::Gate
                    && checkpoint.story_id.as_deref() == Some(story_id)
                    && checkpoint.gate.as_deref() == Some(gate)
            })
            .next_back())
    }

    /// Children of a parent checkpoint, most recent first.
    pub fn list_child_checkpoints(
        &self,
        parent_checkpoint_id: &str,
    ) -> StoreResult<Vec<WaveCheckpoint>> {
        let Some(parent) = self.get_checkpoint(parent_checkpoint_id)? else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<WaveCheckpoint> = self
            .scan_prefix::<WaveCheckpoint>(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(&parent.session_id),
            )?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .filter(|checkpoint| {
                checkpoint.parent_checkpoint_id.as_deref() == Some(parent_checkpoint_id)
            })
            .collect();
        rows.reverse();
        Ok(rows)
    }

    pub fn checkpoint_count(&self, session_id: &str) -> StoreResult<usize> {
        Ok(self
            .scan_prefix_keys(
                schema::CF_CHECKPOINTS,
                &keys::checkpoint_prefix(session_id),
            )?
            .len())
    }

    /// Retain the most recent `keep` checkpoints for a session; delete
    /// the rest. Returns how many were deleted.
    pub fn cleanup_old_checkpoints(&self, session_id: &str, keep: usize) -> StoreResult<usize> {
        let rows = self.scan_prefix::<WaveCheckpoint>(
            schema::CF_CHECKPOINTS,
            &keys::checkpoint_prefix(session_id),
        )?;
        if rows.len() <= keep {
            return Ok(0);
        }

        let cutoff = rows.len() - keep;
        let mut batch = self.batch();
        for (key, checkpoint) in &rows[..cutoff] {
            batch.delete(schema::CF_CHECKPOINTS, key.clone());
            batch.delete(schema::CF_CHECKPOINTS, keys::checkpoint_index(&checkpoint.id));
        }
        batch.commit()?;
        Ok(cutoff)
    }

    // =========================================================================
    // Story execution operations
    // =========================================================================

    pub fn put_execution(&self, execution: &StoryExecution) -> StoreResult<()> {
        let mut batch = self.batch();
        batch.put_execution(execution)?;
        batch.commit()
    }

    pub fn get_execution(&self, execution_id: &str) -> StoreResult<Option<StoryExecution>> {
        let Some(row_key) =
            self.get_raw(schema::CF_EXECUTIONS, &keys::execution_index(execution_id))?
        else {
            return Ok(None);
        };
        let row_key = String::from_utf8_lossy(&row_key).to_string();
        match self.get_raw(schema::CF_EXECUTIONS, &row_key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch an execution or fail with `NotFound`.
    pub fn require_execution(&self, execution_id: &str) -> StoreResult<StoryExecution> {
        self.get_execution(execution_id)?
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))
    }

    pub fn get_execution_by_story(
        &self,
        session_id: &str,
        story_id: &str,
    ) -> StoreResult<Option<StoryExecution>> {
        self.get(schema::CF_EXECUTIONS, &keys::execution(session_id, story_id))
    }

    pub fn list_executions(&self, session_id: &str) -> StoreResult<Vec<StoryExecution>> {
        Ok(self
            .scan_prefix(schema::CF_EXECUTIONS, &keys::execution_prefix(session_id))?
            .into_iter()
            .map(|(_, execution)| execution)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn checkpoint_for(session_id: &str, name: &str) -> NewCheckpoint {
        NewCheckpoint {
            session_id: session_id.to_string(),
            checkpoint_type: CheckpointType::Manual,
            checkpoint_name: name.to_string(),
            state: json!({"n": name}),
            story_id: None,
            gate: None,
            agent_id: None,
            parent_checkpoint_id: None,
        }
    }

    #[test]
    fn test_session_crud() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let fetched = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(fetched.project_name, "demo");
        assert_eq!(fetched.status, SessionStatus::Pending);

        let listed = store.list_sessions().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_negative_budget_rejected() {
        let (store, _dir) = test_store();
        assert!(matches!(
            store.create_session("demo", 1, -1.0),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_checkpoint_create_and_query() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let mut new = checkpoint_for(&session.id, "started");
        new.checkpoint_type = CheckpointType::StoryStart;
        new.story_id = Some("AUTH-001".to_string());
        let checkpoint = store.create_checkpoint(new).unwrap();

        // By id yields exactly one row.
        let fetched = store.get_checkpoint(&checkpoint.id).unwrap().unwrap();
        assert_eq!(fetched.checkpoint_name, "started");

        let by_story = store
            .list_story_checkpoints(&session.id, "AUTH-001", 10)
            .unwrap();
        assert_eq!(by_story.len(), 1);

        let by_type = store
            .list_checkpoints_by_type(&session.id, CheckpointType::StoryStart, 10)
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, checkpoint.id);
    }

    #[test]
    fn test_latest_checkpoint_deterministic_order() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        for n in 0..5 {
            store
                .create_checkpoint(checkpoint_for(&session.id, &format!("cp-{n}")))
                .unwrap();
        }
        let latest = store.latest_checkpoint(&session.id).unwrap().unwrap();
        assert_eq!(latest.checkpoint_name, "cp-4");

        let listed = store.list_checkpoints(&session.id, 100).unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0].checkpoint_name, "cp-4");
        assert_eq!(listed[4].checkpoint_name, "cp-0");
    }

    #[test]
    fn test_gate_checkpoint_lookup() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let mut new = checkpoint_for(&session.id, "gate-3: passed");
        new.checkpoint_type = CheckpointType::Gate;
        new.gate = Some("gate-3".to_string());
        new.story_id = Some("AUTH-001".to_string());
        store.create_checkpoint(new).unwrap();

        let found = store
            .gate_checkpoint(&session.id, "AUTH-001", "gate-3")
            .unwrap();
        assert!(found.is_some());
        assert!(store
            .gate_checkpoint(&session.id, "AUTH-001", "gate-4")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_gate_rejected() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let mut new = checkpoint_for(&session.id, "bad");
        new.checkpoint_type = CheckpointType::Gate;
        new.gate = Some("gate-8".to_string());
        assert!(matches!(
            store.create_checkpoint(new),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_parent_must_share_session() {
        let (store, _dir) = test_store();
        let session_a = store.create_session("demo", 1, 10.0).unwrap();
        let session_b = store.create_session("demo", 2, 10.0).unwrap();

        let parent = store
            .create_checkpoint(checkpoint_for(&session_a.id, "parent"))
            .unwrap();

        let mut child = checkpoint_for(&session_b.id, "child");
        child.parent_checkpoint_id = Some(parent.id.clone());
        assert!(matches!(
            store.create_checkpoint(child),
            Err(StoreError::Validation(_))
        ));

        let mut child = checkpoint_for(&session_a.id, "child");
        child.parent_checkpoint_id = Some(parent.id.clone());
        let child = store.create_checkpoint(child).unwrap();

        let children = store.list_child_checkpoints(&parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[test]
    fn test_cleanup_old_keeps_most_recent() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        for n in 0..8 {
            store
                .create_checkpoint(checkpoint_for(&session.id, &format!("cp-{n}")))
                .unwrap();
        }

        let deleted = store.cleanup_old_checkpoints(&session.id, 5).unwrap();
        assert_eq!(deleted, 3);

        let remaining = store.list_checkpoints(&session.id, 100).unwrap();
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].checkpoint_name, "cp-7");
        assert_eq!(remaining[4].checkpoint_name, "cp-3");

        // Under the keep limit nothing is deleted.
        assert_eq!(store.cleanup_old_checkpoints(&session.id, 5).unwrap(), 0);
    }

    #[test]
    fn test_execution_crud() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let execution = StoryExecution::new(&session.id, "AUTH-001", "Login", "be", "be-1");
        store.put_execution(&execution).unwrap();

        let by_id = store.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(by_id.story_id, "AUTH-001");

        let by_story = store
            .get_execution_by_story(&session.id, "AUTH-001")
            .unwrap()
            .unwrap();
        assert_eq!(by_story.id, execution.id);

        assert_eq!(store.list_executions(&session.id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_session_cascades() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();
        let checkpoint = store
            .create_checkpoint(checkpoint_for(&session.id, "cp"))
            .unwrap();
        let execution = StoryExecution::new(&session.id, "AUTH-001", "Login", "be", "be-1");
        store.put_execution(&execution).unwrap();

        assert!(store.delete_session(&session.id).unwrap());
        assert!(store.get_session(&session.id).unwrap().is_none());
        assert!(store.get_checkpoint(&checkpoint.id).unwrap().is_none());
        assert!(store.get_execution(&execution.id).unwrap().is_none());
        assert_eq!(store.checkpoint_count(&session.id).unwrap(), 0);

        // Deleting again reports nothing to delete.
        assert!(!store.delete_session(&session.id).unwrap());
    }

    #[test]
    fn test_batch_is_atomic_for_execution_and_checkpoint() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let mut execution = StoryExecution::new(&session.id, "AUTH-001", "Login", "be", "be-1");
        execution.status = StoryStatus::InProgress;

        let mut batch = store.batch();
        batch.put_execution(&execution).unwrap();
        batch
            .put_checkpoint(NewCheckpoint {
                session_id: session.id.clone(),
                checkpoint_type: CheckpointType::StoryStart,
                checkpoint_name: "Started AUTH-001".to_string(),
                state: json!({"current_gate": "gate-0"}),
                story_id: Some("AUTH-001".to_string()),
                gate: None,
                agent_id: Some("be-1".to_string()),
                parent_checkpoint_id: None,
            })
            .unwrap();
        batch.commit().unwrap();

        // Both writes are visible together.
        let stored = store
            .get_execution_by_story(&session.id, "AUTH-001")
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, StoryStatus::InProgress);
        assert_eq!(store.checkpoint_count(&session.id).unwrap(), 1);
    }

    #[test]
    fn test_batch_validation_failure_writes_nothing() {
        let (store, _dir) = test_store();
        let session = store.create_session("demo", 1, 10.0).unwrap();

        let execution = StoryExecution::new(&session.id, "AUTH-001", "Login", "be", "be-1");
        let mut batch = store.batch();
        batch.put_execution(&execution).unwrap();
        let mut bad = checkpoint_for(&session.id, "bad gate");
        bad.checkpoint_type = CheckpointType::Gate;
        bad.gate = Some("gate-42".to_string());
        assert!(batch.put_checkpoint(bad).is_err());
        drop(batch);

        // The batch was abandoned; neither row landed.
        assert!(store
            .get_execution_by_story(&session.id, "AUTH-001")
            .unwrap()
            .is_none());
    }
}
