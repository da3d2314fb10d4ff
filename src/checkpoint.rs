//! Checkpoint Store: persists `(session_id, table, last_completed_chunk_hi,
//! chunk_hash, created_at)` after each successfully-applied chunk batch, so
//! an interrupted session resumes by re-sending `CHUNKS` from
//! `last_completed_chunk_hi` onward instead of starting over.
//!
//! Commits are chunk-granular rather than whole-table: each applied batch
//! is checkpointed independently, so a dropped connection loses at most the
//! in-flight chunk instead of the whole session's progress.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::hlc::Hlc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub session_id: Uuid,
    pub table: String,
    pub last_completed_chunk_hi: Hlc,
    pub chunk_hash: [u8; 32],
    pub created_at_ms: i64,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists (or overwrites) the checkpoint for `(session_id, table)`.
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Returns the most recent checkpoint for `(session_id, table)`, if any.
    async fn load(&self, session_id: Uuid, table: &str) -> Result<Option<Checkpoint>>;

    /// Discards the checkpoint for `(session_id, table)` — used when a
    /// session completes successfully, and when `ChecksumMismatch` forces a
    /// restart from scratch.
    async fn clear(&self, session_id: Uuid, table: &str) -> Result<()>;
}

/// An in-memory `CheckpointStore`, used by this crate's own tests.
pub struct MemoryCheckpointStore {
    checkpoints: std::sync::Mutex<std::collections::HashMap<(Uuid, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        MemoryCheckpointStore {
            checkpoints: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let key = (checkpoint.session_id, checkpoint.table.clone());
        self.checkpoints.lock().unwrap().insert(key, checkpoint);
        Ok(())
    }

    async fn load(&self, session_id: Uuid, table: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .get(&(session_id, table.to_string()))
            .cloned())
    }

    async fn clear(&self, session_id: Uuid, table: &str) -> Result<()> {
        self.checkpoints
            .lock()
            .unwrap()
            .remove(&(session_id, table.to_string()));
        Ok(())
    }
}

/// Derives the deterministic session id a resumable session is keyed by:
/// a BLAKE3 hash of the sorted `(node_id_a, node_id_b, table)` tuple, so two
/// nodes that reconnect to retry the same table land on the same
/// `session_id` and can find each other's checkpoint, without either side
/// needing to invent and transmit a fresh random id per attempt.
pub fn derive_session_id(node_a: Uuid, node_b: Uuid, table: &str) -> Uuid {
    let (lo, hi) = if node_a <= node_b {
        (node_a, node_b)
    } else {
        (node_b, node_a)
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hasher.update(table.as_bytes());
    let digest = hasher.finalize();
    Uuid::from_slice(&digest.as_bytes()[0..16]).expect("blake3 digest is at least 16 bytes")
}
