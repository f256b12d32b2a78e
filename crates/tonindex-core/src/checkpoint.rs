//! Checkpoint manager — persists per-shard cursors for crash recovery.
//!
//! A checkpoint stores the last block of a shard whose batch was durably
//! committed, plus the block a restart has to replay from so that no trace
//! is cut in half. On restart each shard resumes from that replay point
//! rather than re-indexing from scratch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::types::{BlockId, ShardIdent};

/// A persisted checkpoint for one shard of an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique indexer identifier.
    pub indexer_id: String,
    pub shard: ShardIdent,
    /// Last committed block seqno.
    pub seqno: u32,
    /// Root hash of that block.
    pub root_hash: String,
    /// First block to re-read on restart. Every trace touching a block at or
    /// after it also has its root at or after it.
    #[serde(default)]
    pub replay_from: Option<u32>,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    /// Cursor pointing at the first block not yet committed.
    pub fn resume_cursor(&self) -> Cursor {
        Cursor::after(BlockId::new(self.shard, self.seqno))
    }

    /// Seqno a restart re-reads this shard from: the stored replay point, or
    /// `depth` blocks before the checkpoint when none was recorded.
    pub fn replay_start(&self, depth: u32) -> u32 {
        self.replay_from
            .unwrap_or_else(|| self.seqno.saturating_add(1).saturating_sub(depth))
    }
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include `MemoryCheckpointStore` and the stores in
/// `tonindex-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for one shard of an indexer.
    async fn load(
        &self,
        indexer_id: &str,
        shard: ShardIdent,
    ) -> Result<Option<Checkpoint>, IndexerError>;

    /// All checkpoints of an indexer.
    async fn list(&self, indexer_id: &str) -> Result<Vec<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting an indexer).
    async fn delete(&self, indexer_id: &str, shard: ShardIdent) -> Result<(), IndexerError>;
}

/// Shared stores (one backend serving as both batch writer and checkpoint
/// store) plug in through `Arc`.
#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    async fn load(
        &self,
        indexer_id: &str,
        shard: ShardIdent,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        (**self).load(indexer_id, shard).await
    }

    async fn list(&self, indexer_id: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        (**self).list(indexer_id).await
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        (**self).save(checkpoint).await
    }

    async fn delete(&self, indexer_id: &str, shard: ShardIdent) -> Result<(), IndexerError> {
        (**self).delete(indexer_id, shard).await
    }
}

/// Reads and writes per-shard cursors for one indexer.
///
/// `store_cursor` must only be called after the batch containing the block
/// has been acknowledged by the batch writer.
pub struct CheckpointManager {
    store: Box<dyn CheckpointStore>,
    indexer_id: String,
}

impl CheckpointManager {
    pub fn new(store: Box<dyn CheckpointStore>, indexer_id: impl Into<String>) -> Self {
        Self {
            store,
            indexer_id: indexer_id.into(),
        }
    }

    pub fn indexer_id(&self) -> &str {
        &self.indexer_id
    }

    /// The saved checkpoint of `shard` (returns `None` if none exists).
    pub async fn load(&self, shard: ShardIdent) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&self.indexer_id, shard).await
    }

    /// The cursor `shard` should resume from, if it was ever committed.
    pub async fn load_cursor(&self, shard: ShardIdent) -> Result<Option<Cursor>, IndexerError> {
        Ok(self.load(shard).await?.map(|cp| cp.resume_cursor()))
    }

    /// Record `block` as the last committed block of its shard, with the
    /// block a restart must replay from (clamped to just after `block`).
    pub async fn store_cursor(
        &self,
        block: BlockId,
        root_hash: &str,
        replay_from: Option<u32>,
    ) -> Result<(), IndexerError> {
        let replay_from = replay_from.map(|r| r.min(block.seqno.saturating_add(1)));
        let cp = Checkpoint {
            indexer_id: self.indexer_id.clone(),
            shard: block.shard,
            seqno: block.seqno,
            root_hash: root_hash.to_string(),
            replay_from,
            updated_at: chrono::Utc::now().timestamp(),
        };
        tracing::debug!(shard = %block.shard, seqno = block.seqno, ?replay_from, "checkpoint stored");
        self.store.save(cp).await
    }

    pub async fn list(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        self.store.list(&self.indexer_id).await
    }

    pub async fn reset(&self, shard: ShardIdent) -> Result<(), IndexerError> {
        self.store.delete(&self.indexer_id, shard).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<(String, ShardIdent), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        indexer_id: &str,
        shard: ShardIdent,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&(indexer_id.to_string(), shard))
            .cloned())
    }

    async fn list(&self, indexer_id: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        let mut out: Vec<Checkpoint> = self
            .data
            .lock()
            .unwrap()
            .values()
            .filter(|cp| cp.indexer_id == indexer_id)
            .cloned()
            .collect();
        out.sort_by_key(|cp| cp.shard);
        Ok(out)
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = (checkpoint.indexer_id.clone(), checkpoint.shard);
        self.data.lock().unwrap().insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, indexer_id: &str, shard: ShardIdent) -> Result<(), IndexerError> {
        self.data
            .lock()
            .unwrap()
            .remove(&(indexer_id.to_string(), shard));
        Ok(())
    }
}
