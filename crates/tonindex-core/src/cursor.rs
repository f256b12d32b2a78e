//! Shard read cursor — the next block a shard fetch worker will ask for.

use serde::{Deserialize, Serialize};

use crate::types::{BlockId, ShardIdent};

/// Position of a fetch worker inside one shard.
///
/// `seqno` is the next block to fetch, not the last one processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub shard: ShardIdent,
    pub seqno: u32,
}

impl Cursor {
    pub fn new(shard: ShardIdent, seqno: u32) -> Self {
        Self { shard, seqno }
    }

    /// Cursor positioned right after `block`.
    pub fn after(block: BlockId) -> Self {
        Self::new(block.shard, block.seqno.saturating_add(1))
    }

    /// Advance past `seqno` (never moves backwards).
    pub fn advance(&mut self, seqno: u32) {
        self.seqno = self.seqno.max(seqno.saturating_add(1));
    }

    /// Move back to `seqno` if it is behind the current position.
    pub fn rewind(&mut self, seqno: u32) -> bool {
        if seqno < self.seqno {
            self.seqno = seqno;
            true
        } else {
            false
        }
    }

    pub fn block_id(&self) -> BlockId {
        BlockId::new(self.shard, self.seqno)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.shard, self.seqno)
    }
}
