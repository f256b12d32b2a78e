//! Safe masterchain watermark: the masterchain seqno below which all shard
//! data is known to be committed.

use std::collections::{BTreeMap, HashMap};

use crate::cursor::Cursor;
use crate::types::{Block, BlockId, ShardIdent};

/// Tracks committed blocks and advances the safe masterchain seqno.
///
/// Masterchain block N is safe once it is committed, every shard block it
/// references is committed, and N-1 is safe (or N is the first observed).
#[derive(Debug, Default)]
pub struct SafeWatermark {
    floors: HashMap<ShardIdent, u32>,
    committed: HashMap<ShardIdent, u32>,
    /// Observed masterchain blocks not yet safe, with their shard tops.
    pending: BTreeMap<u32, Vec<BlockId>>,
    safe: Option<u32>,
}

impl SafeWatermark {
    /// Blocks below each start cursor count as committed history.
    pub fn new(starts: &[Cursor]) -> Self {
        Self {
            floors: starts.iter().map(|c| (c.shard, c.seqno)).collect(),
            ..Self::default()
        }
    }

    /// Register a masterchain block as it is emitted.
    pub fn observe(&mut self, mc_block: &Block) {
        if !mc_block.id.shard.is_masterchain() {
            return;
        }
        if self.safe.is_some_and(|s| mc_block.id.seqno <= s) {
            return;
        }
        self.pending.insert(mc_block.id.seqno, mc_block.shard_tops.clone());
    }

    /// Record a committed block. Returns the new safe seqno if it advanced.
    pub fn acknowledge(&mut self, block: BlockId) -> Option<u32> {
        let seqno = self.committed.entry(block.shard).or_insert(block.seqno);
        *seqno = (*seqno).max(block.seqno);
        self.advance()
    }

    fn is_committed(&self, id: &BlockId) -> bool {
        self.committed.get(&id.shard).is_some_and(|&s| s >= id.seqno)
            || self.floors.get(&id.shard).is_some_and(|&f| id.seqno < f)
    }

    fn advance(&mut self) -> Option<u32> {
        let before = self.safe;
        while let Some((&seqno, tops)) = self.pending.first_key_value() {
            if self.safe.is_some_and(|s| seqno != s + 1) {
                break;
            }
            let mc = BlockId::new(ShardIdent::MASTERCHAIN, seqno);
            if !self.is_committed(&mc) || !tops.iter().all(|t| self.is_committed(t)) {
                break;
            }
            self.pending.remove(&seqno);
            self.safe = Some(seqno);
        }
        (self.safe != before).then_some(self.safe).flatten()
    }

    pub fn safe_mc_seqno(&self) -> Option<u32> {
        self.safe
    }
}
