//! Shard walker — turns per-shard block arrivals into a topologically
//! ordered block stream.
//!
//! Fetch workers hand every block they receive to [`ShardWalker::accept`].
//! [`ShardWalker::drain_ready`] then releases blocks whose previous blocks
//! have all been released, following splits (one previous block, two
//! successor shards) and merges (two previous blocks, one successor shard).
//! A block whose predecessor never arrived stays buffered and is reported by
//! [`ShardWalker::gaps`] so the caller can re-poll the source; it is never
//! skipped.
//!
//! Buffered blocks are queued per shard by seqno. Inside a shard only the
//! lowest buffered block can have all of its previous blocks released, so a
//! drain step compares one head per shard.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::cursor::Cursor;
use crate::types::{BlockData, BlockId, ShardIdent};

/// A change in the set of shards being walked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    /// Start fetching a shard at the cursor.
    Opened(Cursor),
    /// The shard was split or merged away; its worker can stop.
    Closed(ShardIdent),
}

/// Blocks released by one [`ShardWalker::drain_ready`] call.
#[derive(Debug, Default)]
pub struct Drained {
    pub blocks: Vec<BlockData>,
    pub changes: Vec<TopologyChange>,
}

pub struct ShardWalker {
    /// First seqno of each starting shard; anything below is treated as history.
    floors: HashMap<ShardIdent, u32>,
    /// Highest seqno released per shard.
    emitted: HashMap<ShardIdent, u32>,
    live: BTreeSet<ShardIdent>,
    known: HashSet<ShardIdent>,
    /// Buffered blocks per shard, by seqno.
    buffer: BTreeMap<ShardIdent, BTreeMap<u32, BlockData>>,
    committed: HashMap<ShardIdent, u32>,
    /// Masterchain seqno → shard tops it references, until scanned.
    mc_tops: BTreeMap<u32, Vec<BlockId>>,
    frontier: Option<u32>,
}

impl ShardWalker {
    /// Create a walker starting at the given per-shard cursors.
    pub fn new(starts: &[Cursor]) -> Self {
        let mut walker = Self {
            floors: HashMap::new(),
            emitted: HashMap::new(),
            live: BTreeSet::new(),
            known: HashSet::new(),
            buffer: BTreeMap::new(),
            committed: HashMap::new(),
            mc_tops: BTreeMap::new(),
            frontier: None,
        };
        for cursor in starts {
            walker.floors.insert(cursor.shard, cursor.seqno);
            walker.live.insert(cursor.shard);
            walker.known.insert(cursor.shard);
        }
        walker
    }

    /// Buffer a fetched block. Returns shards that must start being fetched.
    pub fn accept(&mut self, data: BlockData) -> Vec<TopologyChange> {
        let id = data.id();
        if self.is_emitted(&id) || self.is_buffered(&id) {
            tracing::trace!(block = %id, "duplicate block ignored");
            return Vec::new();
        }

        let mut changes = Vec::new();
        if id.shard.is_masterchain() {
            for top in &data.block.shard_tops {
                if let Some(change) = self.discover(*top) {
                    changes.push(change);
                }
            }
            self.mc_tops.insert(id.seqno, data.block.shard_tops.clone());
        }
        self.buffer.entry(id.shard).or_default().insert(id.seqno, data);
        changes
    }

    fn is_buffered(&self, id: &BlockId) -> bool {
        self.buffer.get(&id.shard).is_some_and(|q| q.contains_key(&id.seqno))
    }

    /// Lowest `(start_lt, id)` among shard heads whose previous blocks are
    /// all released.
    fn next_ready(&self) -> Option<BlockId> {
        self.buffer
            .values()
            .filter_map(|queue| queue.first_key_value().map(|(_, data)| data))
            .filter(|data| data.block.prev_blocks.iter().all(|p| self.is_emitted(p)))
            .map(|data| (data.block.start_lt, data.id()))
            .min()
            .map(|(_, id)| id)
    }

    fn take(&mut self, id: &BlockId) -> Option<BlockData> {
        let queue = self.buffer.get_mut(&id.shard)?;
        let data = queue.remove(&id.seqno);
        if queue.is_empty() {
            self.buffer.remove(&id.shard);
        }
        data
    }

    /// Release every buffered block whose previous blocks are all released,
    /// in logical-time order.
    pub fn drain_ready(&mut self) -> Drained {
        let mut out = Drained::default();
        while let Some(id) = self.next_ready() {
            let Some(data) = self.take(&id) else { break };
            self.release(&data, &mut out.changes);
            out.blocks.push(data);
        }
        self.advance_frontier();
        out
    }

    fn release(&mut self, data: &BlockData, changes: &mut Vec<TopologyChange>) {
        let id = data.id();
        let top = self.emitted.entry(id.shard).or_insert(id.seqno);
        *top = (*top).max(id.seqno);

        if !self.known.contains(&id.shard) {
            self.known.insert(id.shard);
            self.live.insert(id.shard);
        }

        for prev in &data.block.prev_blocks {
            if prev.shard != id.shard && self.live.remove(&prev.shard) {
                tracing::info!(shard = %prev.shard, successor = %id, "shard closed");
                changes.push(TopologyChange::Closed(prev.shard));
            }
        }

        if data.block.before_split {
            if let Some((left, right)) = id.shard.children() {
                for child in [left, right] {
                    if self.known.insert(child) {
                        self.live.insert(child);
                        let cursor = Cursor::new(child, id.seqno.saturating_add(1));
                        tracing::info!(parent = %id, child = %child, "shard split");
                        changes.push(TopologyChange::Opened(cursor));
                    }
                }
            }
        }
    }

    /// A shard referenced by the masterchain that is not being walked yet.
    fn discover(&mut self, top: BlockId) -> Option<TopologyChange> {
        if self.known.contains(&top.shard) {
            return None;
        }
        // A live ancestor will announce this shard itself when it splits.
        if self.live.iter().any(|s| *s != top.shard && s.contains(&top.shard)) {
            return None;
        }
        let related = self
            .known
            .iter()
            .any(|s| s.contains(&top.shard) || top.shard.contains(s));
        if !related {
            self.floors.insert(top.shard, top.seqno);
        }
        self.known.insert(top.shard);
        self.live.insert(top.shard);
        tracing::info!(shard = %top.shard, seqno = top.seqno, anchored = !related, "shard discovered");
        Some(TopologyChange::Opened(Cursor::new(top.shard, top.seqno)))
    }

    fn advance_frontier(&mut self) {
        while let Some((&seqno, tops)) = self.mc_tops.first_key_value() {
            let mc = BlockId::new(ShardIdent::MASTERCHAIN, seqno);
            if !self.is_emitted(&mc) || !tops.iter().all(|t| self.is_emitted(t)) {
                break;
            }
            self.frontier = Some(seqno);
            self.mc_tops.remove(&seqno);
        }
    }

    /// `true` if the block was released or lies below a starting floor.
    pub fn is_emitted(&self, id: &BlockId) -> bool {
        self.emitted.get(&id.shard).is_some_and(|&s| s >= id.seqno)
            || self.floors.get(&id.shard).is_some_and(|&f| id.seqno < f)
    }

    /// Missing predecessors that block buffered blocks, lowest seqno per shard.
    pub fn gaps(&self) -> Vec<Cursor> {
        let mut missing: BTreeMap<ShardIdent, u32> = BTreeMap::new();
        for data in self.buffer.values().flat_map(BTreeMap::values) {
            for prev in &data.block.prev_blocks {
                if self.is_emitted(prev) || self.is_buffered(prev) {
                    continue;
                }
                let seqno = missing.entry(prev.shard).or_insert(prev.seqno);
                *seqno = (*seqno).min(prev.seqno);
            }
        }
        missing
            .into_iter()
            .map(|(shard, seqno)| Cursor::new(shard, seqno))
            .collect()
    }

    /// Record that `block` is durably committed.
    pub fn acknowledge(&mut self, block: BlockId) {
        let seqno = self.committed.entry(block.shard).or_insert(block.seqno);
        *seqno = (*seqno).max(block.seqno);
    }

    pub fn committed(&self, shard: ShardIdent) -> Option<u32> {
        self.committed.get(&shard).copied()
    }

    /// Highest masterchain seqno N such that masterchain blocks up to N and
    /// all shard blocks they reference have been released.
    pub fn scanned_frontier(&self) -> Option<u32> {
        self.frontier
    }

    pub fn live_shards(&self) -> Vec<ShardIdent> {
        self.live.iter().copied().collect()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.values().map(BTreeMap::len).sum()
    }
}
