//! Record source contract — the decoded block/transaction/message stream.
//!
//! The source is pull-based and resumable: every poll names a [`Cursor`] and
//! the answer carries the cursor to use next. Decoding raw storage pages
//! happens upstream of this interface.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::SourceError;
use crate::types::{Block, BlockData, BlockId, Direction, Message, Transaction, TransactionData};

/// One page of decoded records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordBatch {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub messages: Vec<Message>,
    /// Records the upstream decoder could not decode.
    #[serde(default)]
    pub malformed: Vec<MalformedRecord>,
    pub next_cursor: Option<Cursor>,
}

/// A record that was skipped instead of being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRecord {
    /// Hash or other identifier of the record, if known.
    pub id: String,
    pub block: Option<BlockId>,
    pub reason: String,
}

/// Result of a successful poll.
#[derive(Debug, Clone)]
pub enum SourcePoll {
    Batch(RecordBatch),
    /// Nothing past the cursor yet.
    EndOfStream,
}

/// Pull-based, resumable source of decoded records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Records at or after `cursor` in the cursor's shard.
    async fn next_batch(&self, cursor: &Cursor) -> Result<SourcePoll, SourceError>;
}

impl RecordBatch {
    /// Attach transactions to blocks and messages to transactions.
    ///
    /// Records that cannot be attached are returned as malformed along with
    /// those the source already flagged.
    pub fn attach(self) -> (Vec<BlockData>, Vec<MalformedRecord>) {
        let mut malformed = self.malformed;

        let mut txs: HashMap<String, TransactionData> = HashMap::with_capacity(self.transactions.len());
        for tx in self.transactions {
            if txs.contains_key(&tx.hash) {
                malformed.push(MalformedRecord {
                    id: tx.hash.clone(),
                    block: Some(tx.block),
                    reason: "duplicate transaction".into(),
                });
                continue;
            }
            txs.insert(
                tx.hash.clone(),
                TransactionData {
                    tx,
                    in_msg: None,
                    out_msgs: Vec::new(),
                },
            );
        }

        for msg in self.messages {
            let Some(data) = txs.get_mut(&msg.tx_hash) else {
                malformed.push(MalformedRecord {
                    id: msg.hash.clone(),
                    block: None,
                    reason: format!("message for unknown transaction {}", msg.tx_hash),
                });
                continue;
            };
            match msg.direction {
                Direction::In if data.in_msg.is_some() => malformed.push(MalformedRecord {
                    id: msg.hash.clone(),
                    block: Some(data.tx.block),
                    reason: "second inbound message".into(),
                }),
                Direction::In => data.in_msg = Some(msg),
                Direction::Out => data.out_msgs.push(msg),
            }
        }

        let mut by_block: BTreeMap<BlockId, Vec<TransactionData>> = BTreeMap::new();
        for block in &self.blocks {
            by_block.entry(block.id).or_default();
        }
        for (_, data) in txs {
            match by_block.get_mut(&data.tx.block) {
                Some(list) => list.push(data),
                None => malformed.push(MalformedRecord {
                    id: data.tx.hash.clone(),
                    block: Some(data.tx.block),
                    reason: "transaction for a block outside the batch".into(),
                }),
            }
        }

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in self.blocks {
            let mut transactions = by_block.remove(&block.id).unwrap_or_default();
            transactions.sort_by(|a, b| a.tx.lt.cmp(&b.tx.lt).then_with(|| a.tx.hash.cmp(&b.tx.hash)));
            for data in &mut transactions {
                data.out_msgs
                    .sort_by(|a, b| a.created_lt.cmp(&b.created_lt).then_with(|| a.hash.cmp(&b.hash)));
            }
            blocks.push(BlockData { block, transactions });
        }
        (blocks, malformed)
    }
}

// ─── In-memory source (for testing) ──────────────────────────────────────────

use std::sync::Mutex;

#[derive(Default)]
struct MemoryChain {
    shards: HashMap<crate::types::ShardIdent, BTreeMap<u32, (Block, Vec<Transaction>, Vec<Message>)>>,
    fail_next: u32,
}

/// In-memory record source for tests and replay tooling.
///
/// Serves every stored block at or after the cursor (holes included, the way
/// a lagging upstream would), `max_blocks` at a time.
pub struct MemoryRecordSource {
    chain: Mutex<MemoryChain>,
    max_blocks: usize,
}

impl Default for MemoryRecordSource {
    fn default() -> Self {
        Self::new(16)
    }
}

impl MemoryRecordSource {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            chain: Mutex::new(MemoryChain::default()),
            max_blocks: max_blocks.max(1),
        }
    }

    /// Add a block with its records. Replaces an existing block with the same id.
    pub fn push_block(&self, block: Block, transactions: Vec<Transaction>, messages: Vec<Message>) {
        let mut chain = self.chain.lock().unwrap();
        chain
            .shards
            .entry(block.id.shard)
            .or_default()
            .insert(block.id.seqno, (block, transactions, messages));
    }

    /// Make the next `n` polls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.chain.lock().unwrap().fail_next = n;
    }

    pub fn block_count(&self) -> usize {
        self.chain.lock().unwrap().shards.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn next_batch(&self, cursor: &Cursor) -> Result<SourcePoll, SourceError> {
        let mut chain = self.chain.lock().unwrap();
        if chain.fail_next > 0 {
            chain.fail_next -= 1;
            return Err(SourceError::Transient(format!("injected failure at {cursor}")));
        }
        let Some(shard) = chain.shards.get(&cursor.shard) else {
            return Ok(SourcePoll::EndOfStream);
        };

        let mut batch = RecordBatch::default();
        let mut last = None;
        for (seqno, (block, txs, msgs)) in shard.range(cursor.seqno..).take(self.max_blocks) {
            batch.blocks.push(block.clone());
            batch.transactions.extend(txs.iter().cloned());
            batch.messages.extend(msgs.iter().cloned());
            last = Some(*seqno);
        }
        match last {
            Some(seqno) => {
                batch.next_cursor = Some(Cursor::new(cursor.shard, seqno.saturating_add(1)));
                Ok(SourcePoll::Batch(batch))
            }
            None => Ok(SourcePoll::EndOfStream),
        }
    }
}
