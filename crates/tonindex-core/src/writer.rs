//! Batch writer contract and the entity batches it commits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::assembler::TraceSummary;
use crate::error::WriteError;
use crate::types::{AccountStatus, Address, Block, BlockData, BlockId, Message, ShardIdent, Transaction};

/// Latest state of one account as of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStateDelta {
    pub account: Address,
    pub block: BlockId,
    pub last_tx_hash: String,
    pub last_tx_lt: u64,
    pub state_hash_before: String,
    pub state_hash_after: String,
    pub status: AccountStatus,
}

/// All derived entities of one or more consecutive blocks of a shard.
///
/// `first_seqno..=seqno` is the block range covered; a batch built from a
/// single block has `first_seqno == seqno`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityBatch {
    pub shard: Option<ShardIdent>,
    pub first_seqno: u32,
    pub seqno: u32,
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub messages: Vec<Message>,
    pub account_states: Vec<AccountStateDelta>,
    pub traces: Vec<TraceSummary>,
    pub actions: Vec<Action>,
}

impl EntityBatch {
    /// Entities of one block. Traces and actions are attached separately.
    pub fn from_block(data: &BlockData) -> Self {
        let id = data.id();
        let mut batch = Self {
            shard: Some(id.shard),
            first_seqno: id.seqno,
            seqno: id.seqno,
            blocks: vec![data.block.clone()],
            ..Self::default()
        };

        let mut first_seen: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for tx in &data.transactions {
            batch.transactions.push(tx.tx.clone());
            batch.messages.extend(tx.messages().cloned());

            // Transactions are lt-ordered, so the last one per account wins.
            let delta = AccountStateDelta {
                account: tx.tx.account.clone(),
                block: id,
                last_tx_hash: tx.tx.hash.clone(),
                last_tx_lt: tx.tx.lt,
                state_hash_before: tx.tx.state_hash_before.clone(),
                state_hash_after: tx.tx.state_hash_after.clone(),
                status: tx.tx.end_status,
            };
            match first_seen.get(tx.tx.account.as_str()) {
                Some(&idx) => {
                    let before = std::mem::take(&mut batch.account_states[idx].state_hash_before);
                    batch.account_states[idx] = AccountStateDelta {
                        state_hash_before: before,
                        ..delta
                    };
                }
                None => {
                    first_seen.insert(tx.tx.account.as_str(), batch.account_states.len());
                    batch.account_states.push(delta);
                }
            }
        }
        batch
    }

    /// Append the next consecutive batch of the same shard.
    pub fn merge(&mut self, next: EntityBatch) {
        if self.shard.is_none() {
            self.shard = next.shard;
            self.first_seqno = next.first_seqno;
        }
        self.seqno = next.seqno;
        self.blocks.extend(next.blocks);
        self.transactions.extend(next.transactions);
        self.messages.extend(next.messages);
        self.account_states.extend(next.account_states);
        self.traces.extend(next.traces);
        self.actions.extend(next.actions);
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|b| b.id)
    }

    /// Rough entity count, used for size-based flushing.
    pub fn weight(&self) -> usize {
        self.blocks.len() + self.transactions.len() + self.messages.len() + self.traces.len() + self.actions.len()
    }
}

/// Commits entity batches to a backing store.
///
/// Implementations must make `commit` atomic (all entities or none) and
/// idempotent: re-committing a batch with the same content is a no-op keyed
/// by natural identifiers (block id, tx hash, message hash, trace id,
/// (trace id, action id)). Committing a trace replaces all of its actions.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn commit(&self, shard: ShardIdent, seqno: u32, batch: &EntityBatch) -> Result<(), WriteError>;

    /// Highest committed seqno of `shard`, if the store tracks it.
    async fn last_committed(&self, _shard: ShardIdent) -> Result<Option<u32>, WriteError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TransactionData, TransactionDescr};

    fn tx(hash: &str, account: &str, lt: u64, block: BlockId) -> TransactionData {
        TransactionData {
            tx: Transaction {
                hash: hash.into(),
                account: account.into(),
                lt,
                block,
                mc_seqno: 1,
                now: 0,
                prev_tx_hash: None,
                prev_tx_lt: None,
                orig_status: AccountStatus::Active,
                end_status: AccountStatus::Active,
                total_fees: 0,
                state_hash_before: format!("{hash}-before"),
                state_hash_after: format!("{hash}-after"),
                descr: TransactionDescr::ordinary(),
            },
            in_msg: None,
            out_msgs: vec![],
        }
    }

    fn block(seqno: u32) -> Block {
        Block {
            id: BlockId::new(ShardIdent::full(0), seqno),
            root_hash: String::new(),
            file_hash: String::new(),
            gen_utime: 0,
            start_lt: 0,
            end_lt: 0,
            prev_blocks: vec![],
            mc_seqno: 1,
            before_split: false,
            after_split: false,
            after_merge: false,
            key_block: false,
            shard_tops: vec![],
            tx_count: 2,
        }
    }

    #[test]
    fn account_state_spans_all_transactions_of_an_account() {
        let b = block(3);
        let data = BlockData {
            transactions: vec![tx("t1", "0:aa", 1, b.id), tx("t2", "0:bb", 2, b.id), tx("t3", "0:aa", 3, b.id)],
            block: b,
        };
        let batch = EntityBatch::from_block(&data);
        assert_eq!(batch.transactions.len(), 3);
        assert_eq!(batch.account_states.len(), 2);
        let aa = &batch.account_states[0];
        assert_eq!(aa.last_tx_hash, "t3");
        assert_eq!(aa.state_hash_before, "t1-before");
        assert_eq!(aa.state_hash_after, "t3-after");
    }

    #[test]
    fn merge_extends_range() {
        let mut first = EntityBatch::from_block(&BlockData {
            block: block(3),
            transactions: vec![],
        });
        first.merge(EntityBatch::from_block(&BlockData {
            block: block(4),
            transactions: vec![],
        }));
        assert_eq!((first.first_seqno, first.seqno), (3, 4));
        assert_eq!(first.block_ids().count(), 2);

        let mut empty = EntityBatch::default();
        empty.merge(first);
        assert_eq!(empty.first_seqno, 3);
        assert_eq!(empty.shard, Some(ShardIdent::full(0)));
    }
}
