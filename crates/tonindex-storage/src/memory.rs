//! In-memory storage backend.
//!
//! Holds every committed entity and checkpoint in RAM behind one lock, so a
//! commit is applied entirely or not at all. Useful for tests and
//! short-lived indexers that don't need persistence. Failures can be
//! scripted with [`MemoryStore::fail_next`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use tonindex_core::action::Action;
use tonindex_core::checkpoint::{Checkpoint, CheckpointStore};
use tonindex_core::error::{IndexerError, WriteError};
use tonindex_core::types::{Address, Block, BlockId, Direction, Message, ShardIdent, Transaction};
use tonindex_core::writer::{AccountStateDelta, BatchWriter, EntityBatch};
use tonindex_core::TraceSummary;
use tracing::debug;

use crate::error::StoreError;

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<BlockId, Block>,
    transactions: HashMap<String, Transaction>,
    messages: HashMap<(String, String, Direction), Message>,
    account_states: HashMap<Address, AccountStateDelta>,
    traces: HashMap<String, TraceSummary>,
    actions: HashMap<String, Vec<Action>>,
    committed: HashMap<ShardIdent, u32>,
    commit_log: Vec<(ShardIdent, u32)>,
}

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    checkpoints: Mutex<HashMap<(String, ShardIdent), Checkpoint>>,
    failures: Mutex<VecDeque<WriteError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `err` without applying anything.
    /// Queued failures are consumed one per commit call.
    pub fn fail_next(&self, err: WriteError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn block(&self, id: BlockId) -> Option<Block> {
        self.tables.lock().unwrap().blocks.get(&id).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.tables.lock().unwrap().blocks.len()
    }

    pub fn transaction(&self, hash: &str) -> Option<Transaction> {
        self.tables.lock().unwrap().transactions.get(hash).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables.lock().unwrap().transactions.len()
    }

    pub fn message_count(&self) -> usize {
        self.tables.lock().unwrap().messages.len()
    }

    pub fn account_state(&self, account: &str) -> Option<AccountStateDelta> {
        self.tables.lock().unwrap().account_states.get(account).cloned()
    }

    pub fn trace(&self, trace_id: &str) -> Option<TraceSummary> {
        self.tables.lock().unwrap().traces.get(trace_id).cloned()
    }

    pub fn traces(&self) -> Vec<TraceSummary> {
        let mut out: Vec<_> = self.tables.lock().unwrap().traces.values().cloned().collect();
        out.sort_by(|a, b| a.start_lt.cmp(&b.start_lt).then_with(|| a.trace_id.cmp(&b.trace_id)));
        out
    }

    /// Actions of one trace, ordered by position.
    pub fn actions_for(&self, trace_id: &str) -> Vec<Action> {
        self.tables
            .lock()
            .unwrap()
            .actions
            .get(trace_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn action_count(&self) -> usize {
        self.tables.lock().unwrap().actions.values().map(Vec::len).sum()
    }

    /// Highest committed seqno of `shard`.
    pub fn committed_seqno(&self, shard: ShardIdent) -> Option<u32> {
        self.tables.lock().unwrap().committed.get(&shard).copied()
    }

    /// Every successful commit, in the order it was applied.
    pub fn commit_log(&self) -> Vec<(ShardIdent, u32)> {
        self.tables.lock().unwrap().commit_log.clone()
    }

    fn check_constraints(tables: &Tables, batch: &EntityBatch) -> Result<(), StoreError> {
        for tx in &batch.transactions {
            let known = tables.blocks.contains_key(&tx.block) || batch.blocks.iter().any(|b| b.id == tx.block);
            if !known {
                return Err(StoreError::Constraint(format!(
                    "transaction {} references unknown block {}",
                    tx.hash, tx.block
                )));
            }
        }
        for action in &batch.actions {
            let known = tables.traces.contains_key(&action.trace_id)
                || batch.traces.iter().any(|t| t.trace_id == action.trace_id);
            if !known {
                return Err(StoreError::Constraint(format!(
                    "action {}/{} references unknown trace",
                    action.trace_id, action.action_id
                )));
            }
        }
        Ok(())
    }

    fn apply(tables: &mut Tables, shard: ShardIdent, seqno: u32, batch: &EntityBatch) {
        for block in &batch.blocks {
            tables.blocks.insert(block.id, block.clone());
        }
        for tx in &batch.transactions {
            tables.transactions.insert(tx.hash.clone(), tx.clone());
        }
        for msg in &batch.messages {
            let key = (msg.hash.clone(), msg.tx_hash.clone(), msg.direction);
            tables.messages.insert(key, msg.clone());
        }
        for delta in &batch.account_states {
            let newer = tables
                .account_states
                .get(&delta.account)
                .map_or(true, |cur| cur.last_tx_lt <= delta.last_tx_lt);
            if newer {
                tables.account_states.insert(delta.account.clone(), delta.clone());
            }
        }
        for trace in &batch.traces {
            tables.traces.insert(trace.trace_id.clone(), trace.clone());
        }

        // A trace's action set is replaced as a whole.
        let mut fresh: HashMap<&str, Vec<Action>> = HashMap::new();
        for action in &batch.actions {
            fresh.entry(action.trace_id.as_str()).or_default().push(action.clone());
        }
        for trace in &batch.traces {
            fresh.entry(trace.trace_id.as_str()).or_default();
        }
        for (trace_id, mut actions) in fresh {
            actions.sort_by_key(|a| a.action_id);
            tables.actions.insert(trace_id.to_string(), actions);
        }

        let entry = tables.committed.entry(shard).or_insert(seqno);
        *entry = (*entry).max(seqno);
        tables.commit_log.push((shard, seqno));
    }
}

#[async_trait]
impl BatchWriter for MemoryStore {
    async fn commit(&self, shard: ShardIdent, seqno: u32, batch: &EntityBatch) -> Result<(), WriteError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            debug!(%shard, seqno, error = %err, "injected commit failure");
            return Err(err);
        }
        let mut tables = self.tables.lock().unwrap();
        Self::check_constraints(&tables, batch)?;
        Self::apply(&mut tables, shard, seqno, batch);
        debug!(
            %shard,
            seqno,
            blocks = batch.blocks.len(),
            transactions = batch.transactions.len(),
            traces = batch.traces.len(),
            actions = batch.actions.len(),
            "batch committed"
        );
        Ok(())
    }

    async fn last_committed(&self, shard: ShardIdent) -> Result<Option<u32>, WriteError> {
        Ok(self.committed_seqno(shard))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(
        &self,
        indexer_id: &str,
        shard: ShardIdent,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .get(&(indexer_id.to_string(), shard))
            .cloned())
    }

    async fn list(&self, indexer_id: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        let mut out: Vec<Checkpoint> = self
            .checkpoints
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
        self.checkpoints.lock().unwrap().insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, indexer_id: &str, shard: ShardIdent) -> Result<(), IndexerError> {
        self.checkpoints
            .lock()
            .unwrap()
            .remove(&(indexer_id.to_string(), shard));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonindex_core::action::{ActionDetails, ActionKind};
    use tonindex_core::assembler::{TraceState, TraceSummary};
    use tonindex_core::types::{AccountStatus, TransactionDescr};

    fn block(shard: ShardIdent, seqno: u32) -> Block {
        Block {
            id: BlockId::new(shard, seqno),
            root_hash: format!("root{seqno}"),
            file_hash: format!("file{seqno}"),
            gen_utime: 1_700_000_000,
            start_lt: seqno as u64 * 100,
            end_lt: seqno as u64 * 100 + 99,
            prev_blocks: vec![],
            mc_seqno: seqno,
            before_split: false,
            after_split: false,
            after_merge: false,
            key_block: false,
            shard_tops: vec![],
            tx_count: 1,
        }
    }

    fn tx(hash: &str, block: BlockId, lt: u64) -> Transaction {
        Transaction {
            hash: hash.into(),
            account: "0:aa".into(),
            lt,
            block,
            mc_seqno: block.seqno,
            now: 0,
            prev_tx_hash: None,
            prev_tx_lt: None,
            orig_status: AccountStatus::Active,
            end_status: AccountStatus::Active,
            total_fees: 0,
            state_hash_before: format!("s{}", lt - 1),
            state_hash_after: format!("s{lt}"),
            descr: TransactionDescr::ordinary(),
        }
    }

    fn summary(id: &str) -> TraceSummary {
        TraceSummary {
            trace_id: id.into(),
            external_hash: Some(id.into()),
            root_tx: "t1".into(),
            state: TraceState::Complete,
            break_reason: None,
            start_lt: 1,
            end_lt: 1,
            start_utime: 0,
            end_utime: 0,
            start_mc_seqno: 1,
            end_mc_seqno: 1,
            tx_hashes: vec!["t1".into()],
            message_hashes: vec![],
            pending_edges: 0,
        }
    }

    fn action(trace_id: &str, action_id: u32) -> Action {
        Action {
            trace_id: trace_id.into(),
            action_id,
            kind: ActionKind::TickTock,
            details: ActionDetails::TickTock,
            tx_hashes: vec!["t1".into()],
            accounts: vec!["0:aa".into()],
            start_lt: 1,
            end_lt: 1,
            start_utime: 0,
            end_utime: 0,
            success: true,
            trace_end_lt: 1,
            trace_end_utime: 0,
            trace_mc_seqno_end: 1,
            trace_external_hash: None,
        }
    }

    fn batch_with(shard: ShardIdent, seqno: u32) -> EntityBatch {
        let b = block(shard, seqno);
        EntityBatch {
            shard: Some(shard),
            first_seqno: seqno,
            seqno,
            transactions: vec![tx(&format!("t{seqno}"), b.id, seqno as u64 * 100 + 1)],
            blocks: vec![b],
            ..EntityBatch::default()
        }
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let store = MemoryStore::new();
        let shard = ShardIdent::full(0);
        let mut batch = batch_with(shard, 5);
        batch.traces.push(summary("tr"));
        batch.actions.push(action("tr", 0));

        store.commit(shard, 5, &batch).await.unwrap();
        store.commit(shard, 5, &batch).await.unwrap();

        assert_eq!(store.block_count(), 1);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.action_count(), 1);
        assert_eq!(store.last_committed(shard).await.unwrap(), Some(5));
        assert_eq!(store.commit_log().len(), 2);
    }

    #[tokio::test]
    async fn recommitting_a_trace_replaces_its_actions() {
        let store = MemoryStore::new();
        let shard = ShardIdent::MASTERCHAIN;
        let mut first = batch_with(shard, 1);
        first.traces.push(summary("tr"));
        first.actions = vec![action("tr", 0), action("tr", 1), action("tr", 2)];
        store.commit(shard, 1, &first).await.unwrap();
        assert_eq!(store.actions_for("tr").len(), 3);

        let mut second = batch_with(shard, 2);
        second.traces.push(summary("tr"));
        second.actions = vec![action("tr", 0)];
        store.commit(shard, 2, &second).await.unwrap();
        assert_eq!(store.actions_for("tr").len(), 1);
    }

    #[tokio::test]
    async fn dangling_references_are_constraint_errors() {
        let store = MemoryStore::new();
        let shard = ShardIdent::full(0);

        let mut orphan_tx = EntityBatch::default();
        orphan_tx.transactions.push(tx("t9", BlockId::new(shard, 9), 901));
        let err = store.commit(shard, 9, &orphan_tx).await.unwrap_err();
        assert!(matches!(err, WriteError::Constraint(_)));

        let mut orphan_action = batch_with(shard, 3);
        orphan_action.actions.push(action("missing", 0));
        let err = store.commit(shard, 3, &orphan_action).await.unwrap_err();
        assert!(matches!(err, WriteError::Constraint(_)));

        // nothing was applied
        assert_eq!(store.block_count(), 0);
        assert!(store.commit_log().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryStore::new();
        let shard = ShardIdent::full(0);
        store.fail_next(WriteError::Retryable("busy".into()));
        let batch = batch_with(shard, 1);

        assert!(store.commit(shard, 1, &batch).await.unwrap_err().is_retryable());
        store.commit(shard, 1, &batch).await.unwrap();
        assert_eq!(store.committed_seqno(shard), Some(1));
    }

    #[tokio::test]
    async fn account_state_keeps_latest() {
        let store = MemoryStore::new();
        let shard = ShardIdent::full(0);
        let delta = |lt: u64| AccountStateDelta {
            account: "0:aa".into(),
            block: BlockId::new(shard, 1),
            last_tx_hash: format!("h{lt}"),
            last_tx_lt: lt,
            state_hash_before: String::new(),
            state_hash_after: format!("s{lt}"),
            status: AccountStatus::Active,
        };
        let mut newer = batch_with(shard, 2);
        newer.account_states.push(delta(200));
        let mut older = batch_with(shard, 1);
        older.account_states.push(delta(100));

        store.commit(shard, 2, &newer).await.unwrap();
        store.commit(shard, 1, &older).await.unwrap();
        assert_eq!(store.account_state("0:aa").unwrap().last_tx_lt, 200);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = MemoryStore::new();
        let cp = Checkpoint {
            indexer_id: "test".into(),
            shard: ShardIdent::MASTERCHAIN,
            seqno: 1000,
            root_hash: "abc".into(),
            replay_from: Some(990),
            updated_at: 0,
        };
        store.save(cp).await.unwrap();
        let loaded = store.load("test", ShardIdent::MASTERCHAIN).await.unwrap().unwrap();
        assert_eq!(loaded.seqno, 1000);
        assert_eq!(loaded.replay_from, Some(990));
        assert_eq!(store.list("test").await.unwrap().len(), 1);
        store.delete("test", ShardIdent::MASTERCHAIN).await.unwrap();
        assert!(store.load("test", ShardIdent::MASTERCHAIN).await.unwrap().is_none());
    }
}
