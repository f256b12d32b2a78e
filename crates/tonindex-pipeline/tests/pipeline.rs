//! End-to-end runs of the index loop against an in-memory chain and store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tonindex_classify::registry::opcodes;
use tonindex_classify::{Classifier, ProtocolRegistry};
use tonindex_core::action::ActionKind;
use tonindex_core::checkpoint::CheckpointStore;
use tonindex_core::cursor::Cursor;
use tonindex_core::error::{IndexerError, SourceError, WriteError};
use tonindex_core::indexer::{IndexerConfig, IndexerState};
use tonindex_core::retry::RetryConfig;
use tonindex_core::source::{MemoryRecordSource, RecordSource, SourcePoll};
use tonindex_core::types::{
    AccountStatus, Block, BlockId, ComputePhase, Direction, Message, ShardIdent, Transaction, TransactionDescr,
};
use tonindex_core::TraceState;
use tonindex_pipeline::{IndexLoop, IndexerBuilder};

const SHARD: ShardIdent = ShardIdent::full(0);
const RUN_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Chain fixtures ──────────────────────────────────────────────────────────

fn mc_block(seqno: u32) -> Block {
    Block {
        id: BlockId::new(ShardIdent::MASTERCHAIN, seqno),
        root_hash: format!("mc-root-{seqno}"),
        file_hash: format!("mc-file-{seqno}"),
        gen_utime: 1_700_000_000 + seqno * 5,
        start_lt: seqno as u64 * 1_000_000,
        end_lt: seqno as u64 * 1_000_000 + 999,
        prev_blocks: vec![BlockId::new(ShardIdent::MASTERCHAIN, seqno - 1)],
        mc_seqno: seqno,
        before_split: false,
        after_split: false,
        after_merge: false,
        key_block: false,
        shard_tops: vec![BlockId::new(SHARD, seqno)],
        tx_count: 0,
    }
}

fn shard_block(seqno: u32) -> Block {
    Block {
        id: BlockId::new(SHARD, seqno),
        root_hash: format!("wc-root-{seqno}"),
        file_hash: format!("wc-file-{seqno}"),
        gen_utime: 1_700_000_000 + seqno * 5,
        start_lt: seqno as u64 * 1_000_000 - 500_000,
        end_lt: seqno as u64 * 1_000_000 - 1,
        prev_blocks: vec![BlockId::new(SHARD, seqno - 1)],
        mc_seqno: seqno,
        before_split: false,
        after_split: false,
        after_merge: false,
        key_block: false,
        shard_tops: vec![],
        tx_count: 0,
    }
}

fn tx(hash: &str, account: &str, block: BlockId, lt: u64) -> Transaction {
    Transaction {
        hash: hash.into(),
        account: account.into(),
        lt,
        block,
        mc_seqno: block.seqno,
        now: 1_700_000_000 + block.seqno * 5,
        prev_tx_hash: None,
        prev_tx_lt: None,
        orig_status: AccountStatus::Active,
        end_status: AccountStatus::Active,
        total_fees: 1_000,
        state_hash_before: format!("{hash}-before"),
        state_hash_after: format!("{hash}-after"),
        descr: TransactionDescr::ordinary(),
    }
}

/// The outbound record on `from_tx` and the inbound record on `to_tx`.
fn link(hash: &str, from: (&str, &str), to: (&str, &str), opcode: u32) -> [Message; 2] {
    let msg = Message::internal(hash, from.1, to.1, 100_000_000).with_opcode(opcode);
    [
        msg.clone().attached(from.0, Direction::Out),
        msg.attached(to.0, Direction::In),
    ]
}

/// Masterchain and shard blocks `1..=count`; shard blocks 2 and 3 carry a
/// jetton transfer (wallet → jetton wallet → receiver wallet) followed by an
/// unrecognised hop. Shard block `skip` is left out.
fn build_chain(source: &MemoryRecordSource, count: u32, skip: Option<u32>) {
    for seqno in 1..=count {
        source.push_block(mc_block(seqno), vec![], vec![]);
        if Some(seqno) != skip {
            let (txs, msgs) = shard_records(seqno);
            source.push_block(shard_block(seqno), txs, msgs);
        }
    }
}

fn shard_records(seqno: u32) -> (Vec<Transaction>, Vec<Message>) {
    records_for(seqno, 3)
}

/// Shard block records with the receiving half of the transfer in block `tail`.
fn records_for(seqno: u32, tail: u32) -> (Vec<Transaction>, Vec<Message>) {
    let block = BlockId::new(SHARD, seqno);
    let base = block_lt(seqno);
    match seqno {
        2 => {
            let mut wallet = tx("tx-a", "0:wallet", block, base + 1);
            wallet.descr.compute = Some(ComputePhase {
                success: true,
                gas_fees: 100,
                gas_used: 500,
                ..ComputePhase::default()
            });
            let jetton_wallet = tx("tx-b", "0:jw-a", block, base + 3);
            let mut msgs = vec![Message::external_in("ext-a", "0:wallet").attached("tx-a", Direction::In)];
            msgs.extend(link("m-ab", ("tx-a", "0:wallet"), ("tx-b", "0:jw-a"), opcodes::JETTON_TRANSFER));
            // Outbound half of m-bc; the receiving transaction lives in block `tail`.
            msgs.push(
                Message::internal("m-bc", "0:jw-a", "0:jw-b", 100_000_000)
                    .with_opcode(opcodes::JETTON_INTERNAL_TRANSFER)
                    .attached("tx-b", Direction::Out),
            );
            // Attached to a transaction that does not exist.
            msgs.push(Message::internal("stray", "0:x", "0:y", 1).attached("tx-missing", Direction::Out));
            (vec![wallet, jetton_wallet], msgs)
        }
        s if s == tail => {
            let receiver = tx("tx-c", "0:jw-b", block, base + 1);
            let other = tx("tx-d", "0:other", block, base + 3);
            let mut msgs = Vec::new();
            // Inbound half of m-bc.
            msgs.push(
                Message::internal("m-bc", "0:jw-a", "0:jw-b", 100_000_000)
                    .with_opcode(opcodes::JETTON_INTERNAL_TRANSFER)
                    .attached("tx-c", Direction::In),
            );
            msgs.extend(link("m-cd", ("tx-c", "0:jw-b"), ("tx-d", "0:other"), 0xdead_beef));
            (vec![receiver, other], msgs)
        }
        _ => (vec![], vec![]),
    }
}

fn block_lt(seqno: u32) -> u64 {
    seqno as u64 * 1_000_000 - 500_000
}

fn config(stop_at: Option<u32>) -> IndexerConfig {
    let mut builder = IndexerBuilder::new()
        .id("it")
        .start(ShardIdent::MASTERCHAIN, 1)
        .start(SHARD, 1)
        .batch_window_ms(5)
        .poll_interval_ms(5)
        .retry(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        });
    if let Some(stop) = stop_at {
        builder = builder.stop_at_mc_seqno(stop);
    }
    builder.build().unwrap()
}

fn classifier() -> Arc<Classifier> {
    Arc::new(Classifier::new(Arc::new(ProtocolRegistry::mainnet())))
}

fn chain_source(count: u32, skip: Option<u32>) -> Arc<MemoryRecordSource> {
    let source = Arc::new(MemoryRecordSource::new(16));
    build_chain(&source, count, skip);
    source
}

/// Remembers the furthest cursor each shard was polled at.
struct TrackedSource {
    inner: Arc<MemoryRecordSource>,
    furthest: Mutex<HashMap<ShardIdent, u32>>,
}

impl TrackedSource {
    fn new(inner: Arc<MemoryRecordSource>) -> Self {
        Self {
            inner,
            furthest: Mutex::new(HashMap::new()),
        }
    }

    fn furthest(&self, shard: ShardIdent) -> u32 {
        self.furthest.lock().unwrap().get(&shard).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RecordSource for TrackedSource {
    async fn next_batch(&self, cursor: &Cursor) -> Result<SourcePoll, SourceError> {
        {
            let mut furthest = self.furthest.lock().unwrap();
            let seqno = furthest.entry(cursor.shard).or_insert(cursor.seqno);
            *seqno = (*seqno).max(cursor.seqno);
        }
        self.inner.next_batch(cursor).await
    }
}

fn commits(store: &tonindex_storage::MemoryStore, shard: ShardIdent) -> Vec<u32> {
    store
        .commit_log()
        .into_iter()
        .filter(|(s, _)| *s == shard)
        .map(|(_, seqno)| seqno)
        .collect()
}

/// How many stored actions cover each transaction, across all traces.
fn coverage(store: &tonindex_storage::MemoryStore) -> HashMap<String, usize> {
    let mut covered = HashMap::new();
    for trace in store.traces() {
        for action in store.actions_for(&trace.trace_id) {
            for hash in action.tx_hashes {
                *covered.entry(hash).or_insert(0) += 1;
            }
        }
    }
    covered
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn bounded_run_indexes_traces_and_actions() {
    let source = chain_source(5, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(5)), source, classifier());

    let summary = tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap();
    assert_eq!(summary.state, IndexerState::Stopped);
    assert_eq!(indexer.state(), IndexerState::Stopped);
    assert!(summary.safe_mc_seqno >= Some(5));
    assert!(summary.malformed_records >= 1);
    assert_eq!(store.block_count(), 10);
    assert_eq!(store.transaction_count(), 4);

    let trace = store.trace("ext-a").expect("trace committed");
    assert_eq!(trace.state, TraceState::Complete);
    assert_eq!(trace.tx_hashes.len(), 4);
    assert_eq!(trace.pending_edges, 0);
    assert_eq!((trace.start_mc_seqno, trace.end_mc_seqno), (2, 3));

    let actions = store.actions_for("ext-a");
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].kind, ActionKind::JettonTransfer);
    assert_eq!(actions[0].tx_hashes, vec!["tx-a", "tx-b", "tx-c"]);
    assert_eq!(actions[1].kind, ActionKind::Unknown);
    assert_eq!(actions[1].tx_hashes, vec!["tx-d"]);
    assert_eq!(summary.actions_written, 2);
    assert_eq!(summary.traces_completed, 1);

    // Gas columns are repaired before persistence.
    let compute = store.transaction("tx-a").unwrap().descr.compute.unwrap();
    assert_eq!((compute.gas_fees, compute.gas_used), (500, 100));

    // Checkpoints follow commits.
    let mc = store.load("it", ShardIdent::MASTERCHAIN).await.unwrap().unwrap();
    assert!(mc.seqno >= 5);
    assert_eq!(mc.root_hash, format!("mc-root-{}", mc.seqno));
    assert_eq!(store.load("it", SHARD).await.unwrap().unwrap().seqno, 5);
}

#[tokio::test]
async fn per_shard_commits_are_strictly_increasing() {
    let source = chain_source(6, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(6)), source, classifier());
    tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap();

    for shard in [ShardIdent::MASTERCHAIN, SHARD] {
        let seqnos = commits(&store, shard);
        assert!(!seqnos.is_empty());
        assert!(seqnos.windows(2).all(|w| w[0] < w[1]), "{shard}: {seqnos:?}");
    }
}

#[tokio::test]
async fn restart_replays_without_recommitting() {
    let source = chain_source(6, None);
    let (mut first, store) = IndexLoop::in_memory(config(Some(3)), source.clone(), classifier());
    tokio::time::timeout(RUN_TIMEOUT, first.run()).await.unwrap().unwrap();
    let committed_before = store.commit_log().len();
    assert!(store.trace("ext-a").is_some());

    let mut second = IndexLoop::new(
        config(Some(6)),
        source,
        classifier(),
        store.clone(),
        Box::new(store.clone()),
    );
    let summary = tokio::time::timeout(RUN_TIMEOUT, second.run()).await.unwrap().unwrap();

    assert_eq!(summary.state, IndexerState::Stopped);
    assert!(summary.safe_mc_seqno >= Some(6));
    assert_eq!(store.block_count(), 12);
    assert_eq!(store.actions_for("ext-a").len(), 2);

    let log = store.commit_log();
    assert!(log.len() > committed_before);
    for shard in [ShardIdent::MASTERCHAIN, SHARD] {
        let seqnos: Vec<u32> = log.iter().filter(|(s, _)| *s == shard).map(|(_, n)| *n).collect();
        assert!(seqnos.windows(2).all(|w| w[0] < w[1]), "{shard} recommitted: {seqnos:?}");
    }
}

#[tokio::test]
async fn transient_store_errors_are_retried() {
    let source = chain_source(4, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(4)), source, classifier());
    store.fail_next(WriteError::Retryable("timeout".into()));
    store.fail_next(WriteError::Retryable("connection reset".into()));

    let summary = tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap();
    assert_eq!(summary.state, IndexerState::Stopped);
    assert_eq!(store.block_count(), 8);
}

#[tokio::test]
async fn exhausted_retries_halt_the_run() {
    let source = chain_source(4, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(4)), source, classifier());
    for _ in 0..20 {
        store.fail_next(WriteError::Retryable("timeout".into()));
    }

    let err = tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap_err();
    assert!(matches!(err, IndexerError::ShardHalted { .. }), "{err:?}");
    assert!(err.is_fatal());
    assert_eq!(indexer.state(), IndexerState::Error);
}

#[tokio::test]
async fn constraint_violation_is_fatal() {
    let source = chain_source(4, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(4)), source, classifier());
    store.fail_next(WriteError::Constraint("missing parent row".into()));

    let err = tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            IndexerError::Write {
                source: WriteError::Constraint(_),
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(indexer.state(), IndexerState::Error);
}

#[tokio::test]
async fn gap_is_refetched_not_skipped() {
    let source = chain_source(5, Some(3));
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(5)), source.clone(), classifier());

    let late = source.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (txs, msgs) = shard_records(3);
        late.push_block(shard_block(3), txs, msgs);
    });

    let summary = tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap();
    assert_eq!(summary.state, IndexerState::Stopped);
    assert_eq!(store.block_count(), 10);
    assert!(store.block(BlockId::new(SHARD, 3)).is_some());
    assert_eq!(store.trace("ext-a").unwrap().state, TraceState::Complete);
}

#[tokio::test]
async fn shutdown_drains_queued_batches() {
    let source = chain_source(5, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(None), source, classifier());

    let summary = tokio::time::timeout(
        RUN_TIMEOUT,
        indexer.run_until(tokio::time::sleep(Duration::from_millis(300))),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.state, IndexerState::Stopped);
    assert_eq!(store.block_count() as u64, summary.blocks_committed);
    assert!(store.load("it", SHARD).await.unwrap().is_some());
}

#[tokio::test]
async fn stored_actions_cover_every_trace_transaction() {
    let source = chain_source(5, None);
    let (mut indexer, store) = IndexLoop::in_memory(config(Some(5)), source, classifier());
    tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap();

    for trace in store.traces() {
        let mut covered: Vec<String> = store
            .actions_for(&trace.trace_id)
            .into_iter()
            .flat_map(|a| a.tx_hashes)
            .collect();
        covered.sort();
        let mut expected = trace.tx_hashes.clone();
        expected.sort();
        assert_eq!(covered, expected, "trace {}", trace.trace_id);
    }
}

#[tokio::test]
async fn open_gap_holds_cursors_and_pauses_intake() {
    let chain = chain_source(120, Some(3));
    let source = Arc::new(TrackedSource::new(chain.clone()));
    let mut cfg = config(Some(120));
    cfg.max_queued_blocks = 8;
    cfg.fetch_channel_capacity = 1;
    let (mut indexer, store) = IndexLoop::in_memory(cfg, source.clone(), classifier());

    let watched = source.clone();
    let filler = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let seen = (watched.furthest(SHARD), watched.furthest(ShardIdent::MASTERCHAIN));
        let (txs, msgs) = shard_records(3);
        chain.push_block(shard_block(3), txs, msgs);
        seen
    });

    let summary = tokio::time::timeout(RUN_TIMEOUT, indexer.run()).await.unwrap().unwrap();
    let (shard_cursor, mc_cursor) = filler.await.unwrap();

    // The gapped shard never polled past its hole, and held masterchain
    // batches stopped the masterchain worker well short of the tip.
    assert_eq!(shard_cursor, 3);
    assert!(mc_cursor < 60, "masterchain polled up to {mc_cursor} while the gap was open");

    assert_eq!(summary.state, IndexerState::Stopped);
    assert_eq!(store.block_count(), 240);
    assert_eq!(store.trace("ext-a").unwrap().state, TraceState::Complete);
    for shard in [ShardIdent::MASTERCHAIN, SHARD] {
        let seqnos = commits(&store, shard);
        assert_eq!(seqnos.last(), Some(&120), "{shard}: {seqnos:?}");
        assert!(seqnos.windows(2).all(|w| w[0] < w[1]), "{shard}: {seqnos:?}");
    }
}

#[tokio::test]
async fn restart_rebuilds_trace_rooted_before_the_checkpoint() {
    // The transfer is rooted in block 2 and completes in block 5.
    let source = Arc::new(MemoryRecordSource::new(16));
    let push = |seqno: u32| {
        source.push_block(mc_block(seqno), vec![], vec![]);
        let (txs, msgs) = records_for(seqno, 5);
        source.push_block(shard_block(seqno), txs, msgs);
    };
    let restartable = |stop: u32| {
        let mut cfg = config(Some(stop));
        cfg.replay_depth = 1;
        cfg.trace_ttl_mc_seqnos = 3;
        cfg
    };
    for seqno in 1..=4 {
        push(seqno);
    }

    let (mut first, store) = IndexLoop::in_memory(restartable(4), source.clone(), classifier());
    tokio::time::timeout(RUN_TIMEOUT, first.run()).await.unwrap().unwrap();
    assert!(store.trace("ext-a").is_none(), "trace was still open at shutdown");
    let cp = store.load("it", SHARD).await.unwrap().unwrap();
    assert_eq!(cp.seqno, 4);
    assert!(matches!(cp.replay_from, Some(r) if r <= 2), "{cp:?}");

    for seqno in 5..=10 {
        push(seqno);
    }
    let mut second = IndexLoop::new(
        restartable(10),
        source.clone(),
        classifier(),
        store.clone(),
        Box::new(store.clone()),
    );
    let summary = tokio::time::timeout(RUN_TIMEOUT, second.run()).await.unwrap().unwrap();
    assert_eq!(summary.state, IndexerState::Stopped);

    let trace = store.trace("ext-a").expect("trace rebuilt from its root");
    assert_eq!(trace.state, TraceState::Complete);
    assert_eq!(trace.tx_hashes.len(), 4);
    assert!(store.trace("m-bc").is_none(), "tail indexed as an orphan");

    // Same coverage as one uninterrupted run over the whole chain.
    let (mut straight, reference) = IndexLoop::in_memory(restartable(10), source, classifier());
    tokio::time::timeout(RUN_TIMEOUT, straight.run()).await.unwrap().unwrap();
    let covered = coverage(&store);
    assert_eq!(covered, coverage(&reference));
    for hash in ["tx-a", "tx-b", "tx-c", "tx-d"] {
        assert_eq!(covered.get(hash), Some(&1), "{hash}: {covered:?}");
    }
}
