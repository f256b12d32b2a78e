//! Batch scheduler — ordered, idempotent, backpressure-aware commits.
//!
//! Each shard has a lane. Submitted per-block batches are coalesced in the
//! lane until the size limit or time window is reached, then committed in
//! seqno order. Different shards commit concurrently. A lane whose commit
//! keeps failing (or fails with a constraint violation) halts and keeps its
//! work; nothing is dropped or reordered.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::IndexerError;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::{BlockId, ShardIdent};
use crate::writer::{BatchWriter, EntityBatch};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Blocks coalesced into one commit before it is sealed.
    pub batch_max_blocks: usize,
    /// Longest time an open batch waits for more blocks.
    pub batch_window: Duration,
    /// Commit latency above which intake is paused.
    pub max_commit_latency: Duration,
    /// PENDING trace count above which intake is paused.
    pub max_pending_traces: usize,
    /// Queued (uncommitted) blocks above which intake is paused.
    pub max_queued_blocks: usize,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_max_blocks: 32,
            batch_window: Duration::from_millis(500),
            max_commit_latency: Duration::from_secs(5),
            max_pending_traces: 80_000,
            max_queued_blocks: 1024,
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of [`BatchScheduler::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// The batch was already committed or queued; nothing was done.
    Duplicate,
}

/// Acknowledgement of one durable commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    pub shard: ShardIdent,
    pub first_seqno: u32,
    pub seqno: u32,
    /// Committed blocks with their root hashes, in seqno order.
    pub blocks: Vec<(BlockId, String)>,
    pub traces: usize,
    pub actions: usize,
}

/// Result of one flush: acks for everything committed, errors for lanes that halted.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub acks: Vec<CommitAck>,
    pub errors: Vec<IndexerError>,
}

#[derive(Default)]
struct Lane {
    sealed: VecDeque<EntityBatch>,
    open: Option<(EntityBatch, Instant)>,
    last_submitted: Option<u32>,
    last_committed: Option<u32>,
    halted: Option<String>,
}

impl Lane {
    fn queued_blocks(&self) -> usize {
        self.sealed.iter().map(|b| b.blocks.len()).sum::<usize>()
            + self.open.as_ref().map(|(b, _)| b.blocks.len()).unwrap_or(0)
    }
}

struct LaneResult {
    shard: ShardIdent,
    acks: Vec<CommitAck>,
    latency: Duration,
    failed: Option<(IndexerError, Vec<EntityBatch>)>,
}

pub struct BatchScheduler {
    writer: Arc<dyn BatchWriter>,
    config: SchedulerConfig,
    policy: RetryPolicy,
    lanes: BTreeMap<ShardIdent, Lane>,
    pause_tx: watch::Sender<bool>,
    pending_traces: usize,
    /// Blocks fetched but not yet submitted (walker buffer, held batches).
    backlog: usize,
    last_latency: Duration,
}

impl BatchScheduler {
    pub fn new(writer: Arc<dyn BatchWriter>, config: SchedulerConfig) -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            writer,
            policy: RetryPolicy::new(config.retry.clone()),
            config,
            lanes: BTreeMap::new(),
            pause_tx,
            pending_traces: 0,
            backlog: 0,
            last_latency: Duration::ZERO,
        }
    }

    /// Backpressure signal: `true` while intake should pause.
    pub fn subscribe_pause(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Mark `seqno` as already committed for `shard` (e.g. from a checkpoint).
    pub fn prime(&mut self, shard: ShardIdent, seqno: u32) {
        let lane = self.lanes.entry(shard).or_default();
        lane.last_committed = lane.last_committed.max(Some(seqno));
    }

    /// Queue a batch. Batches at or below the last submitted seqno of their
    /// shard are acknowledged as duplicates without touching the store.
    pub fn submit(&mut self, batch: EntityBatch) -> Result<Submitted, IndexerError> {
        let shard = batch
            .shard
            .ok_or_else(|| IndexerError::Other("entity batch without a shard".into()))?;
        let max_blocks = self.config.batch_max_blocks.max(1);
        let lane = self.lanes.entry(shard).or_default();

        if let Some(reason) = &lane.halted {
            return Err(IndexerError::ShardHalted {
                shard,
                seqno: batch.seqno,
                reason: reason.clone(),
            });
        }
        if let Some(last) = lane.last_submitted.max(lane.last_committed) {
            if batch.seqno <= last {
                debug!(%shard, seqno = batch.seqno, last, "duplicate batch skipped");
                return Ok(Submitted::Duplicate);
            }
            if batch.first_seqno <= last {
                return Err(IndexerError::OrderingViolation {
                    shard,
                    last,
                    got: batch.first_seqno,
                });
            }
        }

        lane.last_submitted = Some(batch.seqno);
        match lane.open.as_mut() {
            Some((open, _)) => open.merge(batch),
            None => lane.open = Some((batch, Instant::now())),
        }
        if lane.open.as_ref().is_some_and(|(b, _)| b.blocks.len() >= max_blocks) {
            if let Some((sealed, _)) = lane.open.take() {
                lane.sealed.push_back(sealed);
            }
        }
        self.update_pressure();
        Ok(Submitted::Queued)
    }

    /// Report the assembler's PENDING working-set size.
    pub fn set_pending_traces(&mut self, pending: usize) {
        self.pending_traces = pending;
        self.update_pressure();
    }

    /// Report blocks held upstream of the scheduler. They count against
    /// `max_queued_blocks` together with the queued ones.
    pub fn set_backlog(&mut self, blocks: usize) {
        self.backlog = blocks;
        self.update_pressure();
    }

    /// When the oldest open batch reaches its time window.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lanes
            .values()
            .filter(|l| l.halted.is_none())
            .filter_map(|l| l.open.as_ref().map(|(_, at)| *at + self.config.batch_window))
            .min()
    }

    pub fn queued_blocks(&self) -> usize {
        self.lanes.values().map(Lane::queued_blocks).sum()
    }

    /// `true` when nothing is waiting to be committed on any live lane.
    pub fn is_idle(&self) -> bool {
        self.lanes
            .values()
            .all(|l| l.halted.is_some() || (l.sealed.is_empty() && l.open.is_none()))
    }

    pub fn is_halted(&self, shard: ShardIdent) -> bool {
        self.lanes.get(&shard).is_some_and(|l| l.halted.is_some())
    }

    pub fn last_committed(&self, shard: ShardIdent) -> Option<u32> {
        self.lanes.get(&shard).and_then(|l| l.last_committed)
    }

    /// Commit every sealed batch, and open batches whose window has passed
    /// (all open batches when `force` is set).
    pub async fn flush(&mut self, force: bool) -> FlushOutcome {
        let now = Instant::now();
        let window = self.config.batch_window;

        let mut work = Vec::new();
        for (shard, lane) in self.lanes.iter_mut() {
            if lane.halted.is_some() {
                continue;
            }
            let due = lane
                .open
                .as_ref()
                .is_some_and(|(_, at)| force || now.duration_since(*at) >= window);
            if due {
                if let Some((batch, _)) = lane.open.take() {
                    lane.sealed.push_back(batch);
                }
            }
            if !lane.sealed.is_empty() {
                work.push((*shard, lane.sealed.drain(..).collect::<Vec<_>>()));
            }
        }
        if work.is_empty() {
            return FlushOutcome::default();
        }

        let writer = self.writer.as_ref();
        let policy = &self.policy;
        let results = join_all(
            work.into_iter()
                .map(|(shard, batches)| commit_lane(writer, policy, shard, batches)),
        )
        .await;

        let mut outcome = FlushOutcome::default();
        let mut latency = Duration::ZERO;
        for result in results {
            latency = latency.max(result.latency);
            let lane = self.lanes.entry(result.shard).or_default();
            if let Some(last) = result.acks.last() {
                lane.last_committed = lane.last_committed.max(Some(last.seqno));
            }
            outcome.acks.extend(result.acks);
            if let Some((err, remaining)) = result.failed {
                error!(shard = %result.shard, error = %err, "shard halted; batches kept for operator intervention");
                lane.halted = Some(err.to_string());
                for batch in remaining.into_iter().rev() {
                    lane.sealed.push_front(batch);
                }
                outcome.errors.push(err);
            }
        }
        self.last_latency = latency;
        self.update_pressure();
        outcome
    }

    fn update_pressure(&mut self) {
        let queued = self.queued_blocks();
        let paused = self.last_latency > self.config.max_commit_latency
            || self.pending_traces > self.config.max_pending_traces
            || queued + self.backlog > self.config.max_queued_blocks;
        let was = *self.pause_tx.borrow();
        if paused != was {
            if paused {
                info!(
                    latency_ms = self.last_latency.as_millis() as u64,
                    pending_traces = self.pending_traces,
                    queued_blocks = queued,
                    backlog = self.backlog,
                    "backpressure on: pausing intake"
                );
            } else {
                info!("backpressure off: resuming intake");
            }
            self.pause_tx.send_replace(paused);
        }
    }
}

async fn commit_lane(
    writer: &dyn BatchWriter,
    policy: &RetryPolicy,
    shard: ShardIdent,
    batches: Vec<EntityBatch>,
) -> LaneResult {
    let mut result = LaneResult {
        shard,
        acks: Vec::with_capacity(batches.len()),
        latency: Duration::ZERO,
        failed: None,
    };
    let mut pending = batches.into_iter();
    while let Some(batch) = pending.next() {
        let started = Instant::now();
        match commit_with_retry(writer, policy, shard, &batch).await {
            Ok(()) => {
                result.latency = result.latency.max(started.elapsed());
                debug!(
                    %shard,
                    first_seqno = batch.first_seqno,
                    seqno = batch.seqno,
                    blocks = batch.blocks.len(),
                    traces = batch.traces.len(),
                    actions = batch.actions.len(),
                    "batch committed"
                );
                result.acks.push(CommitAck {
                    shard,
                    first_seqno: batch.first_seqno,
                    seqno: batch.seqno,
                    blocks: batch.blocks.iter().map(|b| (b.id, b.root_hash.clone())).collect(),
                    traces: batch.traces.len(),
                    actions: batch.actions.len(),
                });
            }
            Err(err) => {
                let mut remaining = vec![batch];
                remaining.extend(pending);
                result.failed = Some((err, remaining));
                break;
            }
        }
    }
    result
}

async fn commit_with_retry(
    writer: &dyn BatchWriter,
    policy: &RetryPolicy,
    shard: ShardIdent,
    batch: &EntityBatch,
) -> Result<(), IndexerError> {
    let mut attempt = 0u32;
    loop {
        match writer.commit(shard, batch.seqno, batch).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() => {
                attempt += 1;
                match policy.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            %shard,
                            seqno = batch.seqno,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "commit failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(IndexerError::ShardHalted {
                            shard,
                            seqno: batch.seqno,
                            reason: format!("retries exhausted after {} attempts: {err}", attempt),
                        })
                    }
                }
            }
            Err(err) => {
                return Err(IndexerError::Write {
                    shard,
                    seqno: batch.seqno,
                    source: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WriteError;
    use crate::types::{Block, BlockData};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        commits: Mutex<Vec<(ShardIdent, u32, u32)>>,
        failures: Mutex<VecDeque<WriteError>>,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        async fn commit(&self, shard: ShardIdent, seqno: u32, batch: &EntityBatch) -> Result<(), WriteError> {
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.commits.lock().unwrap().push((shard, batch.first_seqno, seqno));
            Ok(())
        }
    }

    fn batch(shard: ShardIdent, seqno: u32) -> EntityBatch {
        EntityBatch::from_block(&BlockData {
            block: Block {
                id: BlockId::new(shard, seqno),
                root_hash: format!("root-{seqno}"),
                file_hash: String::new(),
                gen_utime: 0,
                start_lt: 0,
                end_lt: 0,
                prev_blocks: vec![],
                mc_seqno: 0,
                before_split: false,
                after_split: false,
                after_merge: false,
                key_block: false,
                shard_tops: vec![],
                tx_count: 0,
            },
            transactions: vec![],
        })
    }

    fn fast_config(batch_max_blocks: usize) -> SchedulerConfig {
        SchedulerConfig {
            batch_max_blocks,
            batch_window: Duration::from_secs(60),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
                jitter_fraction: 0.0,
            },
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn coalesces_and_acks_per_block() {
        let writer = Arc::new(RecordingWriter::default());
        let mut sched = BatchScheduler::new(writer.clone(), fast_config(2));
        let shard = ShardIdent::full(0);
        for seqno in 1..=3 {
            assert_eq!(sched.submit(batch(shard, seqno)).unwrap(), Submitted::Queued);
        }

        // Only the sealed 1..=2 batch goes; 3 waits for its window.
        let out = sched.flush(false).await;
        assert_eq!(out.acks.len(), 1);
        assert_eq!(out.acks[0].blocks.len(), 2);
        assert_eq!(*writer.commits.lock().unwrap(), vec![(shard, 1, 2)]);

        let out = sched.flush(true).await;
        assert_eq!(out.acks[0].seqno, 3);
        assert!(sched.is_idle());
        assert_eq!(sched.last_committed(shard), Some(3));
    }

    #[tokio::test]
    async fn resubmission_is_a_noop() {
        let writer = Arc::new(RecordingWriter::default());
        let mut sched = BatchScheduler::new(writer.clone(), fast_config(1));
        let shard = ShardIdent::full(0);
        sched.submit(batch(shard, 1)).unwrap();
        sched.flush(true).await;
        assert_eq!(sched.submit(batch(shard, 1)).unwrap(), Submitted::Duplicate);
        assert!(sched.flush(true).await.acks.is_empty());
        assert_eq!(writer.commits.lock().unwrap().len(), 1);

        sched.prime(ShardIdent::MASTERCHAIN, 10);
        assert_eq!(
            sched.submit(batch(ShardIdent::MASTERCHAIN, 9)).unwrap(),
            Submitted::Duplicate
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let writer = Arc::new(RecordingWriter::default());
        writer
            .failures
            .lock()
            .unwrap()
            .extend([WriteError::Retryable("timeout".into()), WriteError::Retryable("reset".into())]);
        let mut sched = BatchScheduler::new(writer.clone(), fast_config(1));
        sched.submit(batch(ShardIdent::full(0), 1)).unwrap();
        let out = sched.flush(true).await;
        assert!(out.errors.is_empty());
        assert_eq!(out.acks.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_halt_only_that_shard() {
        let writer = Arc::new(RecordingWriter::default());
        writer
            .failures
            .lock()
            .unwrap()
            .extend((0..3).map(|_| WriteError::Retryable("down".into())));
        let mut sched = BatchScheduler::new(writer.clone(), fast_config(1));
        let a = ShardIdent::full(0);
        sched.submit(batch(a, 1)).unwrap();
        sched.submit(batch(a, 2)).unwrap();

        let out = sched.flush(true).await;
        assert!(matches!(out.errors[0], IndexerError::ShardHalted { seqno: 1, .. }));
        assert!(sched.is_halted(a));
        assert_eq!(sched.queued_blocks(), 2, "halted work is kept, not dropped");
        assert!(sched.submit(batch(a, 3)).is_err());

        // Another shard still commits.
        sched.submit(batch(ShardIdent::MASTERCHAIN, 1)).unwrap();
        let out = sched.flush(true).await;
        assert_eq!(out.acks.len(), 1);
        assert_eq!(sched.last_committed(a), None);
    }

    #[tokio::test]
    async fn constraint_violation_is_not_retried() {
        let writer = Arc::new(RecordingWriter::default());
        writer
            .failures
            .lock()
            .unwrap()
            .push_back(WriteError::Constraint("missing block row".into()));
        let mut sched = BatchScheduler::new(writer.clone(), fast_config(1));
        sched.submit(batch(ShardIdent::full(0), 1)).unwrap();
        let out = sched.flush(true).await;
        assert!(matches!(
            &out.errors[0],
            IndexerError::Write { source: WriteError::Constraint(_), .. }
        ));
        assert!(out.errors[0].is_fatal());
        assert!(writer.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_batch_is_an_ordering_violation() {
        let mut sched = BatchScheduler::new(Arc::new(RecordingWriter::default()), fast_config(8));
        let shard = ShardIdent::full(0);
        sched.submit(batch(shard, 5)).unwrap();
        let mut overlapping = batch(shard, 4);
        overlapping.merge(batch(shard, 6));
        assert!(matches!(
            sched.submit(overlapping),
            Err(IndexerError::OrderingViolation { last: 5, got: 4, .. })
        ));
    }

    #[tokio::test]
    async fn pending_traces_apply_backpressure() {
        let mut sched = BatchScheduler::new(
            Arc::new(RecordingWriter::default()),
            SchedulerConfig {
                max_pending_traces: 10,
                ..fast_config(1)
            },
        );
        let rx = sched.subscribe_pause();
        sched.set_pending_traces(11);
        assert!(*rx.borrow());
        sched.set_pending_traces(3);
        assert!(!sched.is_paused());
    }

    #[tokio::test]
    async fn upstream_backlog_counts_as_queued() {
        let mut sched = BatchScheduler::new(
            Arc::new(RecordingWriter::default()),
            SchedulerConfig {
                max_queued_blocks: 4,
                ..fast_config(8)
            },
        );
        let rx = sched.subscribe_pause();
        let shard = ShardIdent::full(0);
        sched.submit(batch(shard, 1)).unwrap();
        sched.set_backlog(3);
        assert!(!*rx.borrow());
        sched.set_backlog(4);
        assert!(*rx.borrow());

        // Committing the queued block alone brings it back under the limit.
        let outcome = sched.flush(true).await;
        assert_eq!(outcome.acks.len(), 1);
        assert!(!sched.is_paused());
        sched.set_backlog(0);
        assert!(!sched.is_paused());
    }
}
