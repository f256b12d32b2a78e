//! The main index loop — drives fetch → walk → assemble → classify → commit.
//!
//! # Startup
//! Each shard resumes at the replay point stored with its checkpoint (never
//! below the configured start) so that trace state can be rebuilt. Replayed
//! batches are acknowledged by the scheduler as duplicates without touching
//! the store.
//!
//! # Replay horizon
//! After every sweep the loop asks the assembler for the lowest masterchain
//! seqno no live or unwritten trace reaches back across, and maps it to a
//! per-shard seqno through the shard tops of the masterchain block before
//! it. Checkpoints store that seqno, so a restart re-reads every trace that
//! was still open from its root.
//!
//! # Steady state
//! Fetch workers push attached blocks into a channel. The loop hands them to
//! the walker, ingests released blocks into the assembler and submits shard
//! batches immediately. Masterchain batches are held until the walker's
//! scanned frontier reaches them; at that point traces are swept, classified
//! in parallel, and written together with the masterchain batch that
//! finalized them. Blocks buffered by the walker and held masterchain
//! batches count toward the scheduler's queued-block limit.
//!
//! # Acknowledgement
//! Only commit acks advance the walker's committed view, the safe watermark
//! and the per-shard checkpoints.
//!
//! # Shutdown
//! On the shutdown signal (or once the safe watermark reaches
//! `stop_at_mc_seqno`) workers stop and every queued batch is committed
//! before the loop returns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use tonindex_classify::Classifier;
use tonindex_core::action::Action;
use tonindex_core::assembler::{Trace, TraceAssembler, TraceState, TraceSummary};
use tonindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use tonindex_core::cursor::Cursor;
use tonindex_core::error::IndexerError;
use tonindex_core::indexer::{IndexerConfig, IndexerState};
use tonindex_core::retry::RetryPolicy;
use tonindex_core::scheduler::{BatchScheduler, FlushOutcome, Submitted};
use tonindex_core::source::{MalformedRecord, RecordSource};
use tonindex_core::types::{BlockData, BlockId, ShardIdent};
use tonindex_core::walker::{ShardWalker, TopologyChange};
use tonindex_core::watermark::SafeWatermark;
use tonindex_core::writer::{BatchWriter, EntityBatch};
use tonindex_storage::MemoryStore;

use crate::fetcher::{FetchContext, FetchEvent, FetchWorker};

/// Counters reported when a run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub state: IndexerState,
    pub blocks_emitted: u64,
    pub blocks_committed: u64,
    pub traces_completed: u64,
    pub traces_broken: u64,
    pub actions_written: u64,
    pub malformed_records: u64,
    pub safe_mc_seqno: Option<u32>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            state: IndexerState::Idle,
            blocks_emitted: 0,
            blocks_committed: 0,
            traces_completed: 0,
            traces_broken: 0,
            actions_written: 0,
            malformed_records: 0,
            safe_mc_seqno: None,
        }
    }
}

/// The core index loop implementation.
pub struct IndexLoop {
    config: IndexerConfig,
    source: Arc<dyn RecordSource>,
    classifier: Arc<Classifier>,
    writer: Arc<dyn BatchWriter>,
    checkpoint: CheckpointManager,
    state: IndexerState,
}

impl IndexLoop {
    pub fn new(
        config: IndexerConfig,
        source: Arc<dyn RecordSource>,
        classifier: Arc<Classifier>,
        writer: Arc<dyn BatchWriter>,
        checkpoints: Box<dyn CheckpointStore>,
    ) -> Self {
        let checkpoint = CheckpointManager::new(checkpoints, &config.id);
        Self {
            config,
            source,
            classifier,
            writer,
            checkpoint,
            state: IndexerState::Idle,
        }
    }

    /// An index loop writing entities and checkpoints to one in-memory store.
    pub fn in_memory(
        config: IndexerConfig,
        source: Arc<dyn RecordSource>,
        classifier: Arc<Classifier>,
    ) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let indexer = Self::new(config, source, classifier, store.clone(), Box::new(store.clone()));
        (indexer, store)
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    /// Run until `stop_at_mc_seqno` is reached or the source fails.
    pub async fn run(&mut self) -> Result<RunSummary, IndexerError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, `stop_at_mc_seqno` is reached or an
    /// unrecoverable error occurs. Queued batches are committed before
    /// returning in every case.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<RunSummary, IndexerError>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let (starts, replay_until) = self.resume_points().await?;

        let (events_tx, mut events_rx) = mpsc::channel(self.config.fetch_channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lead_tx, lead_rx) = watch::channel(0);
        let mut scheduler = BatchScheduler::new(Arc::clone(&self.writer), self.config.scheduler_config());
        for (shard, seqno) in &replay_until {
            scheduler.prime(*shard, *seqno);
        }
        let fetch = FetchContext {
            source: Arc::clone(&self.source),
            events: events_tx,
            pause: scheduler.subscribe_pause(),
            shutdown: shutdown_rx,
            lead: lead_rx,
            policy: RetryPolicy::new(self.config.retry.clone()),
            poll_interval: self.config.poll_interval(),
        };

        let mut run = Run {
            config: &self.config,
            checkpoint: &self.checkpoint,
            classifier: Arc::clone(&self.classifier),
            walker: ShardWalker::new(&starts),
            assembler: TraceAssembler::new(self.config.assembler_config()),
            scheduler,
            watermark: SafeWatermark::new(&starts),
            policy: RetryPolicy::new(self.config.retry.clone()),
            fetch,
            lead: lead_tx,
            workers: HashMap::new(),
            held: BTreeMap::new(),
            carry: (Vec::new(), Vec::new()),
            unsaved: BTreeMap::new(),
            tops: BTreeMap::new(),
            replay_from: starts.iter().map(|c| (c.shard, c.seqno)).collect(),
            last_swept: None,
            replay_until,
            gap_attempts: HashMap::new(),
            summary: RunSummary::default(),
            state: IndexerState::Running,
        };
        if !run.replay_until.is_empty() {
            run.state = IndexerState::Replaying;
        }
        self.state = run.state;

        info!(
            indexer_id = %self.config.id,
            shards = starts.len(),
            replaying = run.replay_until.len(),
            "index loop started"
        );
        for cursor in &starts {
            run.open_shard(*cursor);
        }

        let driven = run.drive(shutdown, &mut events_rx).await;

        run.state = IndexerState::Stopping;
        self.state = IndexerState::Stopping;
        shutdown_tx.send_replace(true);
        for (_, worker) in run.workers.drain() {
            worker.stop();
        }
        let drained = run.drain().await;

        let result = driven.and(drained);
        run.state = match &result {
            Ok(()) => IndexerState::Stopped,
            Err(err) => {
                error!(indexer_id = %self.config.id, error = %err, "index loop halted");
                IndexerState::Error
            }
        };
        self.state = run.state;
        run.summary.state = run.state;
        run.summary.safe_mc_seqno = run.watermark.safe_mc_seqno();
        info!(
            state = %run.state,
            blocks_committed = run.summary.blocks_committed,
            actions_written = run.summary.actions_written,
            safe_mc_seqno = ?run.summary.safe_mc_seqno,
            "index loop stopped"
        );
        result.map(|()| run.summary)
    }

    /// Start cursors per shard, and the checkpointed seqno of each shard that
    /// resumes inside its replay window.
    async fn resume_points(&self) -> Result<(Vec<Cursor>, HashMap<ShardIdent, u32>), IndexerError> {
        let mut starts: BTreeMap<ShardIdent, Cursor> = self.config.start.iter().map(|c| (c.shard, *c)).collect();
        let mut replay_until = HashMap::new();

        for cp in self.checkpoint.list().await? {
            let floor = starts.get(&cp.shard).map(|c| c.seqno).unwrap_or(0);
            let resume = cp.replay_start(self.config.replay_depth).max(floor);
            info!(
                shard = %cp.shard,
                checkpoint = cp.seqno,
                replay_from = ?cp.replay_from,
                resume,
                "resuming from checkpoint"
            );
            if resume <= cp.seqno {
                replay_until.insert(cp.shard, cp.seqno);
            }
            starts.insert(cp.shard, Cursor::new(cp.shard, resume));
        }
        Ok((starts.into_values().collect(), replay_until))
    }
}

/// State of one run of the loop.
struct Run<'a> {
    config: &'a IndexerConfig,
    checkpoint: &'a CheckpointManager,
    classifier: Arc<Classifier>,
    walker: ShardWalker,
    assembler: TraceAssembler,
    scheduler: BatchScheduler,
    watermark: SafeWatermark,
    policy: RetryPolicy,
    fetch: FetchContext,
    /// Highest masterchain seqno released by the walker.
    lead: watch::Sender<u32>,
    workers: HashMap<ShardIdent, FetchWorker>,
    /// Masterchain batches waiting for the scanned frontier, by seqno.
    held: BTreeMap<u32, EntityBatch>,
    /// Finalized traces and actions not yet attached to a masterchain batch.
    carry: (Vec<TraceSummary>, Vec<Action>),
    /// Submitted masterchain batches carrying traces → oldest trace root.
    unsaved: BTreeMap<u32, u32>,
    /// Shard tops of processed masterchain blocks at or above the horizon.
    tops: BTreeMap<u32, Vec<BlockId>>,
    /// Per shard: first seqno a restart has to re-read.
    replay_from: HashMap<ShardIdent, u32>,
    last_swept: Option<u32>,
    replay_until: HashMap<ShardIdent, u32>,
    /// Per shard: re-poll attempts and the earliest time of the next one.
    gap_attempts: HashMap<ShardIdent, (u32, Instant)>,
    summary: RunSummary,
    state: IndexerState,
}

impl Run<'_> {
    async fn drive<F>(&mut self, shutdown: F, events: &mut mpsc::Receiver<FetchEvent>) -> Result<(), IndexerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self
                .scheduler
                .next_deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(FetchEvent::Blocks { shard, blocks, malformed }) => {
                        self.on_blocks(shard, blocks, malformed).await?;
                    }
                    Some(FetchEvent::Failed { cursor, error }) => {
                        error!(%cursor, error = %error, "record source failed");
                        return Err(error.into());
                    }
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(deadline) => {}
                _ = ticker.tick() => self.retry_gaps(),
            }

            let outcome = self.scheduler.flush(false).await;
            self.apply(outcome).await?;

            if let (Some(stop), Some(safe)) = (self.config.stop_at_mc_seqno, self.watermark.safe_mc_seqno()) {
                if safe >= stop {
                    info!(safe_mc_seqno = safe, stop_at_mc_seqno = stop, "stop seqno reached");
                    return Ok(());
                }
            }
        }
    }

    /// Commit everything still queued.
    async fn drain(&mut self) -> Result<(), IndexerError> {
        if self.scheduler.is_idle() {
            return Ok(());
        }
        info!(queued_blocks = self.scheduler.queued_blocks(), "draining queued batches");
        let outcome = self.scheduler.flush(true).await;
        self.apply(outcome).await
    }

    async fn on_blocks(
        &mut self,
        shard: ShardIdent,
        blocks: Vec<BlockData>,
        malformed: Vec<MalformedRecord>,
    ) -> Result<(), IndexerError> {
        for record in &malformed {
            warn!(
                %shard,
                id = %record.id,
                block = ?record.block,
                reason = %record.reason,
                "malformed record skipped"
            );
        }
        self.summary.malformed_records += malformed.len() as u64;

        for data in blocks {
            let changes = self.walker.accept(data);
            self.on_topology(changes);
        }
        let drained = self.walker.drain_ready();
        self.on_topology(drained.changes);
        for data in drained.blocks {
            self.process_block(data)?;
        }

        self.finalize().await?;
        self.scheduler.set_pending_traces(self.assembler.pending_count());
        self.scheduler.set_backlog(self.walker.buffered() + self.held.len());
        Ok(())
    }

    fn process_block(&mut self, mut data: BlockData) -> Result<(), IndexerError> {
        let id = data.id();
        self.summary.blocks_emitted += 1;

        let repaired = data.transactions.iter_mut().map(|t| t.tx.repair_gas()).filter(|&r| r).count();
        if repaired > 0 {
            debug!(block = %id, repaired, "swapped gas fields repaired");
        }

        let batch = EntityBatch::from_block(&data);
        self.note_replayed(id);
        if id.shard.is_masterchain() {
            self.watermark.observe(&data.block);
            self.tops.insert(id.seqno, data.block.shard_tops.clone());
            self.lead.send_if_modified(|lead| {
                let advanced = id.seqno > *lead;
                *lead = (*lead).max(id.seqno);
                advanced
            });
        }
        for tx in data.transactions {
            self.assembler.ingest(tx);
        }

        if id.shard.is_masterchain() {
            self.held.insert(id.seqno, batch);
            Ok(())
        } else {
            self.submit(batch)
        }
    }

    fn note_replayed(&mut self, id: BlockId) {
        if self.replay_until.get(&id.shard).is_some_and(|&until| id.seqno >= until) {
            self.replay_until.remove(&id.shard);
            if self.replay_until.is_empty() && self.state == IndexerState::Replaying {
                info!("replay complete");
                self.state = IndexerState::Running;
            }
        }
    }

    /// Sweep the assembler once the scanned frontier advances, and release
    /// the masterchain batches it covers.
    async fn finalize(&mut self) -> Result<(), IndexerError> {
        let Some(frontier) = self.walker.scanned_frontier() else {
            return Ok(());
        };
        if self.last_swept.is_some_and(|s| s >= frontier) {
            return Ok(());
        }
        self.last_swept = Some(frontier);

        let finalized = self.assembler.sweep(frontier);
        let (traces, actions) = self.classify(finalized).await?;
        self.carry.0.extend(traces);
        self.carry.1.extend(actions);

        let rest = self.held.split_off(&frontier.saturating_add(1));
        let mut ready = std::mem::replace(&mut self.held, rest);
        // Replayed batches are skipped as duplicates; traces wait for a new one.
        let committed = self.scheduler.last_committed(ShardIdent::MASTERCHAIN);
        let target = ready
            .iter_mut()
            .rev()
            .find(|(seqno, _)| committed.map_or(true, |c| **seqno > c));
        if let Some((seqno, last)) = target {
            if let Some(oldest) = self.carry.0.iter().map(|t| t.start_mc_seqno).min() {
                self.unsaved.insert(*seqno, oldest);
            }
            last.traces.append(&mut self.carry.0);
            last.actions.append(&mut self.carry.1);
        }
        self.update_replay_points(frontier);
        for (_, batch) in ready {
            self.submit(batch)?;
        }
        Ok(())
    }

    /// Move the replay horizon and the per-shard replay points behind it.
    fn update_replay_points(&mut self, frontier: u32) {
        let limit = self
            .carry
            .0
            .iter()
            .map(|t| t.start_mc_seqno)
            .chain(self.unsaved.values().copied())
            .fold(frontier.saturating_add(1), u32::min);
        let horizon = self.assembler.replay_horizon(limit);
        self.replay_from.insert(ShardIdent::MASTERCHAIN, horizon);

        let Some(below) = horizon.checked_sub(1) else {
            return;
        };
        if let Some(tops) = self.tops.get(&below) {
            for top in tops {
                self.replay_from.insert(top.shard, top.seqno.saturating_add(1));
            }
        }
        self.tops = self.tops.split_off(&below);
        trace!(horizon, frontier, "replay horizon");
    }

    async fn classify(&mut self, traces: Vec<Trace>) -> Result<(Vec<TraceSummary>, Vec<Action>), IndexerError> {
        if traces.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let classifier = Arc::clone(&self.classifier);
        let (traces, actions) = tokio::task::spawn_blocking(move || {
            let mut traces = traces;
            let actions = classifier.classify_all(&mut traces);
            (traces, actions)
        })
        .await
        .map_err(|e| IndexerError::Other(format!("classifier task failed: {e}")))?;

        let mut summaries = Vec::with_capacity(traces.len());
        for trace in &traces {
            match trace.state {
                TraceState::Complete => self.summary.traces_completed += 1,
                TraceState::Broken => self.summary.traces_broken += 1,
                TraceState::Pending => {}
            }
            summaries.push(trace.summary());
        }
        let actions: Vec<Action> = actions.into_iter().flatten().collect();
        debug!(traces = summaries.len(), actions = actions.len(), "traces classified");
        Ok((summaries, actions))
    }

    fn submit(&mut self, batch: EntityBatch) -> Result<(), IndexerError> {
        let blocks: Vec<BlockId> = batch.block_ids().collect();
        let Some(shard) = batch.shard else {
            return Err(IndexerError::Other("entity batch without a shard".into()));
        };
        if self.scheduler.submit(batch)? == Submitted::Duplicate {
            // Already durable from an earlier run.
            let committed = self.scheduler.last_committed(shard);
            for id in blocks {
                if committed.is_some_and(|c| id.seqno <= c) {
                    self.walker.acknowledge(id);
                    self.advance_watermark(id);
                }
            }
        }
        Ok(())
    }

    async fn apply(&mut self, outcome: FlushOutcome) -> Result<(), IndexerError> {
        for ack in outcome.acks {
            for (id, _) in &ack.blocks {
                self.walker.acknowledge(*id);
                self.advance_watermark(*id);
            }
            if ack.shard.is_masterchain() {
                self.unsaved = self.unsaved.split_off(&ack.seqno.saturating_add(1));
            }
            if let Some((last, root_hash)) = ack.blocks.last() {
                let replay_from = self.replay_from.get(&ack.shard).copied();
                self.checkpoint.store_cursor(*last, root_hash, replay_from).await?;
            }
            self.summary.blocks_committed += ack.blocks.len() as u64;
            self.summary.actions_written += ack.actions as u64;
            debug!(
                shard = %ack.shard,
                first_seqno = ack.first_seqno,
                seqno = ack.seqno,
                traces = ack.traces,
                actions = ack.actions,
                "batch acknowledged"
            );
        }
        match outcome.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn advance_watermark(&mut self, id: BlockId) {
        if let Some(safe) = self.watermark.acknowledge(id) {
            debug!(safe_mc_seqno = safe, "safe watermark advanced");
        }
    }

    fn on_topology(&mut self, changes: Vec<TopologyChange>) {
        for change in changes {
            match change {
                TopologyChange::Opened(cursor) => self.open_shard(cursor),
                TopologyChange::Closed(shard) => {
                    if let Some(worker) = self.workers.remove(&shard) {
                        debug!(%shard, "fetch worker closed");
                        worker.stop();
                    }
                }
            }
        }
    }

    fn open_shard(&mut self, cursor: Cursor) {
        if self.workers.get(&cursor.shard).is_some_and(|w| !w.is_finished()) {
            return;
        }
        info!(%cursor, "fetch worker opened");
        self.replay_from.entry(cursor.shard).or_insert(cursor.seqno);
        let worker = FetchWorker::spawn(self.fetch.clone(), cursor);
        self.workers.insert(cursor.shard, worker);
    }

    /// Re-poll shards whose missing blocks keep others buffered.
    fn retry_gaps(&mut self) {
        let gaps = self.walker.gaps();
        let gapped: BTreeSet<ShardIdent> = gaps.iter().map(|g| g.shard).collect();
        self.gap_attempts.retain(|shard, _| gapped.contains(shard));

        let now = Instant::now();
        for gap in gaps {
            let (attempt, not_before) = self.gap_attempts.get(&gap.shard).copied().unwrap_or((0, now));
            if now < not_before {
                continue;
            }
            let attempt = attempt + 1;
            self.gap_attempts
                .insert(gap.shard, (attempt, now + self.policy.backoff(attempt)));
            warn!(%gap, attempt, buffered = self.walker.buffered(), "gap in shard, re-polling source");

            match self.workers.get(&gap.shard) {
                Some(worker) if !worker.is_finished() => {
                    debug!(from = %worker.start(), seqno = gap.seqno, "rewinding fetch worker");
                    worker.rewind(gap.seqno);
                }
                _ => self.open_shard(gap),
            }
        }
    }
}
