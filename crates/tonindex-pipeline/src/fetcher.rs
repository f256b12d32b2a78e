//! Per-shard fetch workers.
//!
//! Each live shard gets one worker task that polls the [`RecordSource`] from
//! its cursor, attaches records into blocks and forwards them to the index
//! loop. Workers obey the scheduler's backpressure signal, back off on
//! transient source errors and can be rewound when the walker reports a gap.
//!
//! A worker never moves its cursor past a missing block. When the source
//! skips a seqno, only the run below the hole is forwarded and the worker
//! keeps re-polling from the hole with backoff until the source fills it.
//!
//! Two kinds of worker keep polling while intake is paused, since held
//! masterchain batches cannot drain without them: a worker stalled on a
//! hole (or rewound onto one), and a shard worker whose blocks are still
//! behind the highest masterchain block the loop has released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tonindex_core::cursor::Cursor;
use tonindex_core::error::SourceError;
use tonindex_core::retry::RetryPolicy;
use tonindex_core::source::{MalformedRecord, RecordSource, SourcePoll};
use tonindex_core::types::{BlockData, ShardIdent};

/// Message from a fetch worker to the index loop.
#[derive(Debug)]
pub enum FetchEvent {
    Blocks {
        shard: ShardIdent,
        blocks: Vec<BlockData>,
        malformed: Vec<MalformedRecord>,
    },
    /// The source cannot serve this shard; the worker has exited.
    Failed { cursor: Cursor, error: SourceError },
}

/// Shared settings of all workers of one run.
#[derive(Clone)]
pub struct FetchContext {
    pub source: Arc<dyn RecordSource>,
    pub events: mpsc::Sender<FetchEvent>,
    pub pause: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
    /// Highest masterchain seqno released by the walker.
    pub lead: watch::Receiver<u32>,
    pub policy: RetryPolicy,
    pub poll_interval: Duration,
}

/// Handle to a running worker.
pub struct FetchWorker {
    cursor: Cursor,
    rewind: mpsc::UnboundedSender<u32>,
    task: JoinHandle<()>,
}

impl FetchWorker {
    pub fn spawn(ctx: FetchContext, cursor: Cursor) -> Self {
        let (rewind, rewind_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(ctx, cursor, rewind_rx));
        Self { cursor, rewind, task }
    }

    /// Cursor the worker was started at.
    pub fn start(&self) -> Cursor {
        self.cursor
    }

    /// Ask the worker to re-poll from `seqno`.
    pub fn rewind(&self, seqno: u32) {
        // A closed channel means the worker already exited.
        let _ = self.rewind.send(seqno);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Sleep unless shutdown is signalled first. Returns `false` on shutdown.
async fn idle(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Keep the blocks contiguous from `from`. Returns them, the next seqno to
/// poll and whether blocks past a missing seqno were dropped.
fn contiguous_run(from: u32, mut blocks: Vec<BlockData>) -> (Vec<BlockData>, u32, bool) {
    blocks.sort_by_key(|b| b.id().seqno);
    let mut next = from;
    for block in &blocks {
        let seqno = block.id().seqno;
        if seqno == next {
            next = next.saturating_add(1);
        } else if seqno > next {
            break;
        }
    }
    let hole = blocks.iter().any(|b| b.id().seqno > next);
    blocks.retain(|b| b.id().seqno < next);
    (blocks, next, hole)
}

async fn run_worker(mut ctx: FetchContext, mut cursor: Cursor, mut rewind: mpsc::UnboundedReceiver<u32>) {
    let shard = cursor.shard;
    let mut attempt = 0u32;
    let mut gap_attempt = 0u32;
    let mut stalled = false;
    // Highest masterchain seqno of a forwarded block.
    let mut last_mc: Option<u32> = None;
    debug!(%cursor, "fetch worker started");

    loop {
        if *ctx.shutdown.borrow() {
            break;
        }
        while let Ok(seqno) = rewind.try_recv() {
            if cursor.rewind(seqno) {
                stalled = true;
                debug!(%cursor, "fetch worker rewound");
            }
        }
        let lagging = !shard.is_masterchain() && last_mc.map_or(true, |m| m < *ctx.lead.borrow());
        if *ctx.pause.borrow() && !stalled && !lagging {
            tokio::select! {
                changed = ctx.pause.changed() => if changed.is_err() { break },
                changed = ctx.lead.changed() => if changed.is_err() { break },
                _ = ctx.shutdown.changed() => {}
            }
            continue;
        }

        match ctx.source.next_batch(&cursor).await {
            Ok(SourcePoll::Batch(batch)) => {
                attempt = 0;
                let (blocks, mut malformed) = batch.attach();
                let (blocks, next, hole) = contiguous_run(cursor.seqno, blocks);
                cursor.seqno = cursor.seqno.max(next);
                if hole {
                    // Records past the hole come back once it is filled.
                    malformed.retain(|r| r.block.is_some_and(|b| b.seqno < next));
                    stalled = true;
                    gap_attempt += 1;
                    if gap_attempt == 1 {
                        warn!(%cursor, "source skipped a block, holding cursor at the hole");
                    }
                } else {
                    stalled = false;
                    gap_attempt = 0;
                }
                if let Some(mc) = blocks.iter().map(|b| b.block.mc_seqno).max() {
                    last_mc = last_mc.max(Some(mc));
                }

                let idle_for = if hole && blocks.is_empty() {
                    Some(ctx.policy.backoff(gap_attempt))
                } else if blocks.is_empty() && malformed.is_empty() {
                    Some(ctx.poll_interval)
                } else {
                    None
                };
                if !blocks.is_empty() || !malformed.is_empty() {
                    let event = FetchEvent::Blocks {
                        shard,
                        blocks,
                        malformed,
                    };
                    if ctx.events.send(event).await.is_err() {
                        break;
                    }
                }
                if let Some(delay) = idle_for {
                    if !idle(delay, &mut ctx.shutdown).await {
                        break;
                    }
                }
            }
            Ok(SourcePoll::EndOfStream) => {
                attempt = 0;
                stalled = false;
                gap_attempt = 0;
                if !idle(ctx.poll_interval, &mut ctx.shutdown).await {
                    break;
                }
            }
            Err(err) if err.is_retryable() => {
                attempt += 1;
                let delay = ctx.policy.backoff(attempt);
                warn!(
                    %cursor,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "source poll failed, retrying"
                );
                if !idle(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
            Err(error) => {
                let _ = ctx.events.send(FetchEvent::Failed { cursor, error }).await;
                break;
            }
        }
    }
    debug!(%cursor, "fetch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonindex_core::source::MemoryRecordSource;
    use tonindex_core::types::{Block, BlockId};

    fn block(shard: ShardIdent, seqno: u32) -> Block {
        Block {
            id: BlockId::new(shard, seqno),
            root_hash: format!("root-{seqno}"),
            file_hash: format!("file-{seqno}"),
            gen_utime: 1_700_000_000,
            start_lt: seqno as u64 * 1000,
            end_lt: seqno as u64 * 1000 + 999,
            prev_blocks: vec![BlockId::new(shard, seqno - 1)],
            mc_seqno: seqno,
            before_split: false,
            after_split: false,
            after_merge: false,
            key_block: false,
            shard_tops: vec![],
            tx_count: 0,
        }
    }

    struct Handles {
        pause: watch::Sender<bool>,
        shutdown: watch::Sender<bool>,
        lead: watch::Sender<u32>,
    }

    fn context(source: Arc<MemoryRecordSource>) -> (FetchContext, mpsc::Receiver<FetchEvent>, Handles) {
        let (events, rx) = mpsc::channel(16);
        let (pause_tx, pause) = watch::channel(false);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (lead_tx, lead) = watch::channel(0);
        let ctx = FetchContext {
            source,
            events,
            pause,
            shutdown,
            lead,
            policy: RetryPolicy::default(),
            poll_interval: Duration::from_millis(5),
        };
        let handles = Handles {
            pause: pause_tx,
            shutdown: shutdown_tx,
            lead: lead_tx,
        };
        (ctx, rx, handles)
    }

    async fn next_seqnos(rx: &mut mpsc::Receiver<FetchEvent>) -> Vec<u32> {
        match rx.recv().await {
            Some(FetchEvent::Blocks { blocks, .. }) => blocks.iter().map(|b| b.id().seqno).collect(),
            Some(FetchEvent::Failed { error, .. }) => panic!("unexpected failure: {error}"),
            None => panic!("worker exited"),
        }
    }

    #[tokio::test]
    async fn worker_forwards_blocks_after_transient_errors() {
        let shard = ShardIdent::full(0);
        let source = Arc::new(MemoryRecordSource::new(2));
        for seqno in 1..=3 {
            source.push_block(block(shard, seqno), vec![], vec![]);
        }
        source.fail_next(2);

        let (mut ctx, mut rx, handles) = context(source);
        ctx.policy.config.initial_backoff_ms = 1;
        let worker = FetchWorker::spawn(ctx, Cursor::new(shard, 1));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match rx.recv().await.unwrap() {
                FetchEvent::Blocks { blocks, .. } => seen.extend(blocks.iter().map(|b| b.id().seqno)),
                FetchEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);

        handles.shutdown.send_replace(true);
        worker.stop();
    }

    #[tokio::test]
    async fn rewind_refetches_from_gap() {
        let shard = ShardIdent::full(0);
        let source = Arc::new(MemoryRecordSource::new(8));
        source.push_block(block(shard, 1), vec![], vec![]);

        let (ctx, mut rx, handles) = context(source.clone());
        let worker = FetchWorker::spawn(ctx, Cursor::new(shard, 1));
        assert_eq!(next_seqnos(&mut rx).await, vec![1]);

        worker.rewind(1);
        assert_eq!(next_seqnos(&mut rx).await, vec![1]);

        handles.shutdown.send_replace(true);
        worker.stop();
    }

    #[tokio::test]
    async fn paused_worker_does_not_poll() {
        let shard = ShardIdent::MASTERCHAIN;
        let source = Arc::new(MemoryRecordSource::new(8));
        source.push_block(block(shard, 1), vec![], vec![]);

        let (ctx, mut rx, handles) = context(source);
        handles.pause.send_replace(true);
        let worker = FetchWorker::spawn(ctx, Cursor::new(shard, 1));

        let waited = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(waited.is_err(), "worker polled while paused");

        handles.pause.send_replace(false);
        assert!(matches!(rx.recv().await, Some(FetchEvent::Blocks { .. })));

        handles.shutdown.send_replace(true);
        worker.stop();
    }

    #[tokio::test]
    async fn worker_holds_cursor_at_missing_block() {
        let shard = ShardIdent::full(0);
        let source = Arc::new(MemoryRecordSource::new(8));
        for seqno in [1, 2, 4, 5] {
            source.push_block(block(shard, seqno), vec![], vec![]);
        }

        let (mut ctx, mut rx, handles) = context(source.clone());
        ctx.policy.config.initial_backoff_ms = 1;
        ctx.policy.config.max_backoff_ms = 5;
        let worker = FetchWorker::spawn(ctx, Cursor::new(shard, 1));
        assert_eq!(next_seqnos(&mut rx).await, vec![1, 2]);

        // 4 and 5 are never forwarded ahead of 3.
        let waited = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(waited.is_err(), "worker skipped the hole");

        source.push_block(block(shard, 3), vec![], vec![]);
        assert_eq!(next_seqnos(&mut rx).await, vec![3, 4, 5]);

        handles.shutdown.send_replace(true);
        worker.stop();
    }

    #[tokio::test]
    async fn lagging_shard_worker_ignores_pause() {
        let shard = ShardIdent::full(0);
        let source = Arc::new(MemoryRecordSource::new(1));
        for seqno in 1..=4 {
            source.push_block(block(shard, seqno), vec![], vec![]);
        }

        let (ctx, mut rx, handles) = context(source);
        handles.pause.send_replace(true);
        handles.lead.send_replace(2);
        let worker = FetchWorker::spawn(ctx, Cursor::new(shard, 1));

        // Catches up to the masterchain lead, then obeys the pause.
        assert_eq!(next_seqnos(&mut rx).await, vec![1]);
        assert_eq!(next_seqnos(&mut rx).await, vec![2]);
        let waited = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(waited.is_err(), "worker ran ahead of the masterchain while paused");

        handles.lead.send_replace(3);
        assert_eq!(next_seqnos(&mut rx).await, vec![3]);

        handles.shutdown.send_replace(true);
        worker.stop();
    }
}
