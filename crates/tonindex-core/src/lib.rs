//! tonindex-core — data model and pipeline stages of the tonindex engine.
//!
//! # Architecture
//!
//! ```text
//! RecordSource ─▶ ShardWalker ─▶ TraceAssembler ─▶ (classifier) ─▶ BatchScheduler ─▶ BatchWriter
//!   (cursor)       (topology,      (PENDING /                        (per-shard lanes,
//!                   gaps)           COMPLETE / BROKEN)                 retry, backpressure)
//!                                                                            │
//!                       CheckpointManager ◀── acks ── SafeWatermark ◀────────┘
//! ```
//!
//! The classifier lives in `tonindex-classify`; concrete stores in
//! `tonindex-storage`; orchestration in `tonindex-pipeline`.

pub mod action;
pub mod assembler;
pub mod checkpoint;
pub mod cursor;
pub mod error;
pub mod indexer;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod types;
pub mod walker;
pub mod watermark;
pub mod writer;

pub use action::{Action, ActionDetails, ActionKind, RawActionFields, ACTION_VOCABULARY_VERSION};
pub use assembler::{AssemblerConfig, BreakReason, Trace, TraceAssembler, TraceState, TraceSummary};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use cursor::Cursor;
pub use error::{ConfigError, IndexerError, SourceError, WriteError};
pub use indexer::{IndexerConfig, IndexerState, LogConfig};
pub use retry::{RetryConfig, RetryPolicy};
pub use scheduler::{BatchScheduler, CommitAck, FlushOutcome, SchedulerConfig, Submitted};
pub use source::{MalformedRecord, MemoryRecordSource, RecordBatch, RecordSource, SourcePoll};
pub use types::{Address, Block, BlockData, BlockId, Message, ShardIdent, Transaction, TransactionData};
pub use walker::{Drained, ShardWalker, TopologyChange};
pub use watermark::SafeWatermark;
pub use writer::{AccountStateDelta, BatchWriter, EntityBatch};
