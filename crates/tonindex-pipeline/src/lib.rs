//! tonindex-pipeline — fetch workers, index loop and builder API.
//!
//! ```text
//!  FetchWorker (per shard) ──mpsc──▶ IndexLoop ──▶ ShardWalker ──▶ TraceAssembler
//!        ▲                              │                              │ sweep(frontier)
//!        └──── pause (watch) ◀── BatchScheduler ◀── Classifier ◀───────┘
//! ```

pub mod builder;
pub mod fetcher;
pub mod index_loop;
pub mod observability;

pub use builder::IndexerBuilder;
pub use fetcher::{FetchEvent, FetchWorker};
pub use index_loop::{IndexLoop, RunSummary};
pub use observability::init_tracing;
