//! Fluent builder API for indexer configurations.
//!
//! # Example
//!
//! ```rust,no_run
//! use tonindex_pipeline::IndexerBuilder;
//! use tonindex_core::types::ShardIdent;
//!
//! let config = IndexerBuilder::new()
//!     .id("mainnet")
//!     .start(ShardIdent::MASTERCHAIN, 40_000_000)
//!     .start(ShardIdent::full(0), 45_000_000)
//!     .trace_ttl_mc_seqnos(100)
//!     .batch_max_blocks(64)
//!     .build()
//!     .unwrap();
//! ```

use tonindex_core::cursor::Cursor;
use tonindex_core::error::ConfigError;
use tonindex_core::indexer::IndexerConfig;
use tonindex_core::retry::RetryConfig;
use tonindex_core::types::ShardIdent;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    custom_start: bool,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the indexer ID (used for checkpoint keys).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Start `shard` at `seqno` when it has no checkpoint.
    ///
    /// The first call replaces the default start cursors.
    pub fn start(mut self, shard: ShardIdent, seqno: u32) -> Self {
        if !self.custom_start {
            self.config.start.clear();
            self.custom_start = true;
        }
        self.config.start.retain(|c| c.shard != shard);
        self.config.start.push(Cursor::new(shard, seqno));
        self
    }

    /// Stop once the safe masterchain seqno reaches `seqno` (bounded backfill).
    pub fn stop_at_mc_seqno(mut self, seqno: u32) -> Self {
        self.config.stop_at_mc_seqno = Some(seqno);
        self
    }

    pub fn max_pending_traces(mut self, n: usize) -> Self {
        self.config.max_pending_traces = n;
        self
    }

    /// Masterchain seqnos a trace may stay PENDING before it is marked BROKEN.
    pub fn trace_ttl_mc_seqnos(mut self, n: u32) -> Self {
        self.config.trace_ttl_mc_seqnos = n;
        self
    }

    pub fn lock_partitions(mut self, n: usize) -> Self {
        self.config.lock_partitions = n;
        self
    }

    pub fn batch_max_blocks(mut self, n: usize) -> Self {
        self.config.batch_max_blocks = n;
        self
    }

    pub fn batch_window_ms(mut self, ms: u64) -> Self {
        self.config.batch_window_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_commit_latency_ms(mut self, ms: u64) -> Self {
        self.config.max_commit_latency_ms = ms;
        self
    }

    pub fn backpressure_pending_traces(mut self, n: usize) -> Self {
        self.config.backpressure_pending_traces = n;
        self
    }

    pub fn max_queued_blocks(mut self, n: usize) -> Self {
        self.config.max_queued_blocks = n;
        self
    }

    pub fn fetch_channel_capacity(mut self, n: usize) -> Self {
        self.config.fetch_channel_capacity = n;
        self
    }

    /// Delay between polls of a caught-up shard in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Blocks re-read before each checkpoint on restart.
    pub fn replay_depth(mut self, depth: u32) -> Self {
        self.config.replay_depth = depth;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log.level = level.into();
        self
    }

    pub fn log_component(mut self, component: impl Into<String>, level: impl Into<String>) -> Self {
        self.config.log.components.insert(component.into(), level.into());
        self
    }

    pub fn log_json(mut self, json: bool) -> Self {
        self.config.log.json = json;
        self
    }

    /// Build the `IndexerConfig` without validating it.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build and validate the `IndexerConfig`.
    pub fn build(self) -> Result<IndexerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
