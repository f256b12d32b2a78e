//! Indexer configuration and state types.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assembler::AssemblerConfig;
use crate::cursor::Cursor;
use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::scheduler::SchedulerConfig;
use crate::types::ShardIdent;

/// Logging configuration consumed by the pipeline's tracing setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Global level: `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Per-target overrides, e.g. `{"tonindex_core::assembler": "debug"}`.
    pub components: HashMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used for checkpoint keys).
    pub id: String,
    /// Shards and seqnos to start from when no checkpoint exists.
    /// Must include the masterchain.
    pub start: Vec<Cursor>,
    /// Stop once the safe masterchain seqno reaches this value. `None` = run forever.
    pub stop_at_mc_seqno: Option<u32>,
    /// Maximum PENDING traces before the oldest are forced to BROKEN.
    pub max_pending_traces: usize,
    /// Masterchain seqnos a trace may stay PENDING.
    pub trace_ttl_mc_seqnos: u32,
    /// Lock partitions in the trace assembler.
    pub lock_partitions: usize,
    /// Blocks coalesced into one commit.
    pub batch_max_blocks: usize,
    /// Longest time a partial batch waits before commit (milliseconds).
    pub batch_window_ms: u64,
    /// Backoff for commit retries and source polling.
    pub retry: RetryConfig,
    /// Commit latency that triggers backpressure (milliseconds).
    pub max_commit_latency_ms: u64,
    /// PENDING trace count that triggers backpressure.
    pub backpressure_pending_traces: usize,
    /// Uncommitted blocks that trigger backpressure, counting blocks still
    /// buffered by the walker or held for the scanned frontier.
    pub max_queued_blocks: usize,
    /// Capacity of the channel between fetch workers and the main loop.
    pub fetch_channel_capacity: usize,
    /// Delay between polls of a caught-up shard (milliseconds).
    pub poll_interval_ms: u64,
    /// Blocks re-read before a checkpoint that carries no replay point.
    /// Checkpoints written by this version record their own replay point.
    pub replay_depth: u32,
    pub log: LogConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            start: vec![
                Cursor::new(ShardIdent::MASTERCHAIN, 1),
                Cursor::new(ShardIdent::full(0), 1),
            ],
            stop_at_mc_seqno: None,
            max_pending_traces: 100_000,
            trace_ttl_mc_seqnos: 100,
            lock_partitions: 64,
            batch_max_blocks: 32,
            batch_window_ms: 500,
            retry: RetryConfig::default(),
            max_commit_latency_ms: 5_000,
            backpressure_pending_traces: 80_000,
            max_queued_blocks: 1024,
            fetch_channel_capacity: 256,
            poll_interval_ms: 1_000,
            replay_depth: 16,
            log: LogConfig::default(),
        }
    }
}

impl IndexerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.id.trim().is_empty() {
            return Err(invalid("id", "must not be empty"));
        }
        if !self.start.iter().any(|c| c.shard.is_masterchain()) {
            return Err(invalid("start", "must include a masterchain cursor"));
        }
        let mut seen = std::collections::HashSet::new();
        for cursor in &self.start {
            if !seen.insert(cursor.shard) {
                return Err(invalid("start", format!("shard {} listed twice", cursor.shard)));
            }
        }
        if self.max_pending_traces == 0 {
            return Err(invalid("max_pending_traces", "must be positive"));
        }
        if self.trace_ttl_mc_seqnos == 0 {
            return Err(invalid("trace_ttl_mc_seqnos", "must be positive"));
        }
        if self.lock_partitions == 0 {
            return Err(invalid("lock_partitions", "must be positive"));
        }
        if self.batch_max_blocks == 0 {
            return Err(invalid("batch_max_blocks", "must be positive"));
        }
        if self.fetch_channel_capacity == 0 {
            return Err(invalid("fetch_channel_capacity", "must be positive"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid("retry.initial_backoff_ms", "exceeds retry.max_backoff_ms"));
        }
        Ok(())
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            partitions: self.lock_partitions,
            max_pending: self.max_pending_traces,
            ttl_mc_seqnos: self.trace_ttl_mc_seqnos,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_max_blocks: self.batch_max_blocks,
            batch_window: Duration::from_millis(self.batch_window_ms),
            max_commit_latency: Duration::from_millis(self.max_commit_latency_ms),
            max_pending_traces: self.backpressure_pending_traces,
            max_queued_blocks: self.max_queued_blocks,
            retry: self.retry.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Replaying blocks before the checkpoint to rebuild trace state.
    Replaying,
    /// Following the chain.
    Running,
    /// Draining in-flight batches before halting.
    Stopping,
    /// Terminated.
    Stopped,
    /// A shard halted on an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Replaying => write!(f, "replaying"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
