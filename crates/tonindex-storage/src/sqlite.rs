//! SQLite storage backend for TonIndex.
//!
//! Persists entity batches and checkpoints to a single SQLite file. Each
//! batch is written in one transaction; re-committing a batch upserts the
//! same rows. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use tonindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction as SqlTx};
use tracing::debug;

use tonindex_core::action::Action;
use tonindex_core::checkpoint::{Checkpoint, CheckpointStore};
use tonindex_core::error::{IndexerError, WriteError};
use tonindex_core::types::{Block, BlockId, Direction, ShardIdent, Transaction};
use tonindex_core::writer::{BatchWriter, EntityBatch};
use tonindex_core::TraceSummary;

use crate::error::StoreError;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        workchain   INTEGER NOT NULL,
        shard       INTEGER NOT NULL,
        seqno       INTEGER NOT NULL,
        root_hash   TEXT    NOT NULL,
        mc_seqno    INTEGER NOT NULL,
        gen_utime   INTEGER NOT NULL,
        data        TEXT    NOT NULL,
        PRIMARY KEY (workchain, shard, seqno)
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        hash        TEXT    PRIMARY KEY,
        account     TEXT    NOT NULL,
        lt          INTEGER NOT NULL,
        workchain   INTEGER NOT NULL,
        shard       INTEGER NOT NULL,
        seqno       INTEGER NOT NULL,
        mc_seqno    INTEGER NOT NULL,
        data        TEXT    NOT NULL,
        FOREIGN KEY (workchain, shard, seqno) REFERENCES blocks (workchain, shard, seqno)
    );",
    "CREATE TABLE IF NOT EXISTS messages (
        msg_hash    TEXT    NOT NULL,
        tx_hash     TEXT    NOT NULL,
        direction   TEXT    NOT NULL,
        source      TEXT,
        destination TEXT,
        opcode      INTEGER,
        data        TEXT    NOT NULL,
        PRIMARY KEY (msg_hash, tx_hash, direction)
    );",
    "CREATE TABLE IF NOT EXISTS account_states (
        account     TEXT    PRIMARY KEY,
        last_tx_lt  INTEGER NOT NULL,
        last_tx_hash TEXT   NOT NULL,
        state_hash  TEXT    NOT NULL,
        data        TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS traces (
        trace_id      TEXT    PRIMARY KEY,
        external_hash TEXT,
        state         TEXT    NOT NULL,
        start_lt      INTEGER NOT NULL,
        end_lt        INTEGER NOT NULL,
        end_mc_seqno  INTEGER NOT NULL,
        data          TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS actions (
        trace_id    TEXT    NOT NULL REFERENCES traces (trace_id),
        action_id   INTEGER NOT NULL,
        type        TEXT    NOT NULL,
        start_lt    INTEGER NOT NULL,
        data        TEXT    NOT NULL,
        PRIMARY KEY (trace_id, action_id)
    );",
    "CREATE TABLE IF NOT EXISTS shard_progress (
        workchain   INTEGER NOT NULL,
        shard       INTEGER NOT NULL,
        seqno       INTEGER NOT NULL,
        PRIMARY KEY (workchain, shard)
    );",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        indexer_id  TEXT    NOT NULL,
        workchain   INTEGER NOT NULL,
        shard       INTEGER NOT NULL,
        seqno       INTEGER NOT NULL,
        root_hash   TEXT    NOT NULL,
        replay_from INTEGER,
        updated_at  INTEGER NOT NULL,
        PRIMARY KEY (indexer_id, workchain, shard)
    );",
    "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions (account, lt);",
    "CREATE INDEX IF NOT EXISTS idx_actions_type ON actions (type);",
];

/// Shard ids are stored as signed 64-bit integers (bit pattern preserved).
fn shard_col(shard: ShardIdent) -> i64 {
    shard.shard as i64
}

fn shard_from_cols(workchain: i64, shard: i64) -> ShardIdent {
    ShardIdent {
        workchain: workchain as i32,
        shard: shard as u64,
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db)
            if db.is_foreign_key_violation() || db.is_unique_violation() || db.is_check_violation() =>
        {
            StoreError::Constraint(db.message().to_string())
        }
        // SQLITE_BUSY / SQLITE_LOCKED
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("5") | Some("6")) => {
            StoreError::Unavailable(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn storage_err(err: sqlx::Error) -> IndexerError {
    IndexerError::Storage(err.to_string())
}

/// SQLite-backed storage for entity batches and checkpoints.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePool::connect("sqlite::memory:").await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        sqlx::query("PRAGMA foreign_keys=ON;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // ─── Batch writes ───────────────────────────────────────────────────────────

    async fn write_batch(&self, shard: ShardIdent, seqno: u32, batch: &EntityBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        for block in &batch.blocks {
            Self::upsert_block(&mut tx, block).await?;
        }
        for t in &batch.transactions {
            Self::upsert_transaction(&mut tx, t).await?;
        }
        for msg in &batch.messages {
            sqlx::query(
                "INSERT OR REPLACE INTO messages
                 (msg_hash, tx_hash, direction, source, destination, opcode, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&msg.hash)
            .bind(&msg.tx_hash)
            .bind(match msg.direction {
                Direction::In => "in",
                Direction::Out => "out",
            })
            .bind(&msg.source)
            .bind(&msg.destination)
            .bind(msg.opcode.map(i64::from))
            .bind(serde_json::to_string(msg)?)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        for delta in &batch.account_states {
            sqlx::query(
                "INSERT INTO account_states (account, last_tx_lt, last_tx_hash, state_hash, data)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (account) DO UPDATE SET
                    last_tx_lt = excluded.last_tx_lt,
                    last_tx_hash = excluded.last_tx_hash,
                    state_hash = excluded.state_hash,
                    data = excluded.data
                 WHERE excluded.last_tx_lt >= account_states.last_tx_lt",
            )
            .bind(&delta.account)
            .bind(delta.last_tx_lt as i64)
            .bind(&delta.last_tx_hash)
            .bind(&delta.state_hash_after)
            .bind(serde_json::to_string(delta)?)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        for trace in &batch.traces {
            Self::upsert_trace(&mut tx, trace).await?;
            sqlx::query("DELETE FROM actions WHERE trace_id = ?")
                .bind(&trace.trace_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        for action in &batch.actions {
            Self::insert_action(&mut tx, action).await?;
        }

        sqlx::query(
            "INSERT INTO shard_progress (workchain, shard, seqno) VALUES (?, ?, ?)
             ON CONFLICT (workchain, shard) DO UPDATE SET seqno = MAX(seqno, excluded.seqno)",
        )
        .bind(shard.workchain)
        .bind(shard_col(shard))
        .bind(seqno as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_block(tx: &mut SqlTx<'_, Sqlite>, block: &Block) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO blocks (workchain, shard, seqno, root_hash, mc_seqno, gen_utime, data)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (workchain, shard, seqno) DO UPDATE SET
                root_hash = excluded.root_hash,
                mc_seqno = excluded.mc_seqno,
                gen_utime = excluded.gen_utime,
                data = excluded.data",
        )
        .bind(block.id.shard.workchain)
        .bind(shard_col(block.id.shard))
        .bind(block.id.seqno as i64)
        .bind(&block.root_hash)
        .bind(block.mc_seqno as i64)
        .bind(block.gen_utime as i64)
        .bind(serde_json::to_string(block)?)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_transaction(tx: &mut SqlTx<'_, Sqlite>, t: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO transactions
             (hash, account, lt, workchain, shard, seqno, mc_seqno, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&t.hash)
        .bind(&t.account)
        .bind(t.lt as i64)
        .bind(t.block.shard.workchain)
        .bind(shard_col(t.block.shard))
        .bind(t.block.seqno as i64)
        .bind(t.mc_seqno as i64)
        .bind(serde_json::to_string(t)?)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_trace(tx: &mut SqlTx<'_, Sqlite>, trace: &TraceSummary) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO traces (trace_id, external_hash, state, start_lt, end_lt, end_mc_seqno, data)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (trace_id) DO UPDATE SET
                external_hash = excluded.external_hash,
                state = excluded.state,
                start_lt = excluded.start_lt,
                end_lt = excluded.end_lt,
                end_mc_seqno = excluded.end_mc_seqno,
                data = excluded.data",
        )
        .bind(&trace.trace_id)
        .bind(&trace.external_hash)
        .bind(trace.state.to_string())
        .bind(trace.start_lt as i64)
        .bind(trace.end_lt as i64)
        .bind(trace.end_mc_seqno as i64)
        .bind(serde_json::to_string(trace)?)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_action(tx: &mut SqlTx<'_, Sqlite>, action: &Action) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO actions (trace_id, action_id, type, start_lt, data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&action.trace_id)
        .bind(action.action_id as i64)
        .bind(action.kind.as_str())
        .bind(action.start_lt as i64)
        .bind(serde_json::to_string(action)?)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────────────

    pub async fn block(&self, id: BlockId) -> Result<Option<Block>, IndexerError> {
        let row = sqlx::query("SELECT data FROM blocks WHERE workchain = ? AND shard = ? AND seqno = ?")
            .bind(id.shard.workchain)
            .bind(shard_col(id.shard))
            .bind(id.seqno as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| decode(&r.get::<String, _>("data"))).transpose()
    }

    pub async fn transaction(&self, hash: &str) -> Result<Option<Transaction>, IndexerError> {
        let row = sqlx::query("SELECT data FROM transactions WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| decode(&r.get::<String, _>("data"))).transpose()
    }

    pub async fn trace(&self, trace_id: &str) -> Result<Option<TraceSummary>, IndexerError> {
        let row = sqlx::query("SELECT data FROM traces WHERE trace_id = ?")
            .bind(trace_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| decode(&r.get::<String, _>("data"))).transpose()
    }

    /// Actions of one trace, ordered by position.
    pub async fn actions_for(&self, trace_id: &str) -> Result<Vec<Action>, IndexerError> {
        let rows = sqlx::query("SELECT data FROM actions WHERE trace_id = ? ORDER BY action_id")
            .bind(trace_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(|r| decode(&r.get::<String, _>("data"))).collect()
    }

    /// Row count of one of the entity tables.
    pub async fn count(&self, table: &str) -> Result<u64, IndexerError> {
        const TABLES: &[&str] = &["blocks", "transactions", "messages", "account_states", "traces", "actions"];
        if !TABLES.contains(&table) {
            return Err(IndexerError::Storage(format!("unknown table {table}")));
        }
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, IndexerError> {
    serde_json::from_str(data).map_err(|e| IndexerError::Storage(e.to_string()))
}

// ─── BatchWriter impl ────────────────────────────────────────────────────────

#[async_trait]
impl BatchWriter for SqliteStorage {
    async fn commit(&self, shard: ShardIdent, seqno: u32, batch: &EntityBatch) -> Result<(), WriteError> {
        self.write_batch(shard, seqno, batch).await?;
        debug!(
            %shard,
            seqno,
            blocks = batch.blocks.len(),
            transactions = batch.transactions.len(),
            actions = batch.actions.len(),
            "batch committed"
        );
        Ok(())
    }

    async fn last_committed(&self, shard: ShardIdent) -> Result<Option<u32>, WriteError> {
        let row = sqlx::query("SELECT seqno FROM shard_progress WHERE workchain = ? AND shard = ?")
            .bind(shard.workchain)
            .bind(shard_col(shard))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WriteError::from(map_sqlx(e)))?;
        Ok(row.map(|r| r.get::<i64, _>("seqno") as u32))
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(
        &self,
        indexer_id: &str,
        shard: ShardIdent,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT indexer_id, workchain, shard, seqno, root_hash, replay_from, updated_at
             FROM checkpoints WHERE indexer_id = ? AND workchain = ? AND shard = ?",
        )
        .bind(indexer_id)
        .bind(shard.workchain)
        .bind(shard_col(shard))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| checkpoint_from_row(&r)))
    }

    async fn list(&self, indexer_id: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        let rows = sqlx::query(
            "SELECT indexer_id, workchain, shard, seqno, root_hash, replay_from, updated_at
             FROM checkpoints WHERE indexer_id = ?",
        )
        .bind(indexer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut out: Vec<Checkpoint> = rows.iter().map(checkpoint_from_row).collect();
        out.sort_by_key(|cp| cp.shard);
        Ok(out)
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (indexer_id, workchain, shard, seqno, root_hash, replay_from, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.indexer_id)
        .bind(checkpoint.shard.workchain)
        .bind(shard_col(checkpoint.shard))
        .bind(checkpoint.seqno as i64)
        .bind(&checkpoint.root_hash)
        .bind(checkpoint.replay_from.map(i64::from))
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            indexer_id = %checkpoint.indexer_id,
            shard = %checkpoint.shard,
            seqno = checkpoint.seqno,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, indexer_id: &str, shard: ShardIdent) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE indexer_id = ? AND workchain = ? AND shard = ?")
            .bind(indexer_id)
            .bind(shard.workchain)
            .bind(shard_col(shard))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn checkpoint_from_row(r: &sqlx::sqlite::SqliteRow) -> Checkpoint {
    Checkpoint {
        indexer_id: r.get("indexer_id"),
        shard: shard_from_cols(r.get("workchain"), r.get("shard")),
        seqno: r.get::<i64, _>("seqno") as u32,
        root_hash: r.get("root_hash"),
        replay_from: r.get::<Option<i64>, _>("replay_from").map(|v| v as u32),
        updated_at: r.get("updated_at"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
