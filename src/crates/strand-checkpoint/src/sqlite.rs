//! SQLite checkpoint storage
//!
//! [`SqliteCheckpointSaver`] persists thread histories in a local SQLite database through
//! an `sqlx` connection pool, so conversations survive a process restart.
//!
//! # Schema
//!
//! ```text
//! checkpoints(thread_id, checkpoint_id, parent_id, ts, channel_values, metadata)
//!     PRIMARY KEY (thread_id, checkpoint_id)
//! writes(thread_id, checkpoint_id, task_id, channel, value)
//!     PRIMARY KEY (thread_id, checkpoint_id, task_id, channel)
//! ```
//!
//! `channel_values`, `metadata` and write values are blobs produced by the configured
//! [`SerializerProtocol`] (JSON by default).
//!
//! # Concurrency
//!
//! The primary key is the compare-and-swap: `put` inserts with `ON CONFLICT DO NOTHING`
//! as the first statement of its transaction, so the write lock is taken before anything
//! is read and two invocations racing for the same id serialize on it. File databases
//! run in WAL mode, which keeps readers unblocked while a commit is in flight.

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple, PendingWrite},
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{check_writes_target, CheckpointSaver, CheckpointStream, ListOptions},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Rows fetched per round trip while streaming `list` results
const LIST_PAGE_SIZE: i64 = 64;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoints (
        thread_id TEXT NOT NULL,
        checkpoint_id INTEGER NOT NULL,
        parent_id INTEGER,
        ts TEXT NOT NULL,
        channel_values BLOB NOT NULL,
        metadata BLOB NOT NULL,
        PRIMARY KEY (thread_id, checkpoint_id)
    )",
    "CREATE TABLE IF NOT EXISTS writes (
        thread_id TEXT NOT NULL,
        checkpoint_id INTEGER NOT NULL,
        task_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (thread_id, checkpoint_id, task_id, channel)
    )",
];

const SELECT_CHECKPOINT: &str = "SELECT thread_id, checkpoint_id, parent_id, ts, channel_values, metadata
     FROM checkpoints";

/// SQLite-backed checkpoint saver
#[derive(Debug, Clone)]
pub struct SqliteCheckpointSaver<S = JsonSerializer> {
    pool: SqlitePool,
    serializer: S,
}

impl SqliteCheckpointSaver<JsonSerializer> {
    /// Open (or create) a database file
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Checkpoint database opened");
        Self::with_serializer(pool, JsonSerializer::new()).await
    }

    /// Connect using a `sqlite:` URL
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        debug!(url = %url, "Checkpoint database connected");
        Self::with_serializer(pool, JsonSerializer::new()).await
    }

    /// A private in-memory database.
    ///
    /// The pool is pinned to a single connection that never expires, because every SQLite
    /// connection to `:memory:` sees its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_serializer(pool, JsonSerializer::new()).await
    }
}

impl<S: SerializerProtocol> SqliteCheckpointSaver<S> {
    /// Wrap an existing pool, creating the schema if needed
    pub async fn with_serializer(pool: SqlitePool, serializer: S) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, serializer })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_tuple(&self, row: &SqliteRow) -> Result<CheckpointTuple> {
        let ts: String = row.try_get("ts")?;
        let ts = DateTime::parse_from_rfc3339(&ts)
            .map_err(|e| CheckpointError::Storage(format!("corrupt timestamp {ts:?}: {e}")))?
            .with_timezone(&Utc);
        let channel_values: Vec<u8> = row.try_get("channel_values")?;
        let metadata: Vec<u8> = row.try_get("metadata")?;

        let checkpoint = Checkpoint {
            v: Checkpoint::CURRENT_VERSION,
            thread_id: row.try_get("thread_id")?,
            id: from_sql_id(row.try_get("checkpoint_id")?)?,
            parent_id: row
                .try_get::<Option<i64>, _>("parent_id")?
                .map(from_sql_id)
                .transpose()?,
            ts,
            channel_values: self.serializer.loads(&channel_values)?,
        };
        let metadata: CheckpointMetadata = self.serializer.loads(&metadata)?;
        Ok(CheckpointTuple::new(checkpoint, metadata))
    }

    async fn fetch_page(
        &self,
        thread_id: &str,
        before: Option<CheckpointId>,
    ) -> Result<Vec<CheckpointTuple>> {
        let before = before.map(to_sql_id).transpose()?;
        let rows = sqlx::query(&format!(
            "{SELECT_CHECKPOINT}
             WHERE thread_id = ? AND (? IS NULL OR checkpoint_id < ?)
             ORDER BY checkpoint_id DESC
             LIMIT ?"
        ))
        .bind(thread_id)
        .bind(before)
        .bind(before)
        .bind(LIST_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.decode_tuple(row)).collect()
    }
}

fn to_sql_id(id: CheckpointId) -> Result<i64> {
    i64::try_from(id.sequence())
        .map_err(|_| CheckpointError::Invalid(format!("checkpoint id {id} out of range")))
}

fn from_sql_id(raw: i64) -> Result<CheckpointId> {
    u64::try_from(raw)
        .map(CheckpointId::new)
        .map_err(|_| CheckpointError::Storage(format!("negative checkpoint id {raw}")))
}

struct ListCursor {
    before: Option<CheckpointId>,
    remaining: usize,
    exhausted: bool,
    buffer: VecDeque<CheckpointTuple>,
}

#[async_trait]
impl<S> CheckpointSaver for SqliteCheckpointSaver<S>
where
    S: SerializerProtocol + Clone + 'static,
{
    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>> {
        let row = sqlx::query(&format!(
            "{SELECT_CHECKPOINT} WHERE thread_id = ? ORDER BY checkpoint_id DESC LIMIT 1"
        ))
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.decode_tuple(&row)).transpose()
    }

    async fn get(&self, thread_id: &str, checkpoint_id: CheckpointId) -> Result<CheckpointTuple> {
        let row = sqlx::query(&format!(
            "{SELECT_CHECKPOINT} WHERE thread_id = ? AND checkpoint_id = ?"
        ))
        .bind(thread_id)
        .bind(to_sql_id(checkpoint_id)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.decode_tuple(&row),
            None => Err(CheckpointError::not_found(thread_id, checkpoint_id)),
        }
    }

    async fn put(
        &self,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        checkpoint.validate()?;
        let thread_id = checkpoint.thread_id.as_str();
        let id = to_sql_id(checkpoint.id)?;
        let parent = checkpoint.parent_id.map(to_sql_id).transpose()?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO checkpoints (thread_id, checkpoint_id, parent_id, ts, channel_values, metadata)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (thread_id, checkpoint_id) DO NOTHING",
        )
        .bind(thread_id)
        .bind(id)
        .bind(parent)
        .bind(checkpoint.ts.to_rfc3339())
        .bind(self.serializer.dumps(&checkpoint.channel_values)?)
        .bind(self.serializer.dumps(&metadata)?)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let row = sqlx::query(&format!(
                "{SELECT_CHECKPOINT} WHERE thread_id = ? AND checkpoint_id = ?"
            ))
            .bind(thread_id)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            let existing = self.decode_tuple(&row)?;
            tx.rollback().await?;

            if existing.checkpoint.same_commit(&checkpoint)
                && existing.metadata.run_id == metadata.run_id
            {
                debug!(thread_id, checkpoint_id = %checkpoint.id, "Checkpoint already committed");
                return Ok(existing.config);
            }
            return Err(CheckpointError::Conflict {
                thread_id: thread_id.to_string(),
                checkpoint_id: checkpoint.id,
            });
        }

        if let Some(parent) = parent {
            let found = sqlx::query("SELECT 1 FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?")
                .bind(thread_id)
                .bind(parent)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            if !found {
                tx.rollback().await?;
                return Err(CheckpointError::not_found(thread_id, from_sql_id(parent)?));
            }
        }

        sqlx::query("DELETE FROM writes WHERE thread_id = ? AND checkpoint_id = ?")
            .bind(thread_id)
            .bind(to_sql_id(checkpoint.parent_or_root())?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(CheckpointTuple::new(checkpoint, metadata).config)
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: CheckpointId,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        check_writes_target(thread_id, checkpoint_id, &writes)?;
        let id = to_sql_id(checkpoint_id)?;

        let mut tx = self.pool.begin().await?;

        for write in &writes {
            sqlx::query(
                "INSERT INTO writes (thread_id, checkpoint_id, task_id, channel, value)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (thread_id, checkpoint_id, task_id, channel)
                 DO UPDATE SET value = excluded.value",
            )
            .bind(thread_id)
            .bind(id)
            .bind(&write.task_id)
            .bind(&write.channel)
            .bind(self.serializer.dumps(&write.value)?)
            .execute(&mut *tx)
            .await?;
        }

        if !checkpoint_id.is_root() {
            let found = sqlx::query("SELECT 1 FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?")
                .bind(thread_id)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            if !found {
                tx.rollback().await?;
                return Err(CheckpointError::not_found(thread_id, checkpoint_id));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: CheckpointId,
    ) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            "SELECT task_id, channel, value FROM writes
             WHERE thread_id = ? AND checkpoint_id = ?
             ORDER BY rowid",
        )
        .bind(thread_id)
        .bind(to_sql_id(checkpoint_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let value: Vec<u8> = row.try_get("value")?;
                Ok(PendingWrite::new(
                    thread_id,
                    checkpoint_id,
                    row.try_get::<String, _>("task_id")?,
                    row.try_get::<String, _>("channel")?,
                    self.serializer.loads(&value)?,
                ))
            })
            .collect()
    }

    async fn list(&self, thread_id: &str, options: ListOptions) -> Result<CheckpointStream> {
        let saver = self.clone();
        let thread_id = thread_id.to_string();
        let cursor = ListCursor {
            before: options.before,
            remaining: options.limit.unwrap_or(usize::MAX),
            exhausted: false,
            buffer: VecDeque::new(),
        };

        let pages = stream::try_unfold(cursor, move |mut cursor| {
            let saver = saver.clone();
            let thread_id = thread_id.clone();
            let options = options.clone();
            async move {
                loop {
                    if cursor.remaining == 0 {
                        return Ok(None);
                    }
                    if let Some(tuple) = cursor.buffer.pop_front() {
                        cursor.remaining -= 1;
                        return Ok(Some((tuple, cursor)));
                    }
                    if cursor.exhausted {
                        return Ok(None);
                    }

                    let page = saver.fetch_page(&thread_id, cursor.before).await?;
                    cursor.exhausted = (page.len() as i64) < LIST_PAGE_SIZE;
                    if let Some(last) = page.last() {
                        cursor.before = Some(last.checkpoint.id);
                    }
                    cursor.buffer.extend(
                        page.into_iter()
                            .filter(|t| options.admits(t.checkpoint.id, &t.metadata)),
                    );
                }
            }
        });

        Ok(Box::pin(pages))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

impl<S> SqliteCheckpointSaver<S> {
    /// Number of checkpoints stored per thread
    pub async fn thread_sizes(&self) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query("SELECT thread_id, COUNT(*) AS n FROM checkpoints GROUP BY thread_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let n: i64 = row.try_get("n")?;
                Ok((row.try_get::<String, _>("thread_id")?, n.max(0) as u64))
            })
            .collect()
    }
}
