//! Extensible checkpoint storage trait for custom backend implementations
//!
//! This module defines the **[`CheckpointSaver`]** trait - the abstraction every storage
//! medium (memory, local database, networked service) implements so the orchestrator can
//! persist and resume thread state without knowing where it lives.
//!
//! # Contract
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | `get_latest` | Greatest checkpoint id of a thread, `None` for an empty thread |
//! | `get` | Exact checkpoint, `NotFound` otherwise |
//! | `put` | Insert-if-absent; identical retry is a no-op, different content is a `Conflict` |
//! | `put_writes` | Record task outputs against the checkpoint an invocation builds on |
//! | `get_writes` | Read the pending writes recorded against a checkpoint |
//! | `list` | Newest first, finite, every call returns a fresh stream |
//!
//! # Concurrency
//!
//! At most one writer may commit on a thread at a time and readers are never blocked by a
//! running workflow. Single-process backends satisfy this with a short critical section
//! around the insert; networked backends must provide an insert-if-absent on
//! `(thread_id, checkpoint_id)` so that two invocations computing the same next id can
//! never both succeed.
//!
//! # Atomicity
//!
//! `put` must insert the checkpoint and drop the pending writes of its parent (or of
//! [`CheckpointId::ROOT`] for a first commit) as one step. A failed `put` leaves the store
//! exactly as it was.
//!
//! # Example: Custom Backend Skeleton
//!
//! ```rust,ignore
//! use strand_checkpoint::*;
//! use async_trait::async_trait;
//!
//! struct RedisCheckpointSaver { client: redis::Client }
//!
//! #[async_trait]
//! impl CheckpointSaver for RedisCheckpointSaver {
//!     async fn put(&self, checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Result<CheckpointConfig> {
//!         // SET NX on "{thread}:{id}" is the compare-and-swap
//!         todo!()
//!     }
//!     // ...
//! }
//! ```

use crate::{
    checkpoint::{
        Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Type alias for async stream of checkpoint tuples
pub type CheckpointStream =
    Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Query options for [`CheckpointSaver::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only checkpoints with an id strictly lower than this cursor
    pub before: Option<CheckpointId>,

    /// Maximum number of results
    pub limit: Option<usize>,

    /// Exact-match filter on metadata `extra` fields
    pub filter: Option<HashMap<String, serde_json::Value>>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, checkpoint_id: CheckpointId) -> Self {
        self.before = Some(checkpoint_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filter
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Whether a checkpoint passes the cursor and metadata filter.
    pub fn admits(&self, checkpoint_id: CheckpointId, metadata: &CheckpointMetadata) -> bool {
        if let Some(before) = self.before {
            if checkpoint_id >= before {
                return false;
            }
        }
        match &self.filter {
            Some(filter) => metadata.matches(filter),
            None => true,
        }
    }
}

/// Core trait for implementing checkpoint storage backends
///
/// Implementations must be thread-safe (`Send + Sync`); the orchestrator holds them as
/// `Arc<dyn CheckpointSaver>` and calls them from many concurrent invocations.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Latest checkpoint of a thread, `None` if the thread has no history.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>>;

    /// A specific checkpoint; fails with [`CheckpointError::NotFound`] when it does not exist.
    async fn get(&self, thread_id: &str, checkpoint_id: CheckpointId) -> Result<CheckpointTuple>;

    /// Retrieve a checkpoint addressed by a config.
    ///
    /// - If `checkpoint_id` is set: that checkpoint, `None` when it does not exist
    /// - Otherwise: the latest checkpoint of the thread
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = config.require_thread_id()?;
        match config.checkpoint_id {
            Some(checkpoint_id) => match self.get(thread_id, checkpoint_id).await {
                Ok(tuple) => Ok(Some(tuple)),
                Err(CheckpointError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => self.get_latest(thread_id).await,
        }
    }

    /// Commit a checkpoint.
    ///
    /// Your implementation MUST:
    /// 1. Reject structurally invalid checkpoints ([`Checkpoint::validate`])
    /// 2. Fail with `NotFound` when the parent is not a checkpoint of the same thread
    /// 3. Treat re-putting the same commit (same content, same `run_id`) as a successful no-op
    /// 4. Fail with `Conflict` when a different checkpoint already holds the id
    /// 5. Drop the pending writes of the parent in the same atomic step
    ///
    /// Returns the config addressing the stored checkpoint.
    async fn put(
        &self,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Record task outputs against the checkpoint an invocation is building on.
    ///
    /// `checkpoint_id` must be an existing checkpoint of the thread or
    /// [`CheckpointId::ROOT`]. Re-recording a `(task_id, channel)` replaces the earlier
    /// value.
    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: CheckpointId,
        writes: Vec<PendingWrite>,
    ) -> Result<()>;

    /// Pending writes recorded against a checkpoint, in recording order.
    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: CheckpointId,
    ) -> Result<Vec<PendingWrite>>;

    /// Stream a thread's checkpoints, newest first.
    async fn list(&self, thread_id: &str, options: ListOptions) -> Result<CheckpointStream>;

    /// Delete all checkpoints and pending writes of a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

/// Check that every write targets `(thread_id, checkpoint_id)`.
pub(crate) fn check_writes_target(
    thread_id: &str,
    checkpoint_id: CheckpointId,
    writes: &[PendingWrite],
) -> Result<()> {
    match writes
        .iter()
        .find(|w| w.thread_id != thread_id || w.checkpoint_id != checkpoint_id)
    {
        Some(stray) => Err(CheckpointError::Invalid(format!(
            "write for task '{}' targets {}:{} instead of {}:{}",
            stray.task_id, stray.thread_id, stray.checkpoint_id, thread_id, checkpoint_id
        ))),
        None => Ok(()),
    }
}
