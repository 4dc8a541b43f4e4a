//! In-memory checkpoint storage for development and testing
//!
//! This module provides **[`InMemoryCheckpointSaver`]** - a reference implementation of the
//! [`CheckpointSaver`] trait that keeps every thread's history in a process-local map.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  InMemoryCheckpointSaver                                     │
//! │                                                               │
//! │  Arc<RwLock<HashMap<thread_id, ThreadHistory>>>              │
//! │                                                               │
//! │  ThreadHistory                                                │
//! │    checkpoints: BTreeMap<CheckpointId, CheckpointEntry>      │
//! │      ├─ #1  (parent: -)                                      │
//! │      ├─ #2  (parent: #1)                                     │
//! │      └─ #3  (parent: #1)   ← fork, latest                    │
//! │    writes: HashMap<CheckpointId, Vec<PendingWrite>>          │
//! │      └─ #3 → [ "summarize:0" ]                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `BTreeMap` keeps ids ordered, so "latest" is the last entry and `list` walks the
//! map in reverse. The write lock is held only for the duration of one insert, which is
//! the per-thread commit lock: the id check, the insert and the removal of the parent's
//! pending writes happen without interleaving.
//!
//! # Limitations
//!
//! 1. **No Persistence** - All data lost on restart
//! 2. **Single Process** - Cannot share across processes
//! 3. **Memory Bound** - Limited by available RAM
//!
//! Use [`SqliteCheckpointSaver`](crate::SqliteCheckpointSaver) when history must survive
//! a restart.

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple, PendingWrite},
    error::{CheckpointError, Result},
    traits::{check_writes_target, CheckpointSaver, CheckpointStream, ListOptions},
};
use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage entry for in-memory checkpoints
#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
}

impl CheckpointEntry {
    fn to_tuple(&self) -> CheckpointTuple {
        CheckpointTuple::new(self.checkpoint.clone(), self.metadata.clone())
    }
}

#[derive(Debug, Default)]
struct ThreadHistory {
    checkpoints: BTreeMap<CheckpointId, CheckpointEntry>,
    writes: HashMap<CheckpointId, Vec<PendingWrite>>,
}

impl ThreadHistory {
    fn knows(&self, checkpoint_id: CheckpointId) -> bool {
        checkpoint_id.is_root() || self.checkpoints.contains_key(&checkpoint_id)
    }
}

/// Thread-safe in-memory checkpoint storage
type CheckpointStorage = Arc<RwLock<HashMap<String, ThreadHistory>>>;

/// In-memory checkpoint saver implementation
///
/// Cloning shares the underlying storage, so a clone handed to an orchestrator and the
/// original held by a test observe the same history.
///
/// # Example
///
/// ```rust
/// use strand_checkpoint::{InMemoryCheckpointSaver, CheckpointSaver};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let saver = InMemoryCheckpointSaver::new();
///     assert!(saver.get_latest("thread-1").await?.is_none());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointSaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the number of threads with at least one checkpoint or pending write
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|history| history.checkpoints.len())
            .sum()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

impl Default for InMemoryCheckpointSaver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(thread_id)
            .and_then(|history| history.checkpoints.values().next_back())
            .map(CheckpointEntry::to_tuple))
    }

    async fn get(&self, thread_id: &str, checkpoint_id: CheckpointId) -> Result<CheckpointTuple> {
        let storage = self.storage.read().await;
        storage
            .get(thread_id)
            .and_then(|history| history.checkpoints.get(&checkpoint_id))
            .map(CheckpointEntry::to_tuple)
            .ok_or_else(|| CheckpointError::not_found(thread_id, checkpoint_id))
    }

    async fn put(
        &self,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        checkpoint.validate()?;

        let mut storage = self.storage.write().await;
        let history = storage.entry(checkpoint.thread_id.clone()).or_default();

        if let Some(existing) = history.checkpoints.get(&checkpoint.id) {
            if existing.checkpoint.same_commit(&checkpoint)
                && existing.metadata.run_id == metadata.run_id
            {
                return Ok(CheckpointTuple::new(checkpoint, metadata).config);
            }
            return Err(CheckpointError::Conflict {
                thread_id: checkpoint.thread_id.clone(),
                checkpoint_id: checkpoint.id,
            });
        }

        if let Some(parent) = checkpoint.parent_id {
            if !history.checkpoints.contains_key(&parent) {
                let err = CheckpointError::not_found(&checkpoint.thread_id, parent);
                if history.checkpoints.is_empty() && history.writes.is_empty() {
                    storage.remove(&checkpoint.thread_id);
                }
                return Err(err);
            }
        }

        history.writes.remove(&checkpoint.parent_or_root());
        let config = CheckpointTuple::new(checkpoint.clone(), metadata.clone()).config;
        history
            .checkpoints
            .insert(checkpoint.id, CheckpointEntry { checkpoint, metadata });

        Ok(config)
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: CheckpointId,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        check_writes_target(thread_id, checkpoint_id, &writes)?;

        let mut storage = self.storage.write().await;
        let known = match storage.get(thread_id) {
            Some(history) => history.knows(checkpoint_id),
            None => checkpoint_id.is_root(),
        };
        if !known {
            return Err(CheckpointError::not_found(thread_id, checkpoint_id));
        }

        let pending = storage
            .entry(thread_id.to_string())
            .or_default()
            .writes
            .entry(checkpoint_id)
            .or_default();

        for write in writes {
            match pending
                .iter_mut()
                .find(|w| w.task_id == write.task_id && w.channel == write.channel)
            {
                Some(slot) => *slot = write,
                None => pending.push(write),
            }
        }

        Ok(())
    }

    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: CheckpointId,
    ) -> Result<Vec<PendingWrite>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(thread_id)
            .and_then(|history| history.writes.get(&checkpoint_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list(&self, thread_id: &str, options: ListOptions) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;
        let limit = options.limit.unwrap_or(usize::MAX);

        let results: Vec<Result<CheckpointTuple>> = storage
            .get(thread_id)
            .map(|history| {
                history
                    .checkpoints
                    .values()
                    .rev()
                    .filter(|entry| options.admits(entry.checkpoint.id, &entry.metadata))
                    .take(limit)
                    .map(|entry| Ok(entry.to_tuple()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::pin(stream::iter(results)))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.remove(thread_id);
        Ok(())
    }
}
