//! # strand-checkpoint - Durable Thread History
//!
//! **Trait-based checkpoint storage** for the strand workflow engine. A checkpoint is an
//! immutable snapshot of a thread's saved state; pending writes are task outputs recorded
//! before the checkpoint that will contain them is committed.
//!
//! ## Overview
//!
//! - **Threads** - Independent histories addressed by a caller-chosen `thread_id`
//! - **Checkpoints** - Immutable, ordered by a per-thread [`CheckpointId`] sequence
//! - **Pending writes** - Task results keyed by the checkpoint an invocation builds on,
//!   so a retried invocation can reuse them instead of re-running side effects
//! - **Forks** - Committing on top of an older checkpoint starts a branch that becomes
//!   the new latest
//!
//! ## Backends
//!
//! | Backend | Persistence | Use |
//! |---------|-------------|-----|
//! | [`InMemoryCheckpointSaver`] | Process lifetime | Tests, development |
//! | [`SqliteCheckpointSaver`] | Local file | Single-node deployments (feature `sqlite`) |
//!
//! Custom backends implement [`CheckpointSaver`]; the trait documentation spells out the
//! compare-and-swap and atomicity requirements.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strand_checkpoint::{
//!     Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver,
//! };
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let saver = InMemoryCheckpointSaver::new();
//!
//!     let checkpoint = Checkpoint::new("thread-1", CheckpointId::after(None), None, HashMap::new())
//!         .with_channel("__previous__", json!(["hi, i'm bob"]));
//!     saver.put(checkpoint, CheckpointMetadata::new().with_step(0)).await?;
//!
//!     let latest = saver.get_latest("thread-1").await?.expect("committed above");
//!     assert_eq!(latest.checkpoint.id, CheckpointId::new(1));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`checkpoint`] - Checkpoint, metadata, pending write and addressing types
//! - [`traits`] - The [`CheckpointSaver`] contract and [`ListOptions`]
//! - [`memory`] - In-memory backend
//! - `sqlite` - SQLite backend
//! - [`serializer`] - Blob encoding used by byte-oriented backends
//! - [`error`] - [`CheckpointError`]

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, PendingWrite, ROOT_NAMESPACE, TASK_RETURN_CHANNEL,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use serializer::{JsonSerializer, SerializerProtocol};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointSaver;
pub use traits::{CheckpointSaver, CheckpointStream, ListOptions};
