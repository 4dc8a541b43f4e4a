//! # strand-core - Durable, Resumable Workflows
//!
//! **Write a workflow as an ordinary async function and get persistence for free.** An
//! [`Entrypoint`] remembers what it returned on each conversation thread, hands that back
//! as `previous` on the next call, and records the output of every [`Task`] it submits so
//! that a retried invocation skips work that already succeeded.
//!
//! ## Overview
//!
//! - **Entrypoints** - Named workflow bodies bound to a checkpointer
//! - **Tasks** - Retryable units of work with deterministic ids (`name:n`)
//! - **Threads** - Independent histories selected by `thread_id` in the [`RunConfig`]
//! - **Streaming** - Values, updates, task lifecycle and custom events as they happen
//! - **Forks** - Re-run from any earlier checkpoint by passing its id
//!
//! ## Core Concepts
//!
//! ### 1. Invocation lifecycle
//!
//! Each invocation resolves the base checkpoint of its thread, runs the body and commits
//! a new checkpoint parented on that base. Two concurrent invocations on one thread
//! cannot both commit: the loser receives [`WorkflowError::Conflict`] (or is re-run when
//! `conflict_retries` allows it).
//!
//! ### 2. Task replay
//!
//! A task's successful output is written as a pending write against the base checkpoint
//! before its handle resolves. When the same invocation is re-run after a failure, the
//! recorded output is returned instead of calling the task function again. Failed
//! attempts are never recorded.
//!
//! ### 3. Streaming
//!
//! [`Entrypoint::stream`] runs the workflow in the background and yields
//! [`StreamChunk`]s in emission order. Dropping the stream does not cancel the run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strand_core::{task, Entrypoint, Final, RunConfig};
//! use strand_checkpoint::InMemoryCheckpointSaver;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> strand_core::Result<()> {
//!     let reply = task("reply", |messages| Box::pin(async move {
//!         let count = messages.as_array().map(|m| m.len()).unwrap_or(0);
//!         Ok(json!(format!("I have seen {count} messages")))
//!     }));
//!
//!     let chatbot = Entrypoint::new("chatbot", move |input, previous, runtime| {
//!         let reply = reply.clone();
//!         Box::pin(async move {
//!             let mut messages = previous.and_then(|p| p.as_array().cloned()).unwrap_or_default();
//!             messages.push(input);
//!             let answer = runtime.submit(&reply, Value::Array(messages.clone())).await?;
//!             messages.push(answer.clone());
//!             Ok(Final::new(answer).with_save(Value::Array(messages)))
//!         })
//!     })
//!     .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
//!
//!     let answer = chatbot.invoke(json!("hi! I'm bob"), RunConfig::for_thread("1")).await?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Engine-wide defaults live in [`EngineConfig`], loaded from TOML and overridden by
//! `STRAND_*` environment variables. Per-call options are given in a [`RunConfig`].
//!
//! ## Logging
//!
//! All crates log through `tracing`. Each invocation runs inside an `entrypoint` span
//! carrying the entrypoint name, run id and thread id; install any subscriber to see it.

pub mod config;
pub mod entrypoint;
pub mod error;
pub mod executor;
pub mod retry;
pub mod runtime;
pub mod stream;
pub mod task;

pub use config::{CheckpointerConfig, Durability, EngineConfig, RunConfig};
pub use entrypoint::{Entrypoint, EntrypointFn, EntrypointFuture, Final, DEFAULT_SAVE_CHANNEL};
pub use error::{Result, WorkflowError};
pub use executor::{TaskExecutor, TaskHandle};
pub use retry::RetryPolicy;
pub use runtime::Runtime;
pub use stream::{EventStream, StreamChunk, StreamEmitter, StreamEvent, StreamMode, StreamWriter};
pub use task::{task, Task, TaskFn, TaskFuture};

pub use strand_checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    CheckpointTuple, InMemoryCheckpointSaver, ListOptions,
};
