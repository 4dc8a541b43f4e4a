//! Runtime context handed to a workflow body

use crate::config::RunConfig;
use crate::executor::{TaskExecutor, TaskHandle};
use crate::stream::StreamWriter;
use crate::task::Task;
use serde_json::Value;
use std::sync::Arc;
use strand_checkpoint::CheckpointId;
use uuid::Uuid;

/// Per-invocation context available inside an entrypoint body
///
/// This provides access to:
/// - The task executor (submit tasks, await their handles)
/// - A stream writer for custom events
/// - The effective run configuration and identifiers of this invocation
#[derive(Clone)]
pub struct Runtime {
    executor: TaskExecutor,
    writer: StreamWriter,
    config: Arc<RunConfig>,
    run_id: Uuid,
    base_checkpoint: Option<CheckpointId>,
}

impl Runtime {
    pub(crate) fn new(
        executor: TaskExecutor,
        writer: StreamWriter,
        config: Arc<RunConfig>,
        run_id: Uuid,
        base_checkpoint: Option<CheckpointId>,
    ) -> Self {
        Self {
            executor,
            writer,
            config,
            run_id,
            base_checkpoint,
        }
    }

    /// A detached runtime: tasks run but nothing is recorded or streamed
    pub fn detached() -> Self {
        Self::new(
            TaskExecutor::new(),
            StreamWriter::noop(),
            Arc::new(RunConfig::default()),
            Uuid::new_v4(),
            None,
        )
    }

    /// Submit a task under its deterministic id
    pub fn submit(&self, task: &Task, input: Value) -> TaskHandle {
        self.executor.submit(task, input)
    }

    /// Submit a task under an explicit id
    pub fn submit_with_id(&self, task_id: impl Into<String>, task: &Task, input: Value) -> TaskHandle {
        self.executor.submit_with_id(task_id, task, input)
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.config.thread_id.as_deref()
    }

    /// Value of a `configurable` entry
    pub fn configurable(&self, key: &str) -> Option<&Value> {
        self.config.configurable.get(key)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Checkpoint this invocation builds on, `None` for a fresh thread or a detached run
    pub fn base_checkpoint(&self) -> Option<CheckpointId> {
        self.base_checkpoint
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("run_id", &self.run_id)
            .field("thread_id", &self.thread_id())
            .field("base_checkpoint", &self.base_checkpoint)
            .field("executor", &self.executor)
            .finish()
    }
}
