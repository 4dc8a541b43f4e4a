//! Entrypoint orchestrator: resolve previous state, run the body, commit
//!
//! An [`Entrypoint`] wraps a workflow body and binds it to a checkpointer. Each invocation
//! on a thread goes through:
//!
//! ```text
//! Pending → ResolvingPrevious → Running → Committing → Committed
//!                                   │          │
//!                                   └→ Failed  └→ Conflict
//! ```
//!
//! 1. **ResolvingPrevious** - load the base checkpoint (the requested `checkpoint_id` or
//!    the latest), read its save channel as `previous`, load the pending writes recorded
//!    against it for replay, and compute the id of the checkpoint to commit
//! 2. **Running** - call the body with `(input, previous, runtime)`
//! 3. **Committing** - insert the new checkpoint parented on the base; the store rejects
//!    it with a conflict if another invocation committed the same id first
//!
//! A failed body commits nothing; task outputs recorded along the way stay pending so the
//! next attempt replays them.
//!
//! Without a checkpointer or a `thread_id` the body runs with `previous = None` and
//! nothing is persisted.
//!
//! # Example
//!
//! ```rust,no_run
//! use strand_core::{Entrypoint, Final, RunConfig};
//! use strand_checkpoint::InMemoryCheckpointSaver;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> strand_core::Result<()> {
//! let counter = Entrypoint::new("counter", |input, previous, _runtime| {
//!     Box::pin(async move {
//!         let total = previous.and_then(|p| p.as_i64()).unwrap_or(0) + input.as_i64().unwrap_or(0);
//!         Ok(Final::from(json!(total)))
//!     })
//! })
//! .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
//!
//! counter.invoke(json!(2), RunConfig::for_thread("1")).await?;
//! let total = counter.invoke(json!(3), RunConfig::for_thread("1")).await?;
//! assert_eq!(total, json!(5));
//! # Ok(())
//! # }
//! ```

use crate::config::{Durability, EngineConfig, RunConfig};
use crate::error::{Result, WorkflowError};
use crate::executor::TaskExecutor;
use crate::runtime::Runtime;
use crate::stream::{EventStream, StreamEmitter, StreamEvent, StreamMode, StreamWriter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use strand_checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    CheckpointStream, CheckpointTuple, ListOptions,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Channel holding the value handed to the next invocation as `previous`
pub const DEFAULT_SAVE_CHANNEL: &str = "__previous__";

/// Boxed future returned by entrypoint bodies
pub type EntrypointFuture = Pin<Box<dyn Future<Output = Result<Final>> + Send>>;

/// Type alias for entrypoint bodies: `(input, previous, runtime)`
pub type EntrypointFn = Arc<dyn Fn(Value, Option<Value>, Runtime) -> EntrypointFuture + Send + Sync>;

/// Result of a workflow body
///
/// `value` is returned to the caller; `save` (defaulting to `value`) becomes `previous`
/// for the next invocation on the thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Final {
    pub value: Value,
    pub save: Option<Value>,
}

impl Final {
    pub fn new(value: Value) -> Self {
        Self { value, save: None }
    }

    /// Persist `save` instead of the return value
    pub fn with_save(mut self, save: Value) -> Self {
        self.save = Some(save);
        self
    }

    pub fn save_value(&self) -> &Value {
        self.save.as_ref().unwrap_or(&self.value)
    }
}

impl From<Value> for Final {
    fn from(value: Value) -> Self {
        Final::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Pending,
    ResolvingPrevious,
    Running,
    Committing,
    Committed,
    Failed,
    Conflict,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::ResolvingPrevious => "resolving_previous",
            RunState::Running => "running",
            RunState::Committing => "committing",
            RunState::Committed => "committed",
            RunState::Failed => "failed",
            RunState::Conflict => "conflict",
        };
        f.write_str(name)
    }
}

struct RunTracker {
    state: RunState,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            state: RunState::Pending,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state transition");
        self.state = next;
    }

    fn fail(&mut self, err: &WorkflowError) {
        if err.is_conflict() {
            self.transition(RunState::Conflict);
        } else {
            self.transition(RunState::Failed);
        }
    }
}

/// A named, checkpointed workflow
#[derive(Clone)]
pub struct Entrypoint {
    name: String,
    body: EntrypointFn,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    save_channel: String,
    config: EngineConfig,
}

impl Entrypoint {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Value, Option<Value>, Runtime) -> EntrypointFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
            checkpointer: None,
            save_channel: DEFAULT_SAVE_CHANNEL.to_string(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_save_channel(mut self, channel: impl Into<String>) -> Self {
        self.save_channel = channel.into();
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn save_channel(&self) -> &str {
        &self.save_channel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.checkpointer.as_ref()
    }

    /// Run the workflow to completion and return its value
    pub async fn invoke(&self, input: Value, config: RunConfig) -> Result<Value> {
        let config = config.ensure(&self.config)?;
        self.execute(input, config, None).await
    }

    /// Run the workflow in the background and stream its progress
    ///
    /// Configuration errors are returned immediately; failures of the run itself are
    /// delivered as a terminal [`StreamEvent::Error`] chunk.
    pub async fn stream(
        &self,
        input: Value,
        config: RunConfig,
        modes: impl IntoIterator<Item = StreamMode>,
    ) -> Result<EventStream> {
        let config = config.ensure(&self.config)?;
        let namespace = config.checkpoint_ns.clone().unwrap_or_default();
        let (emitter, mut rx) = StreamEmitter::channel(modes, namespace, self.config.stream_buffer);

        let entrypoint = self.clone();
        tokio::spawn(async move {
            if let Err(e) = entrypoint.execute(input, config, Some(emitter.clone())).await {
                error!(entrypoint = %entrypoint.name, error = %e, "Streaming run failed");
                emitter.failed(&e.to_string()).await;
            }
        });

        let name = self.name.clone();
        let events = async_stream::stream! {
            while let Some(chunk) = rx.recv().await {
                yield chunk;
            }
            debug!(entrypoint = %name, "Event stream drained");
        };

        Ok(Box::pin(events))
    }

    /// Latest checkpoint of the configured thread, or the one named by `checkpoint_id`
    pub async fn get_state(&self, config: &RunConfig) -> Result<Option<CheckpointTuple>> {
        let (saver, _) = self.require_thread(config)?;
        Ok(saver.get_tuple(&config.checkpoint_config()).await?)
    }

    /// Checkpoints of the configured thread, newest first
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        options: ListOptions,
    ) -> Result<CheckpointStream> {
        let (saver, thread_id) = self.require_thread(config)?;
        Ok(saver.list(thread_id, options).await?)
    }

    fn require_thread<'a>(
        &'a self,
        config: &'a RunConfig,
    ) -> Result<(&'a Arc<dyn CheckpointSaver>, &'a str)> {
        let saver = self.checkpointer.as_ref().ok_or_else(|| {
            WorkflowError::Configuration(format!("entrypoint '{}' has no checkpointer", self.name))
        })?;
        let thread_id = config
            .thread_id
            .as_deref()
            .ok_or_else(|| WorkflowError::Configuration("thread_id is required".to_string()))?;
        Ok((saver, thread_id))
    }

    async fn execute(
        &self,
        input: Value,
        config: RunConfig,
        emitter: Option<StreamEmitter>,
    ) -> Result<Value> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "entrypoint",
            entrypoint = %self.name,
            run_id = %run_id,
            thread_id = config.thread_id.as_deref().unwrap_or(""),
        );

        async move {
            let config = Arc::new(config);
            match (&self.checkpointer, config.thread_id.clone()) {
                (Some(saver), Some(thread_id)) => {
                    self.run_durable(saver.clone(), thread_id, input, config, run_id, emitter)
                        .await
                }
                _ => self.run_ephemeral(input, config, run_id, emitter).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_ephemeral(
        &self,
        input: Value,
        config: Arc<RunConfig>,
        run_id: Uuid,
        emitter: Option<StreamEmitter>,
    ) -> Result<Value> {
        let mut run = RunTracker::new();
        let mut executor = TaskExecutor::new().with_max_concurrency(config.max_concurrency);
        if let Some(emitter) = &emitter {
            executor = executor.with_emitter(emitter.clone());
        }
        let runtime = Runtime::new(
            executor.clone(),
            StreamWriter::new(emitter.clone()),
            config.clone(),
            run_id,
            None,
        );

        run.transition(RunState::Running);
        match self.run_body(input, None, runtime, &executor, config.timeout).await {
            Ok(fin) => {
                debug!("Run finished without persistence");
                if let Some(emitter) = &emitter {
                    emitter.finished(&self.name, &fin.value).await;
                }
                Ok(fin.value)
            }
            Err(e) => {
                run.fail(&e);
                Err(e)
            }
        }
    }

    async fn run_durable(
        &self,
        saver: Arc<dyn CheckpointSaver>,
        thread_id: String,
        input: Value,
        config: Arc<RunConfig>,
        run_id: Uuid,
        emitter: Option<StreamEmitter>,
    ) -> Result<Value> {
        // A fork targets one specific base; re-running it against a newer head would
        // silently change what it forks from.
        let retries = if config.checkpoint_id.is_some() {
            0
        } else {
            config.conflict_retries()
        };
        let mut attempt = 0;

        loop {
            let mut run = RunTracker::new();
            let outcome = self
                .attempt_durable(
                    &mut run,
                    &saver,
                    &thread_id,
                    input.clone(),
                    &config,
                    run_id,
                    emitter.as_ref(),
                )
                .await;

            match outcome {
                Err(err) => {
                    run.fail(&err);
                    if err.is_conflict() && attempt < retries {
                        attempt += 1;
                        warn!(
                            attempt = attempt,
                            max_retries = retries,
                            error = %err,
                            "Commit conflict, re-running against the refreshed latest checkpoint"
                        );
                        continue;
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_durable(
        &self,
        run: &mut RunTracker,
        saver: &Arc<dyn CheckpointSaver>,
        thread_id: &str,
        input: Value,
        config: &Arc<RunConfig>,
        run_id: Uuid,
        emitter: Option<&StreamEmitter>,
    ) -> Result<Value> {
        run.transition(RunState::ResolvingPrevious);
        let latest = saver.get_latest(thread_id).await?;
        let base = match config.checkpoint_id {
            Some(id) if latest.as_ref().map(|t| t.checkpoint.id) == Some(id) => latest.clone(),
            Some(id) => Some(saver.get(thread_id, id).await?),
            None => latest.clone(),
        };

        let base_id = base.as_ref().map(|t| t.checkpoint.id);
        let write_key = base_id.unwrap_or(CheckpointId::ROOT);
        let previous = base
            .as_ref()
            .and_then(|t| t.checkpoint.channel(&self.save_channel).cloned());
        let replay = saver.get_writes(thread_id, write_key).await?;
        let next_id = CheckpointId::after(latest.as_ref().map(|t| t.checkpoint.id));
        debug!(
            base = ?base_id,
            next = %next_id,
            replayable = replay.len(),
            "Resolved previous state"
        );

        let mut executor = TaskExecutor::new()
            .with_checkpointer(saver.clone(), thread_id, write_key)
            .with_replay(replay)
            .with_durability(config.durability())
            .with_max_concurrency(config.max_concurrency);
        if let Some(emitter) = emitter {
            executor = executor.with_emitter(emitter.clone());
        }
        let runtime = Runtime::new(
            executor.clone(),
            StreamWriter::new(emitter.cloned()),
            config.clone(),
            run_id,
            base_id,
        );

        run.transition(RunState::Running);
        let fin = match self.run_body(input, previous, runtime, &executor, config.timeout).await {
            Ok(fin) => fin,
            Err(err) => {
                self.flush_on_failure(&executor, config).await;
                return Err(err);
            }
        };

        // The commit consumes the writes pending on the base; a task still running would
        // record its output there afterwards, where no later commit can pick it up.
        let abandoned = executor.abort_outstanding();
        if abandoned > 0 {
            warn!(tasks = abandoned, "Aborted tasks the workflow body did not await");
        }

        run.transition(RunState::Committing);
        let checkpoint = Checkpoint::new(thread_id, next_id, base_id, HashMap::new())
            .with_channel(self.save_channel.clone(), fin.save_value().clone())
            .with_channel(self.name.clone(), fin.value.clone());
        let metadata = commit_metadata(config, base.as_ref(), latest.as_ref(), run_id);

        if let Err(e) = saver.put(checkpoint.clone(), metadata).await {
            let err = WorkflowError::from(e);
            // After a conflict the base belongs to the winner's commit and its writes are gone.
            if !err.is_conflict() {
                self.flush_on_failure(&executor, config).await;
            }
            return Err(err);
        }
        run.transition(RunState::Committed);
        info!(checkpoint_id = %next_id, parent = ?base_id, "Checkpoint committed");

        if let Some(emitter) = emitter {
            emitter.finished(&self.name, &fin.value).await;
            if emitter.has_mode(StreamMode::Checkpoints) {
                emitter
                    .emit(
                        StreamMode::Checkpoints,
                        StreamEvent::Checkpoint {
                            thread_id: thread_id.to_string(),
                            namespace: config.checkpoint_ns.clone().unwrap_or_default(),
                            checkpoint: serde_json::to_value(&checkpoint)?,
                        },
                    )
                    .await;
            }
        }

        Ok(fin.value)
    }

    async fn run_body(
        &self,
        input: Value,
        previous: Option<Value>,
        runtime: Runtime,
        executor: &TaskExecutor,
        timeout: Option<Duration>,
    ) -> Result<Final> {
        let body = (self.body)(input, previous, runtime);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(result) => result,
                Err(_) => {
                    let aborted = executor.abort_outstanding();
                    warn!(
                        timeout_ms = limit.as_millis() as u64,
                        aborted = aborted,
                        "Workflow deadline expired"
                    );
                    Err(WorkflowError::Timeout(limit))
                }
            },
            None => body.await,
        }
    }

    async fn flush_on_failure(&self, executor: &TaskExecutor, config: &RunConfig) {
        if config.durability() != Durability::Exit {
            return;
        }
        match executor.flush().await {
            Ok(0) => {}
            Ok(count) => debug!(writes = count, "Recorded buffered task outputs of failed run"),
            Err(e) => warn!(error = %e, "Failed to record buffered task outputs"),
        }
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entrypoint")
            .field("name", &self.name)
            .field("save_channel", &self.save_channel)
            .field("has_checkpointer", &self.checkpointer.is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn commit_metadata(
    config: &RunConfig,
    base: Option<&CheckpointTuple>,
    latest: Option<&CheckpointTuple>,
    run_id: Uuid,
) -> CheckpointMetadata {
    let source = match base {
        None => CheckpointSource::Input,
        Some(b) if latest.map(|l| l.checkpoint.id) != Some(b.checkpoint.id) => CheckpointSource::Fork,
        Some(_) => CheckpointSource::Loop,
    };
    let step = base
        .map(|b| b.metadata.step.unwrap_or(0) + 1)
        .unwrap_or(0);

    let mut metadata = CheckpointMetadata::new()
        .with_source(source)
        .with_step(step)
        .with_run_id(run_id.to_string());
    if let Some(base) = base {
        metadata = metadata.with_parents(HashMap::from([(
            config.recast_checkpoint_ns(),
            base.checkpoint.id,
        )]));
    }
    for (key, value) in &config.metadata {
        metadata = metadata.with_extra(key.clone(), value.clone());
    }
    if !config.tags.is_empty() && !metadata.extra.contains_key("tags") {
        metadata = metadata.with_extra("tags", json!(config.tags));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use strand_checkpoint::InMemoryCheckpointSaver;

    fn appender() -> Entrypoint {
        Entrypoint::new("appender", |input, previous, _runtime| {
            Box::pin(async move {
                let mut items = previous
                    .and_then(|p| p.as_array().cloned())
                    .unwrap_or_default();
                items.push(input);
                Ok(Final::from(Value::Array(items)))
            })
        })
    }

    #[test]
    fn test_final_save_defaults_to_value() {
        let fin = Final::from(json!(1));
        assert_eq!(fin.save_value(), &json!(1));
        assert_eq!(Final::new(json!(1)).with_save(json!(2)).save_value(), &json!(2));
    }

    #[tokio::test]
    async fn test_without_checkpointer_nothing_is_remembered() {
        let entrypoint = appender();
        assert_eq!(entrypoint.invoke(json!("a"), RunConfig::for_thread("1")).await.unwrap(), json!(["a"]));
        assert_eq!(entrypoint.invoke(json!("b"), RunConfig::for_thread("1")).await.unwrap(), json!(["b"]));
        assert!(entrypoint.get_state(&RunConfig::for_thread("1")).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_records_metadata() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let entrypoint = appender().with_checkpointer(saver.clone());

        entrypoint
            .invoke(json!("a"), RunConfig::for_thread("1").with_configurable("user_id", json!("bob")))
            .await
            .unwrap();
        entrypoint.invoke(json!("b"), RunConfig::for_thread("1")).await.unwrap();

        let latest = entrypoint.get_state(&RunConfig::for_thread("1")).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.id, CheckpointId::new(2));
        assert_eq!(latest.checkpoint.channel(DEFAULT_SAVE_CHANNEL), Some(&json!(["a", "b"])));
        assert_eq!(latest.checkpoint.channel("appender"), Some(&json!(["a", "b"])));
        assert_eq!(latest.metadata.source, Some(CheckpointSource::Loop));
        assert_eq!(latest.metadata.step, Some(1));
        assert!(latest.metadata.run_id.is_some());

        let first = entrypoint
            .get_state(&RunConfig::for_thread("1").with_checkpoint_id(CheckpointId::new(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.metadata.source, Some(CheckpointSource::Input));
        assert_eq!(first.metadata.extra.get("user_id"), Some(&json!("bob")));
    }

    #[tokio::test]
    async fn test_unknown_checkpoint_id_is_not_found() {
        let entrypoint = appender().with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
        let err = entrypoint
            .invoke(json!("a"), RunConfig::for_thread("1").with_checkpoint_id(CheckpointId::new(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_aborts_and_commits_nothing() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let stuck = task("stuck", |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!(null))
            })
        });
        let entrypoint = Entrypoint::new("slow", move |input, _previous, runtime| {
            let stuck = stuck.clone();
            Box::pin(async move {
                let value = runtime.submit(&stuck, input).await?;
                Ok(Final::from(value))
            })
        })
        .with_checkpointer(saver.clone());

        let err = entrypoint
            .invoke(json!(null), RunConfig::for_thread("1").with_timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
        assert!(saver.get_latest("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outputs_recorded_before_deadline_survive_for_retry() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let a_calls = Arc::new(AtomicUsize::new(0));
        let hang_once = Arc::new(AtomicBool::new(true));

        let a = {
            let a_calls = a_calls.clone();
            task("a", move |input| {
                let a_calls = a_calls.clone();
                Box::pin(async move {
                    a_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(format!("a({input})")))
                })
            })
        };
        let b = {
            let hang_once = hang_once.clone();
            task("b", move |input| {
                let hang_once = hang_once.clone();
                Box::pin(async move {
                    if hang_once.swap(false, Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(json!(format!("b({})", input.as_str().unwrap_or_default())))
                })
            })
        };
        let entrypoint = Entrypoint::new("pipeline", move |input, _previous, runtime| {
            let (a, b) = (a.clone(), b.clone());
            Box::pin(async move {
                let first = runtime.submit(&a, input).await?;
                Ok(Final::from(runtime.submit(&b, first).await?))
            })
        })
        .with_checkpointer(saver.clone());
        let config = RunConfig::for_thread("1").with_timeout(Duration::from_millis(50));

        let err = entrypoint.invoke(json!(1), config.clone()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
        let pending = saver.get_writes("1", CheckpointId::ROOT).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|w| w.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a:0"]);

        let value = entrypoint.invoke(json!(1), config).await.unwrap();
        assert_eq!(value, json!("b(a(1))"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unawaited_tasks_leave_no_writes_behind_the_commit() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let background = task("bg", |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(json!("late"))
            })
        });
        let entrypoint = Entrypoint::new("fire_and_forget", move |input, _previous, runtime| {
            let background = background.clone();
            Box::pin(async move {
                drop(runtime.submit(&background, json!(null)));
                Ok(Final::from(input))
            })
        })
        .with_checkpointer(saver.clone());

        entrypoint.invoke(json!("done"), RunConfig::for_thread("1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(saver.get_writes("1", CheckpointId::ROOT).await.unwrap().is_empty());
        assert!(saver.get_writes("1", CheckpointId::new(1)).await.unwrap().is_empty());
        assert_eq!(
            saver.get_latest("1").await.unwrap().unwrap().checkpoint.channel("fire_and_forget"),
            Some(&json!("done"))
        );
    }
}
