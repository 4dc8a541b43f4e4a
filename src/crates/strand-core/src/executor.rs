//! Task executor: runs task functions for one invocation and records their outputs
//!
//! A [`TaskExecutor`] is created by the entrypoint orchestrator for each invocation and
//! handed to the workflow body through [`Runtime`](crate::Runtime).
//!
//! # Replay
//!
//! The executor is seeded with the pending writes recorded against the invocation's base
//! checkpoint and adds every output it records itself. A submission whose task id already
//! has a recorded output resolves to that output without calling the function, so neither
//! a retried invocation nor a repeated `submit_with_id` repeats side effects that already
//! succeeded. A submission whose id is still running waits for that run instead of
//! starting another. Failures are never recorded.
//!
//! # Task ids
//!
//! `submit` derives `"{task_name}:{n}"`, where `n` counts earlier submissions of the same
//! task name in this invocation. Bodies that submit in a deterministic order therefore get
//! the same ids on every attempt. `submit_with_id` accepts an explicit id instead.
//!
//! # Durability
//!
//! | Mode | Output recorded |
//! |------|-----------------|
//! | `sync` | Before the handle resolves |
//! | `exit` | Buffered; flushed by the orchestrator only if the invocation fails |

use crate::config::Durability;
use crate::error::{Result, WorkflowError};
use crate::stream::{StreamEmitter, StreamEvent, StreamMode};
use crate::task::Task;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_checkpoint::{CheckpointId, CheckpointSaver, PendingWrite, TASK_RETURN_CHANNEL};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Where task outputs of an invocation are recorded
#[derive(Clone)]
struct WriteTarget {
    checkpointer: Arc<dyn CheckpointSaver>,
    thread_id: String,
    base: CheckpointId,
}

/// Final outcome of a run, shared with submissions that joined it
type Outcome = Option<std::result::Result<Value, String>>;

struct InFlight {
    abort: AbortHandle,
    done: watch::Sender<Outcome>,
}

#[derive(Default)]
struct ExecutorState {
    submissions: HashMap<String, usize>,
    recorded: HashMap<String, Value>,
    buffered: Vec<PendingWrite>,
    outstanding: HashMap<String, InFlight>,
}

/// Runs task functions concurrently on the tokio runtime
#[derive(Clone)]
pub struct TaskExecutor {
    target: Option<WriteTarget>,
    durability: Durability,
    limiter: Option<Arc<Semaphore>>,
    emitter: Option<StreamEmitter>,
    state: Arc<Mutex<ExecutorState>>,
}

impl TaskExecutor {
    /// An executor that records nothing
    pub fn new() -> Self {
        Self {
            target: None,
            durability: Durability::Sync,
            limiter: None,
            emitter: None,
            state: Arc::new(Mutex::new(ExecutorState::default())),
        }
    }

    /// Record outputs as pending writes against `base` of `thread_id`
    pub fn with_checkpointer(
        mut self,
        checkpointer: Arc<dyn CheckpointSaver>,
        thread_id: impl Into<String>,
        base: CheckpointId,
    ) -> Self {
        self.target = Some(WriteTarget {
            checkpointer,
            thread_id: thread_id.into(),
            base,
        });
        self
    }

    /// Seed the replay cache with previously recorded writes
    pub fn with_replay(self, writes: impl IntoIterator<Item = PendingWrite>) -> Self {
        {
            let mut state = self.state.lock();
            state.recorded.extend(
                writes
                    .into_iter()
                    .filter(|w| w.channel == TASK_RETURN_CHANNEL)
                    .map(|w| (w.task_id, w.value)),
            );
        }
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Bound the number of simultaneously running task functions
    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.limiter = max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        self
    }

    pub fn with_emitter(mut self, emitter: StreamEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Number of recorded outputs available for replay
    pub fn replayable(&self) -> usize {
        self.state.lock().recorded.len()
    }

    /// Number of spawned tasks whose output has not been recorded yet
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Allocate the next deterministic id for a task name
    pub fn next_task_id(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let count = state.submissions.entry(name.to_string()).or_insert(0);
        let id = format!("{}:{}", name, count);
        *count += 1;
        id
    }

    /// Submit a task; the returned handle resolves to its output
    pub fn submit(&self, task: &Task, input: Value) -> TaskHandle {
        let task_id = self.next_task_id(task.name());
        self.submit_with_id(task_id, task, input)
    }

    /// Submit a task under an explicit, caller-chosen id
    pub fn submit_with_id(&self, task_id: impl Into<String>, task: &Task, input: Value) -> TaskHandle {
        let task_id = task_id.into();

        // Cache lookup, join and spawn happen under one lock so that an id is never run
        // twice concurrently.
        let mut state = self.state.lock();

        if let Some(cached) = state.recorded.get(&task_id) {
            debug!(task = %task_id, "Replaying recorded task output");
            let output = cached.clone();
            drop(state);
            return match self.emitter.clone() {
                None => TaskHandle::ready(task_id, Ok(output)),
                Some(emitter) => {
                    let node = task.name().to_string();
                    let id = task_id.clone();
                    let handle = tokio::spawn(async move {
                        emitter.task_completed(&id, &node, &output).await;
                        Ok(output)
                    });
                    TaskHandle::running(task_id, handle)
                }
            };
        }

        if let Some(running) = state.outstanding.get(&task_id) {
            debug!(task = %task_id, "Joining running task");
            let mut done = running.done.subscribe();
            drop(state);
            let id = task_id.clone();
            let handle = tokio::spawn(async move {
                let outcome = done.wait_for(Option::is_some).await.map(|o| (*o).clone());
                match outcome {
                    Ok(Some(Ok(output))) => Ok(output),
                    Ok(Some(Err(message))) => {
                        Err(WorkflowError::task(id, WorkflowError::execution(message)))
                    }
                    Ok(None) | Err(_) => {
                        Err(WorkflowError::task(id, WorkflowError::execution("task aborted")))
                    }
                }
            });
            return TaskHandle::running(task_id, handle);
        }

        let executor = self.clone();
        let task = task.clone();
        let id = task_id.clone();

        // The entry must exist before the spawned task can remove it.
        let handle = tokio::spawn(async move { executor.run(task, id, input).await });
        let (done, _) = watch::channel(None);
        state.outstanding.insert(
            task_id.clone(),
            InFlight {
                abort: handle.abort_handle(),
                done,
            },
        );
        drop(state);

        TaskHandle::running(task_id, handle)
    }

    /// Abort every task that has not recorded its output yet
    ///
    /// Returns the number of aborted tasks. Their handles, and those of submissions that
    /// joined them, resolve to a task error.
    pub fn abort_outstanding(&self) -> usize {
        let aborted: Vec<(String, InFlight)> = self.state.lock().outstanding.drain().collect();
        for (task_id, running) in &aborted {
            warn!(task = %task_id, "Aborting outstanding task");
            running.abort.abort();
        }
        aborted.len()
    }

    /// Record outputs buffered under `exit` durability
    pub async fn flush(&self) -> Result<usize> {
        let Some(target) = &self.target else {
            return Ok(0);
        };
        let writes = std::mem::take(&mut self.state.lock().buffered);
        if writes.is_empty() {
            return Ok(0);
        }

        let count = writes.len();
        target
            .checkpointer
            .put_writes(&target.thread_id, target.base, writes)
            .await?;
        info!(
            thread_id = %target.thread_id,
            checkpoint_id = %target.base,
            writes = count,
            "Flushed buffered task outputs"
        );
        Ok(count)
    }

    async fn run(self, task: Task, task_id: String, input: Value) -> Result<Value> {
        if let Some(emitter) = &self.emitter {
            emitter
                .emit(
                    StreamMode::Tasks,
                    StreamEvent::TaskStart {
                        task_id: task_id.clone(),
                        node: task.name().to_string(),
                        input: input.clone(),
                    },
                )
                .await;
        }

        match self.execute(&task, &task_id, input).await {
            Ok(output) => {
                if let Err(e) = self.record(&task_id, &output).await {
                    self.finish(&task_id, Err(e.to_string()));
                    return Err(e);
                }
                self.finish(&task_id, Ok(output.clone()));

                if let Some(emitter) = &self.emitter {
                    emitter
                        .emit(
                            StreamMode::Tasks,
                            StreamEvent::TaskEnd {
                                task_id: task_id.clone(),
                                node: task.name().to_string(),
                                output: output.clone(),
                            },
                        )
                        .await;
                    emitter.task_completed(&task_id, task.name(), &output).await;
                }
                Ok(output)
            }
            Err(err) => {
                self.finish(&task_id, Err(err.to_string()));
                if let Some(emitter) = &self.emitter {
                    emitter
                        .emit(
                            StreamMode::Tasks,
                            StreamEvent::TaskError {
                                task_id: task_id.clone(),
                                node: task.name().to_string(),
                                error: err.to_string(),
                            },
                        )
                        .await;
                }
                Err(WorkflowError::task(task_id, err))
            }
        }
    }

    /// Publish the outcome of a run; a recorded output becomes replayable in the same step
    /// the run stops being outstanding.
    fn finish(&self, task_id: &str, outcome: std::result::Result<Value, String>) {
        let mut state = self.state.lock();
        if let Ok(output) = &outcome {
            state.recorded.insert(task_id.to_string(), output.clone());
        }
        if let Some(running) = state.outstanding.remove(task_id) {
            running.done.send_replace(Some(outcome));
        }
    }

    /// Run the function until it succeeds or the retry policy is exhausted
    async fn execute(&self, task: &Task, task_id: &str, input: Value) -> Result<Value> {
        let max_attempts = task.retry_policy().map(|p| p.max_attempts).unwrap_or(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                task = %task_id,
                attempt = attempts,
                max_attempts = max_attempts,
                "Executing task"
            );

            let outcome = {
                let _permit = self.acquire().await?;
                task.call(input.clone()).await
            };

            match outcome {
                Ok(output) => {
                    if attempts > 1 {
                        info!(task = %task_id, attempts = attempts, "Task succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) => match task.retry_policy().filter(|p| p.should_retry(attempts)) {
                    Some(policy) => {
                        let delay = policy.calculate_delay(attempts - 1);
                        warn!(
                            task = %task_id,
                            attempt = attempts,
                            max_attempts = max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Task failed, retrying after delay"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(task = %task_id, attempts = attempts, error = %e, "Task failed");
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.limiter {
            Some(limiter) => limiter
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| WorkflowError::execution("task concurrency limiter closed")),
            None => Ok(None),
        }
    }

    async fn record(&self, task_id: &str, output: &Value) -> Result<()> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        let write = PendingWrite::task_return(&target.thread_id, target.base, task_id, output.clone());

        match self.durability {
            Durability::Sync => {
                target
                    .checkpointer
                    .put_writes(&target.thread_id, target.base, vec![write])
                    .await
                    .map_err(|e| {
                        error!(task = %task_id, error = %e, "Failed to record task output");
                        WorkflowError::from(e)
                    })?;
                debug!(task = %task_id, checkpoint_id = %target.base, "Recorded task output");
            }
            Durability::Exit => self.state.lock().buffered.push(write),
        }
        Ok(())
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("thread_id", &self.target.as_ref().map(|t| t.thread_id.as_str()))
            .field("base", &self.target.as_ref().map(|t| t.base))
            .field("replayable", &self.replayable())
            .field("durability", &self.durability)
            .field("streaming", &self.emitter.is_some())
            .finish()
    }
}

enum HandleState {
    Ready(Option<Result<Value>>),
    Running(JoinHandle<Result<Value>>),
}

/// Future resolving to a submitted task's output
///
/// Dropping a handle does not cancel the task.
pub struct TaskHandle {
    task_id: String,
    state: HandleState,
}

impl TaskHandle {
    fn ready(task_id: String, result: Result<Value>) -> Self {
        Self {
            task_id,
            state: HandleState::Ready(Some(result)),
        }
    }

    fn running(task_id: String, handle: JoinHandle<Result<Value>>) -> Self {
        Self {
            task_id,
            state: HandleState::Running(handle),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(WorkflowError::execution(format!(
                    "handle of task '{}' polled after completion",
                    this.task_id
                )))
            })),
            HandleState::Running(handle) => Pin::new(handle).poll(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(WorkflowError::task(
                    this.task_id.clone(),
                    WorkflowError::execution("task aborted"),
                )),
                Err(e) => Err(WorkflowError::task(
                    this.task_id.clone(),
                    WorkflowError::execution(format!("task panicked: {}", e)),
                )),
            }),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("task_id", &self.task_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::task::task;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use strand_checkpoint::InMemoryCheckpointSaver;

    fn counting_task(name: &str, calls: Arc<AtomicUsize>) -> Task {
        task(name, move |input| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "echo": input }))
            })
        })
    }

    fn flaky_task(failures: usize, calls: Arc<AtomicUsize>) -> Task {
        task("flaky", move |_| {
            let calls = calls.clone();
            Box::pin(async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < failures {
                    Err(WorkflowError::execution(format!("simulated failure {}", attempt + 1)))
                } else {
                    Ok(json!("ok"))
                }
            })
        })
    }

    #[tokio::test]
    async fn test_task_ids_are_deterministic() {
        let executor = TaskExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let t = counting_task("greet", calls.clone());

        let first = executor.submit(&t, json!(1));
        let second = executor.submit(&t, json!(2));
        assert_eq!(first.task_id(), "greet:0");
        assert_eq!(second.task_id(), "greet:1");
        assert_eq!(executor.next_task_id("other"), "other:0");

        assert_eq!(first.await.unwrap(), json!({ "echo": 1 }));
        assert_eq!(second.await.unwrap(), json!({ "echo": 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_successful_output_is_recorded_and_replayed() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let t = counting_task("greet", calls.clone());

        let executor = TaskExecutor::new().with_checkpointer(saver.clone(), "t", CheckpointId::ROOT);
        executor.submit(&t, json!("bob")).await.unwrap();

        let writes = saver.get_writes("t", CheckpointId::ROOT).await.unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].task_id, "greet:0");

        let replaying = TaskExecutor::new()
            .with_checkpointer(saver.clone(), "t", CheckpointId::ROOT)
            .with_replay(writes);
        assert_eq!(replaying.replayable(), 1);
        let output = replaying.submit(&t, json!("ignored")).await.unwrap();

        assert_eq!(output, json!({ "echo": "bob" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cached task must not re-run");
    }

    #[tokio::test]
    async fn test_repeated_id_reuses_output_recorded_in_this_invocation() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let charge = counting_task("charge", calls.clone());
        let executor = TaskExecutor::new().with_checkpointer(saver.clone(), "t", CheckpointId::ROOT);

        let first = executor.submit_with_id("charge-card", &charge, json!(10)).await.unwrap();
        let second = executor.submit_with_id("charge-card", &charge, json!(99)).await.unwrap();

        assert_eq!(first, json!({ "echo": 10 }));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.replayable(), 1);
        assert_eq!(saver.get_writes("t", CheckpointId::ROOT).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_of_one_id_share_a_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = {
            let calls = calls.clone();
            task("slow", move |input| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(input)
                })
            })
        };
        let executor = TaskExecutor::new();

        let first = executor.submit_with_id("once", &slow, json!(1));
        let second = executor.submit_with_id("once", &slow, json!(2));
        assert_eq!(executor.outstanding(), 1);

        assert_eq!(first.await.unwrap(), json!(1));
        assert_eq!(second.await.unwrap(), json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_abort_reaches_joined_submissions() {
        let executor = TaskExecutor::new();
        let stuck = task("stuck", |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!(null))
            })
        });

        let first = executor.submit_with_id("stuck", &stuck, json!(null));
        let second = executor.submit_with_id("stuck", &stuck, json!(null));
        assert_eq!(executor.abort_outstanding(), 1);

        assert!(first.await.unwrap_err().to_string().contains("aborted"));
        assert!(second.await.unwrap_err().to_string().contains("aborted"));
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = TaskExecutor::new().with_checkpointer(saver.clone(), "t", CheckpointId::ROOT);

        let err = executor.submit(&flaky_task(1, calls.clone()), json!(null)).await.unwrap_err();
        match err {
            WorkflowError::Task { task_id, .. } => assert_eq!(task_id, "flaky:0"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(saver.get_writes("t", CheckpointId::ROOT).await.unwrap().is_empty());
        assert_eq!(executor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_retry_policy_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let t = flaky_task(2, calls.clone()).with_retry(
            RetryPolicy::new(3)
                .with_initial_interval(0.001)
                .with_max_interval(0.01)
                .with_jitter(false),
        );

        let output = TaskExecutor::new().submit(&t, json!(null)).await.unwrap();
        assert_eq!(output, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let t = flaky_task(5, calls.clone())
            .with_retry(RetryPolicy::new(2).with_initial_interval(0.001).with_jitter(false));

        assert!(TaskExecutor::new().submit(&t, json!(null)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exit_durability_buffers_until_flush() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = TaskExecutor::new()
            .with_checkpointer(saver.clone(), "t", CheckpointId::ROOT)
            .with_durability(Durability::Exit);

        executor.submit(&counting_task("a", calls.clone()), json!(1)).await.unwrap();
        executor.submit(&counting_task("b", calls.clone()), json!(2)).await.unwrap();
        assert!(saver.get_writes("t", CheckpointId::ROOT).await.unwrap().is_empty());

        assert_eq!(executor.flush().await.unwrap(), 2);
        assert_eq!(saver.get_writes("t", CheckpointId::ROOT).await.unwrap().len(), 2);
        assert_eq!(executor.flush().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_concurrency_bounds_running_functions() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let t = {
            let running = running.clone();
            let peak = peak.clone();
            task("slow", move |input| {
                let running = running.clone();
                let peak = peak.clone();
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(input)
                })
            })
        };

        let executor = TaskExecutor::new().with_max_concurrency(Some(2));
        let handles: Vec<TaskHandle> = (0..6).map(|i| executor.submit(&t, json!(i))).collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), json!(i));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_abort_outstanding() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let executor = TaskExecutor::new().with_checkpointer(saver.clone(), "t", CheckpointId::ROOT);
        let stuck = task("stuck", |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!(null))
            })
        });

        let handle = executor.submit(&stuck, json!(null));
        assert_eq!(executor.abort_outstanding(), 1);

        let err = handle.await.unwrap_err();
        assert!(err.to_string().contains("aborted"), "{err}");
        assert!(saver.get_writes("t", CheckpointId::ROOT).await.unwrap().is_empty());
    }
}
