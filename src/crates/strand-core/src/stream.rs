//! Streaming of workflow progress
//!
//! `Entrypoint::stream` spawns the run and hands back a finite [`EventStream`]. Events are
//! pushed through a bounded `tokio::sync::mpsc` channel by whichever unit of work produced
//! them (a completing task, the orchestrator after a commit, the body through
//! [`StreamWriter`]).
//!
//! # Modes
//!
//! | Mode | Emits |
//! |------|-------|
//! | `values` | Object of completed task outputs keyed by task id, then the final return value |
//! | `updates` | `{task_name: output}` per completed task, then `{entrypoint: value}` |
//! | `tasks` | `TaskStart`, `TaskEnd`, `TaskError` |
//! | `checkpoints` | The committed checkpoint |
//! | `debug` | `tasks` + `checkpoints` |
//! | `custom` | Data written through [`StreamWriter`] |
//!
//! A terminal [`StreamEvent::Error`] is delivered regardless of mode when the run fails.
//!
//! # Ordering
//!
//! Every chunk carries a per-run `sequence` number; chunks arrive in sequence order.
//! A task that awaits another task's handle can only complete after it, so causally
//! dependent events are always ordered.
//!
//! # Cancellation
//!
//! Dropping the stream stops delivery only. Emitters notice the closed channel and skip
//! further sends; the run itself continues and commits (or fails) as a whole.

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream returned by `Entrypoint::stream`
pub type EventStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// What a stream emits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Cumulative visible value after each completion
    #[default]
    Values,

    /// Per-task deltas
    Updates,

    /// Committed checkpoints
    Checkpoints,

    /// Task lifecycle events
    Tasks,

    /// Checkpoints + Tasks
    Debug,

    /// Application data written by the workflow body
    Custom,
}

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    /// Visible value so far
    Values { state: Value },

    /// Output of one task (or of the entrypoint itself)
    Updates { node: String, update: Value },

    /// A checkpoint was committed
    Checkpoint {
        thread_id: String,
        namespace: String,
        checkpoint: Value,
    },

    TaskStart {
        task_id: String,
        node: String,
        input: Value,
    },

    TaskEnd {
        task_id: String,
        node: String,
        output: Value,
    },

    TaskError {
        task_id: String,
        node: String,
        error: String,
    },

    Custom { data: Value },

    /// The run failed; always the last chunk of its stream
    Error { error: String },
}

impl StreamEvent {
    /// Check if this event matches the given stream mode
    pub fn matches_mode(&self, mode: StreamMode) -> bool {
        match (mode, self) {
            (_, StreamEvent::Error { .. }) => true,
            (StreamMode::Values, StreamEvent::Values { .. }) => true,
            (StreamMode::Updates, StreamEvent::Updates { .. }) => true,
            (StreamMode::Checkpoints | StreamMode::Debug, StreamEvent::Checkpoint { .. }) => true,
            (
                StreamMode::Tasks | StreamMode::Debug,
                StreamEvent::TaskStart { .. }
                | StreamEvent::TaskEnd { .. }
                | StreamEvent::TaskError { .. },
            ) => true,
            (StreamMode::Custom, StreamEvent::Custom { .. }) => true,
            _ => false,
        }
    }

    /// The mode an event is primarily emitted under
    pub fn primary_mode(&self) -> StreamMode {
        match self {
            StreamEvent::Values { .. } | StreamEvent::Error { .. } => StreamMode::Values,
            StreamEvent::Updates { .. } => StreamMode::Updates,
            StreamEvent::Checkpoint { .. } => StreamMode::Checkpoints,
            StreamEvent::TaskStart { .. }
            | StreamEvent::TaskEnd { .. }
            | StreamEvent::TaskError { .. } => StreamMode::Tasks,
            StreamEvent::Custom { .. } => StreamMode::Custom,
        }
    }
}

/// Stream chunk with namespace, mode, and ordering information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Checkpoint namespace of the run (empty for a root entrypoint)
    pub namespace: String,

    pub mode: StreamMode,

    pub event: StreamEvent,

    /// Per-run emission sequence number, starting at 1
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct EmitterState {
    sequence: u64,
    values: Map<String, Value>,
    closed: bool,
}

/// Sends mode-filtered events of one run to its stream
///
/// Cloning shares the channel, the sequence counter and the accumulated values.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    modes: Arc<HashSet<StreamMode>>,
    namespace: String,
    tx: mpsc::Sender<StreamChunk>,
    state: Arc<Mutex<EmitterState>>,
}

impl StreamEmitter {
    /// Create an emitter for the given modes
    ///
    /// Debug mode is expanded to include Tasks and Checkpoints.
    pub fn new(
        modes: impl IntoIterator<Item = StreamMode>,
        namespace: impl Into<String>,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Self {
        let mut expanded: HashSet<StreamMode> = modes.into_iter().collect();
        if expanded.is_empty() {
            expanded.insert(StreamMode::Values);
        }
        if expanded.contains(&StreamMode::Debug) {
            expanded.insert(StreamMode::Tasks);
            expanded.insert(StreamMode::Checkpoints);
        }

        Self {
            modes: Arc::new(expanded),
            namespace: namespace.into(),
            tx,
            state: Arc::new(Mutex::new(EmitterState::default())),
        }
    }

    /// Create an emitter together with the receiving half of its channel
    pub fn channel(
        modes: impl IntoIterator<Item = StreamMode>,
        namespace: impl Into<String>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(modes, namespace, tx), rx)
    }

    pub fn has_mode(&self, mode: StreamMode) -> bool {
        self.modes.contains(&mode)
    }

    /// Whether the receiving stream has been dropped
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed || self.tx.is_closed()
    }

    /// Emit an event under `mode` if that mode is enabled.
    ///
    /// Returns `false` once the stream has been dropped.
    pub async fn emit(&self, mode: StreamMode, event: StreamEvent) -> bool {
        if !self.has_mode(mode) {
            return !self.is_closed();
        }
        self.send(mode, |_| event).await
    }

    /// Record a completed task output and emit the `updates` and `values` views of it
    pub async fn task_completed(&self, task_id: &str, node: &str, output: &Value) -> bool {
        let delivered = self
            .emit(
                StreamMode::Updates,
                StreamEvent::Updates {
                    node: node.to_string(),
                    update: output.clone(),
                },
            )
            .await;

        {
            let mut state = self.state.lock();
            state.values.insert(task_id.to_string(), output.clone());
        }

        if !self.has_mode(StreamMode::Values) {
            return delivered;
        }
        self.send(StreamMode::Values, |values| StreamEvent::Values {
            state: Value::Object(values.clone()),
        })
        .await
    }

    /// Emit the entrypoint's return value as the final `updates` and `values` chunks
    pub async fn finished(&self, entrypoint: &str, value: &Value) -> bool {
        self.emit(
            StreamMode::Updates,
            StreamEvent::Updates {
                node: entrypoint.to_string(),
                update: value.clone(),
            },
        )
        .await;
        self.emit(StreamMode::Values, StreamEvent::Values { state: value.clone() })
            .await
    }

    /// Emit the terminal error chunk, regardless of enabled modes
    pub async fn failed(&self, error: &str) -> bool {
        self.send(StreamMode::Values, |_| StreamEvent::Error {
            error: error.to_string(),
        })
        .await
    }

    /// Reserve channel capacity, then number and enqueue the chunk under the state lock
    /// so that sequence order equals delivery order.
    async fn send<F>(&self, mode: StreamMode, build: F) -> bool
    where
        F: FnOnce(&Map<String, Value>) -> StreamEvent,
    {
        if self.state.lock().closed {
            return false;
        }

        let permit = match self.tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                let mut state = self.state.lock();
                if !state.closed {
                    tracing::debug!(namespace = %self.namespace, "Stream receiver dropped, discarding further events");
                }
                state.closed = true;
                return false;
            }
        };

        let mut state = self.state.lock();
        state.sequence += 1;
        let chunk = StreamChunk {
            namespace: self.namespace.clone(),
            mode,
            event: build(&state.values),
            sequence: state.sequence,
        };
        permit.send(chunk);
        true
    }
}

/// Handle for emitting custom events from a workflow body
///
/// Writes are discarded when the run is not streamed in `custom` mode or the stream was
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct StreamWriter {
    emitter: Option<StreamEmitter>,
}

impl StreamWriter {
    pub(crate) fn new(emitter: Option<StreamEmitter>) -> Self {
        Self { emitter }
    }

    /// A writer that discards everything
    pub fn noop() -> Self {
        Self::default()
    }

    /// Write a custom event to the stream
    pub async fn write(&self, data: Value) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(StreamMode::Custom, StreamEvent::Custom { data }).await;
        }
    }

    /// Whether written data currently reaches a consumer
    pub fn is_active(&self) -> bool {
        self.emitter
            .as_ref()
            .map(|e| e.has_mode(StreamMode::Custom) && !e.is_closed())
            .unwrap_or(false)
    }
}
