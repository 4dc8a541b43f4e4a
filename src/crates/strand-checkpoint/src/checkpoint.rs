//! Core checkpoint data structures for thread-scoped persistence
//!
//! This module defines the types every storage backend speaks: **[`Checkpoint`]**,
//! **[`CheckpointId`]**, **[`CheckpointMetadata`]**, **[`CheckpointConfig`]**,
//! **[`CheckpointTuple`]** and **[`PendingWrite`]**.
//!
//! # Overview
//!
//! - **Thread isolation** - every checkpoint belongs to exactly one `thread_id`
//! - **Tree-shaped history** - each checkpoint names its parent, so resuming from an
//!   older checkpoint forks a new branch instead of rewriting history
//! - **Totally ordered ids** - ids are a per-thread logical clock, "latest" is the greatest id
//! - **Pending writes** - task outputs recorded against the checkpoint an invocation is
//!   building on, before the next checkpoint is committed
//!
//! # Architecture
//!
//! ```text
//! thread "user-1"
//!
//!   ROOT (0) ── pending writes of the first invocation live here
//!     │
//!     ▼
//!   #1 ──▶ #2 ──▶ #3            (main branch)
//!           │
//!           └───▶ #4            (fork: resumed from #2, now the latest)
//! ```
//!
//! # Checkpoint ids
//!
//! A new commit is assigned `latest.next()`. Two invocations racing on the same thread
//! observe the same head and therefore compute the same id; the store's insert-if-absent
//! on `(thread_id, checkpoint_id)` then lets exactly one of them win.
//!
//! ```rust
//! use strand_checkpoint::CheckpointId;
//!
//! let first = CheckpointId::ROOT.next();
//! assert_eq!(first, CheckpointId::new(1));
//! assert!(first.next() > first);
//! assert_eq!("7".parse::<CheckpointId>().unwrap(), CheckpointId::new(7));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CheckpointError;

/// Channel a task's successful output is recorded on.
pub const TASK_RETURN_CHANNEL: &str = "__return__";

/// Namespace key of the immediate parent in [`CheckpointMetadata::parents`].
pub const ROOT_NAMESPACE: &str = "";

/// Identifier of a checkpoint within its thread.
///
/// Ids form a logical clock that increases monotonically per thread.
/// [`CheckpointId::ROOT`] stands for the empty state before the first commit and is
/// never the id of a stored checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(u64);

impl CheckpointId {
    /// The state of a thread before any checkpoint exists.
    pub const ROOT: CheckpointId = CheckpointId(0);

    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// The id a commit on top of this one receives.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn sequence(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Id for the next commit given the latest id of a thread, if any.
    pub fn after(latest: Option<CheckpointId>) -> Self {
        latest.unwrap_or(Self::ROOT).next()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CheckpointId {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(CheckpointId)
            .map_err(|_| CheckpointError::Invalid(format!("malformed checkpoint id: {s:?}")))
    }
}

/// A task output that has not been folded into a committed checkpoint yet.
///
/// `checkpoint_id` is the checkpoint the producing invocation was building on
/// (or [`CheckpointId::ROOT`] for a thread without history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub thread_id: String,
    pub checkpoint_id: CheckpointId,
    pub task_id: String,
    pub channel: String,
    pub value: serde_json::Value,
}

impl PendingWrite {
    pub fn new(
        thread_id: impl Into<String>,
        checkpoint_id: CheckpointId,
        task_id: impl Into<String>,
        channel: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id,
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }

    /// A write of a task's return value.
    pub fn task_return(
        thread_id: impl Into<String>,
        checkpoint_id: CheckpointId,
        task_id: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self::new(thread_id, checkpoint_id, task_id, TASK_RETURN_CHANNEL, value)
    }
}

/// Metadata source type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from the input of an invocation
    Input,
    /// Checkpoint committed by an invocation building on the latest checkpoint
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint committed on top of an older, non-latest checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint.
    /// 0 for the first commit of a thread, parent step + 1 afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Mapping from checkpoint namespace to parent checkpoint id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, CheckpointId>>,

    /// Id of the invocation that committed this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_parents(mut self, parents: HashMap<String, CheckpointId>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// True when every `(key, value)` of `filter` is present in `extra`.
    pub fn matches(&self, filter: &HashMap<String, serde_json::Value>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.extra.get(key) == Some(value))
    }
}

/// Immutable snapshot of a thread's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The version of the checkpoint format (currently 1)
    pub v: i32,

    /// Thread this checkpoint belongs to
    pub thread_id: String,

    /// The id of the checkpoint, unique and monotonically increasing within the thread
    pub id: CheckpointId,

    /// Checkpoint this one was committed on top of
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,

    /// Creation timestamp
    pub ts: DateTime<Utc>,

    /// Mapping from channel name to channel value
    pub channel_values: HashMap<String, serde_json::Value>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    pub fn new(
        thread_id: impl Into<String>,
        id: CheckpointId,
        parent_id: Option<CheckpointId>,
        channel_values: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            thread_id: thread_id.into(),
            id,
            parent_id,
            ts: Utc::now(),
            channel_values,
        }
    }

    /// Set a single channel value
    pub fn with_channel(mut self, channel: impl Into<String>, value: serde_json::Value) -> Self {
        self.channel_values.insert(channel.into(), value);
        self
    }

    pub fn channel(&self, channel: &str) -> Option<&serde_json::Value> {
        self.channel_values.get(channel)
    }

    /// Key the writes folded into this checkpoint were pending under.
    pub fn parent_or_root(&self) -> CheckpointId {
        self.parent_id.unwrap_or(CheckpointId::ROOT)
    }

    /// Whether `other` is a retry of the same commit.
    ///
    /// Timestamps are ignored: a retried commit is rebuilt, not replayed byte for byte.
    pub fn same_commit(&self, other: &Checkpoint) -> bool {
        self.thread_id == other.thread_id
            && self.id == other.id
            && self.parent_id == other.parent_id
            && self.channel_values == other.channel_values
    }

    /// Structural checks performed by every backend before insertion.
    pub fn validate(&self) -> crate::Result<()> {
        if self.thread_id.is_empty() {
            return Err(CheckpointError::Invalid("thread_id must not be empty".to_string()));
        }
        if self.id.is_root() {
            return Err(CheckpointError::Invalid(
                "the root id cannot be stored as a checkpoint".to_string(),
            ));
        }
        if let Some(parent) = self.parent_id {
            if parent >= self.id {
                return Err(CheckpointError::Invalid(format!(
                    "parent {} must precede checkpoint {}",
                    parent, self.id
                )));
            }
        }
        Ok(())
    }
}

/// Address of a checkpoint: a thread and optionally a specific checkpoint in it
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint to address; the latest one when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config addressing the latest checkpoint of a thread
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self::new().with_thread_id(thread_id)
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    /// The thread id, or an `Invalid` error when it is missing.
    pub fn require_thread_id(&self) -> crate::Result<&str> {
        self.thread_id
            .as_deref()
            .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
    }
}

/// A checkpoint together with its metadata and addressing information
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Config addressing exactly this checkpoint
    pub config: CheckpointConfig,

    pub checkpoint: Checkpoint,

    pub metadata: CheckpointMetadata,

    /// Config addressing the parent checkpoint (if any)
    pub parent_config: Option<CheckpointConfig>,
}

impl CheckpointTuple {
    pub fn new(checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Self {
        let config = CheckpointConfig::for_thread(checkpoint.thread_id.clone())
            .with_checkpoint_id(checkpoint.id);
        let parent_config = checkpoint.parent_id.map(|parent| {
            CheckpointConfig::for_thread(checkpoint.thread_id.clone()).with_checkpoint_id(parent)
        });
        Self {
            config,
            checkpoint,
            metadata,
            parent_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_id_ordering() {
        let first = CheckpointId::after(None);
        assert_eq!(first, CheckpointId::new(1));
        assert!(CheckpointId::ROOT < first);
        assert_eq!(CheckpointId::after(Some(first)), CheckpointId::new(2));
        assert!(CheckpointId::ROOT.is_root());
        assert!(!first.is_root());
    }

    #[test]
    fn test_checkpoint_id_parse() {
        assert_eq!("42".parse::<CheckpointId>().unwrap(), CheckpointId::new(42));
        assert!(matches!(
            "abc".parse::<CheckpointId>(),
            Err(CheckpointError::Invalid(_))
        ));
        assert_eq!(CheckpointId::new(9).to_string(), "9");
    }

    #[test]
    fn test_checkpoint_id_serializes_as_number() {
        let json = serde_json::to_value(CheckpointId::new(3)).unwrap();
        assert_eq!(json, json!(3));
    }

    #[test]
    fn test_validate_rejects_bad_parent() {
        let checkpoint = Checkpoint::new("t", CheckpointId::new(2), Some(CheckpointId::new(2)), HashMap::new());
        assert!(checkpoint.validate().is_err());

        let root = Checkpoint::new("t", CheckpointId::ROOT, None, HashMap::new());
        assert!(root.validate().is_err());

        let empty_thread = Checkpoint::new("", CheckpointId::new(1), None, HashMap::new());
        assert!(empty_thread.validate().is_err());

        let ok = Checkpoint::new("t", CheckpointId::new(3), Some(CheckpointId::new(1)), HashMap::new());
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_same_commit_ignores_timestamp() {
        let a = Checkpoint::new("t", CheckpointId::new(1), None, HashMap::new())
            .with_channel("__previous__", json!(["hi"]));
        let mut b = a.clone();
        b.ts = a.ts + chrono::Duration::seconds(5);
        assert!(a.same_commit(&b));

        let c = a.clone().with_channel("__previous__", json!(["bye"]));
        assert!(!a.same_commit(&c));
    }

    #[test]
    fn test_metadata_filter() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Loop)
            .with_step(0)
            .with_extra("user", json!("alice"));

        let mut filter = HashMap::new();
        filter.insert("user".to_string(), json!("alice"));
        assert!(metadata.matches(&filter));

        filter.insert("user".to_string(), json!("bob"));
        assert!(!metadata.matches(&filter));
        assert!(metadata.matches(&HashMap::new()));
    }

    #[test]
    fn test_metadata_serialization_flattens_extra() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Fork)
            .with_extra("tag", json!("x"));
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["source"], json!("fork"));
        assert_eq!(value["tag"], json!("x"));
        assert!(value.get("step").is_none());
    }

    #[test]
    fn test_tuple_addresses_parent() {
        let checkpoint = Checkpoint::new("t", CheckpointId::new(2), Some(CheckpointId::new(1)), HashMap::new());
        let tuple = CheckpointTuple::new(checkpoint, CheckpointMetadata::new());
        assert_eq!(tuple.config.checkpoint_id, Some(CheckpointId::new(2)));
        assert_eq!(
            tuple.parent_config.and_then(|c| c.checkpoint_id),
            Some(CheckpointId::new(1))
        );
    }

    #[test]
    fn test_config_requires_thread() {
        assert!(CheckpointConfig::new().require_thread_id().is_err());
        assert_eq!(CheckpointConfig::for_thread("a").require_thread_id().unwrap(), "a");
    }
}
