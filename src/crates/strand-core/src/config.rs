//! Engine and run configuration
//!
//! Two layers configure an invocation:
//!
//! - [`EngineConfig`] - process-wide defaults loaded from TOML and the environment
//! - [`RunConfig`] - per-invocation settings (thread, fork point, tags, metadata, limits)
//!
//! Run configs are combined with [`RunConfig::merge`] and completed against the engine
//! defaults with [`RunConfig::ensure`] before an invocation starts.
//!
//! # TOML
//!
//! ```toml
//! stream_buffer = 256
//! max_concurrency = 8
//! timeout_ms = 30000
//! conflict_retries = 2
//! durability = "sync"
//!
//! [checkpointer]
//! backend = "sqlite"
//! path = "threads.db"
//! ```
//!
//! # Environment
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STRAND_MAX_CONCURRENCY` | `max_concurrency` |
//! | `STRAND_STREAM_BUFFER` | `stream_buffer` |
//! | `STRAND_CONFLICT_RETRIES` | `conflict_retries` |

use crate::error::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strand_checkpoint::{CheckpointConfig, CheckpointId, CheckpointSaver, InMemoryCheckpointSaver};
use tracing::{debug, info};

pub const ENV_MAX_CONCURRENCY: &str = "STRAND_MAX_CONCURRENCY";
pub const ENV_STREAM_BUFFER: &str = "STRAND_STREAM_BUFFER";
pub const ENV_CONFLICT_RETRIES: &str = "STRAND_CONFLICT_RETRIES";

/// Separator between levels of a checkpoint namespace
pub const NS_SEP: &str = "|";

/// Separator between a namespace level and its task id
pub const NS_END: &str = ":";

/// When task outputs are persisted as pending writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Every task output is recorded before its handle resolves
    #[default]
    Sync,
    /// Outputs are buffered and recorded only if the invocation fails
    Exit,
}

/// Checkpoint backend selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CheckpointerConfig {
    #[default]
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite { path: PathBuf },
}

/// Process-wide engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the bounded event channel behind `Entrypoint::stream`
    pub stream_buffer: usize,

    /// Default bound on simultaneously running task functions
    pub max_concurrency: Option<usize>,

    /// Default invocation deadline in milliseconds
    pub timeout_ms: Option<u64>,

    /// Default number of re-runs after a commit conflict
    pub conflict_retries: usize,

    pub durability: Durability,

    pub checkpointer: CheckpointerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_buffer: 100,
            max_concurrency: None,
            timeout_ms: None,
            conflict_retries: 0,
            durability: Durability::Sync,
            checkpointer: CheckpointerConfig::Memory,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| WorkflowError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            WorkflowError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?.apply_env()?;
        info!(path = %path.display(), "Engine configuration loaded");
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Apply `STRAND_*` overrides from the process environment
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = Some(parse_env(ENV_MAX_CONCURRENCY, &value)?);
        }
        if let Some(value) = lookup(ENV_STREAM_BUFFER) {
            self.stream_buffer = parse_env(ENV_STREAM_BUFFER, &value)?;
        }
        if let Some(value) = lookup(ENV_CONFLICT_RETRIES) {
            self.conflict_retries = parse_env(ENV_CONFLICT_RETRIES, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_buffer == 0 {
            return Err(WorkflowError::Configuration(
                "stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(WorkflowError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Open the configured checkpoint backend
    pub async fn open_checkpointer(&self) -> Result<Arc<dyn CheckpointSaver>> {
        match &self.checkpointer {
            CheckpointerConfig::Memory => Ok(Arc::new(InMemoryCheckpointSaver::new())),
            #[cfg(feature = "sqlite")]
            CheckpointerConfig::Sqlite { path } => {
                let saver = strand_checkpoint::SqliteCheckpointSaver::open(path).await?;
                Ok(Arc::new(saver))
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| WorkflowError::Configuration(format!("{key} has invalid value {value:?}")))
}

/// Per-invocation configuration
///
/// Scalar fields left unset are filled from [`EngineConfig`] by [`RunConfig::ensure`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Thread to load from and commit to; without it nothing is persisted
    pub thread_id: Option<String>,

    /// Build on this checkpoint instead of the latest (fork)
    pub checkpoint_id: Option<CheckpointId>,

    pub checkpoint_ns: Option<String>,

    pub tags: Vec<String>,

    /// Recorded in the `extra` section of the committed checkpoint's metadata
    pub metadata: HashMap<String, Value>,

    /// Free-form values for the workflow body
    pub configurable: HashMap<String, Value>,

    pub max_concurrency: Option<usize>,

    pub timeout: Option<Duration>,

    pub conflict_retries: Option<usize>,

    pub durability: Option<Durability>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Self::default()
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_configurable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_conflict_retries(mut self, retries: usize) -> Self {
        self.conflict_retries = Some(retries);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = Some(durability);
        self
    }

    /// Combine two configs; `other` takes precedence.
    ///
    /// Metadata and configurable maps are merged key by key, tags are concatenated and
    /// scalar fields keep `other`'s value whenever it is set.
    pub fn merge(mut self, other: RunConfig) -> RunConfig {
        self.thread_id = other.thread_id.or(self.thread_id);
        self.checkpoint_id = other.checkpoint_id.or(self.checkpoint_id);
        self.checkpoint_ns = other.checkpoint_ns.or(self.checkpoint_ns);
        self.tags.extend(other.tags);
        self.metadata.extend(other.metadata);
        self.configurable.extend(other.configurable);
        self.max_concurrency = other.max_concurrency.or(self.max_concurrency);
        self.timeout = other.timeout.or(self.timeout);
        self.conflict_retries = other.conflict_retries.or(self.conflict_retries);
        self.durability = other.durability.or(self.durability);
        self
    }

    /// Fill unset fields from engine defaults and promote scalar configurable values
    /// into metadata.
    ///
    /// Keys starting with `__` are internal and never promoted; existing metadata is
    /// never overwritten.
    pub fn ensure(mut self, engine: &EngineConfig) -> Result<RunConfig> {
        if self.max_concurrency == Some(0) {
            return Err(WorkflowError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if matches!(self.thread_id.as_deref(), Some("")) {
            self.thread_id = None;
        }

        self.max_concurrency = self.max_concurrency.or(engine.max_concurrency);
        self.timeout = self.timeout.or_else(|| engine.timeout());
        self.conflict_retries = self.conflict_retries.or(Some(engine.conflict_retries));
        self.durability = self.durability.or(Some(engine.durability));
        self.checkpoint_ns = Some(self.checkpoint_ns.unwrap_or_default());

        for (key, value) in &self.configurable {
            let scalar = matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_));
            if scalar && !key.starts_with("__") && !self.metadata.contains_key(key) {
                debug!(key = %key, "Promoting configurable value to metadata");
                self.metadata.insert(key.clone(), value.clone());
            }
        }

        Ok(self)
    }

    /// Merge entries into `configurable`, replacing existing keys
    pub fn patch_configurable(mut self, patch: HashMap<String, Value>) -> RunConfig {
        self.configurable.extend(patch);
        self
    }

    pub fn conflict_retries(&self) -> usize {
        self.conflict_retries.unwrap_or(0)
    }

    pub fn durability(&self) -> Durability {
        self.durability.unwrap_or_default()
    }

    /// Checkpoint address described by this config
    pub fn checkpoint_config(&self) -> CheckpointConfig {
        let mut config = CheckpointConfig::new();
        config.thread_id = self.thread_id.clone();
        config.checkpoint_id = self.checkpoint_id;
        config.checkpoint_ns = self.checkpoint_ns.clone();
        config
    }

    /// Namespace with task ids and numeric levels removed
    pub fn recast_checkpoint_ns(&self) -> String {
        recast_checkpoint_ns(self.checkpoint_ns.as_deref().unwrap_or_default())
    }
}

/// Strip task ids (`name:id` → `name`) and purely numeric levels from a namespace.
///
/// ```rust
/// use strand_core::config::recast_checkpoint_ns;
///
/// assert_eq!(recast_checkpoint_ns("parent:abc|1|child:def"), "parent|child");
/// ```
pub fn recast_checkpoint_ns(ns: &str) -> String {
    ns.split(NS_SEP)
        .filter(|part| part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()))
        .map(|part| part.split(NS_END).next().unwrap_or(part))
        .collect::<Vec<_>>()
        .join(NS_SEP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_config_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            stream_buffer = 8
            max_concurrency = 4
            timeout_ms = 1500
            durability = "exit"
            "#,
        )
        .unwrap();

        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.durability, Durability::Exit);
        assert_eq!(config.conflict_retries, 0);
        assert_eq!(config.checkpointer, CheckpointerConfig::Memory);
    }

    #[test]
    fn test_engine_config_rejects_zero_buffer() {
        let err = EngineConfig::from_toml_str("stream_buffer = 0").unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_CONCURRENCY, "3"),
            (ENV_CONFLICT_RETRIES, " 2 "),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .apply_env_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_concurrency, Some(3));
        assert_eq!(config.conflict_retries, 2);
        assert_eq!(config.stream_buffer, 100);

        let err = EngineConfig::default()
            .apply_env_with(|key| (key == ENV_STREAM_BUFFER).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_STREAM_BUFFER));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand.toml");
        std::fs::write(&path, "conflict_retries = 1\n").unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        let expected = EngineConfig::from_toml_str("conflict_retries = 1\n")
            .unwrap()
            .apply_env()
            .unwrap();
        assert_eq!(loaded, expected);

        let missing = EngineConfig::load(dir.path().join("missing.toml")).await;
        assert!(matches!(missing, Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_merge_prefers_right_and_concatenates_tags() {
        let base = RunConfig::for_thread("1")
            .with_tag("a")
            .with_metadata("user", json!("bob"))
            .with_metadata("keep", json!(true))
            .with_conflict_retries(1);
        let overlay = RunConfig::new()
            .with_tag("b")
            .with_metadata("user", json!("alice"))
            .with_durability(Durability::Exit);

        let merged = base.merge(overlay);
        assert_eq!(merged.thread_id.as_deref(), Some("1"));
        assert_eq!(merged.tags, vec!["a", "b"]);
        assert_eq!(merged.metadata["user"], json!("alice"));
        assert_eq!(merged.metadata["keep"], json!(true));
        assert_eq!(merged.conflict_retries(), 1);
        assert_eq!(merged.durability(), Durability::Exit);
    }

    #[test]
    fn test_ensure_fills_defaults_and_promotes_scalars() {
        let engine = EngineConfig {
            max_concurrency: Some(2),
            conflict_retries: 3,
            ..EngineConfig::default()
        };
        let config = RunConfig::for_thread("1")
            .with_metadata("model", json!("kept"))
            .with_configurable("model", json!("ignored"))
            .with_configurable("user_id", json!(42))
            .with_configurable("__internal", json!("hidden"))
            .with_configurable("nested", json!({ "a": 1 }))
            .ensure(&engine)
            .unwrap();

        assert_eq!(config.max_concurrency, Some(2));
        assert_eq!(config.conflict_retries(), 3);
        assert_eq!(config.checkpoint_ns.as_deref(), Some(""));
        assert_eq!(config.metadata["model"], json!("kept"));
        assert_eq!(config.metadata["user_id"], json!(42));
        assert!(!config.metadata.contains_key("__internal"));
        assert!(!config.metadata.contains_key("nested"));
    }

    #[test]
    fn test_ensure_treats_empty_thread_as_unset() {
        let config = RunConfig::for_thread("").ensure(&EngineConfig::default()).unwrap();
        assert!(config.thread_id.is_none());
        assert!(RunConfig::new()
            .with_max_concurrency(0)
            .ensure(&EngineConfig::default())
            .is_err());
    }

    #[test]
    fn test_patch_configurable() {
        let config = RunConfig::new()
            .with_configurable("a", json!(1))
            .patch_configurable(HashMap::from([("a".to_string(), json!(2)), ("b".to_string(), json!(3))]));
        assert_eq!(config.configurable["a"], json!(2));
        assert_eq!(config.configurable["b"], json!(3));
    }

    #[test]
    fn test_recast_checkpoint_ns() {
        assert_eq!(recast_checkpoint_ns(""), "");
        assert_eq!(recast_checkpoint_ns("agent"), "agent");
        assert_eq!(recast_checkpoint_ns("agent:7f3a|tools:9c1b"), "agent|tools");
        assert_eq!(recast_checkpoint_ns("agent:7f3a|0|tools"), "agent|tools");
        assert_eq!(
            RunConfig::new().with_checkpoint_ns("outer:1|inner:2").recast_checkpoint_ns(),
            "outer|inner"
        );
    }
}
