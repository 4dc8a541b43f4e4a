//! Tasks: named, retryable units of work submitted from a workflow body

use crate::error::Result;
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by task functions
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Type alias for task functions
pub type TaskFn = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

/// A named async function whose successful outputs are recorded per thread
///
/// Task names should be unique within an entrypoint: together with the submission count
/// they form the task id under which outputs are replayed.
///
/// # Example
///
/// ```rust
/// use strand_core::{task, RetryPolicy, WorkflowError};
/// use serde_json::json;
///
/// let compose = task("compose_essay", |topic| Box::pin(async move {
///     let topic = topic.as_str().ok_or_else(|| WorkflowError::execution("topic must be a string"))?;
///     Ok(json!(format!("An essay about {topic}")))
/// }))
/// .with_retry(RetryPolicy::new(3));
///
/// assert_eq!(compose.name(), "compose_essay");
/// ```
#[derive(Clone)]
pub struct Task {
    name: String,
    func: TaskFn,
    retry_policy: Option<RetryPolicy>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> TaskFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            retry_policy: None,
        }
    }

    /// Retry failed executions with the given policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    /// Run the function once, bypassing the executor
    pub(crate) fn call(&self, input: Value) -> TaskFuture {
        (self.func)(input)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Convenience function to create a task
pub fn task<F>(name: impl Into<String>, func: F) -> Task
where
    F: Fn(Value) -> TaskFuture + Send + Sync + 'static,
{
    Task::new(name, func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_call() {
        let double = task("double", |input| {
            Box::pin(async move { Ok(json!(input.as_i64().unwrap_or(0) * 2)) })
        });

        assert_eq!(double.call(json!(21)).await.unwrap(), json!(42));
        assert!(double.retry_policy().is_none());
        assert_eq!(format!("{:?}", double), "Task { name: \"double\", retry_policy: None }");
    }
}
