//! Tasks, task failures and keeper errors.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;

/// Error type produced by task actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Action = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

// ============================================================================
// Task
// ============================================================================

/// A unit of deferred work.
///
/// Owned by the submitter until [`Keeper::submit`](super::Keeper::submit)
/// accepts it; owned by the keeper afterwards until it completes or times out.
pub struct Task {
    pub(super) name: String,
    pub(super) action: Action,
    pub(super) enqueued: Instant,
    pub(super) enqueued_at: DateTime<Utc>,
}

impl Task {
    /// Wraps an async action.
    ///
    /// The action's error (if any) is reported to the failure sink, never to
    /// the submitter.
    pub fn new<F, E>(name: impl Into<String>, action: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            name: name.into(),
            action: Box::pin(async move { action.await.map_err(Into::<BoxError>::into) }),
            enqueued: Instant::now(),
            enqueued_at: Utc::now(),
        }
    }

    /// Wraps an action that cannot fail.
    pub fn infallible<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::new(name, async move {
            action.await;
            Ok::<(), BoxError>(())
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restamps the enqueue time; called when the keeper accepts the task.
    pub(super) fn stamp(&mut self) {
        self.enqueued = Instant::now();
        self.enqueued_at = Utc::now();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Why an accepted task did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task ran past the keeper's per-task timeout.
    #[error("task timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The task's action returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task's action panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Report handed to the failure sink, exactly once per failed task.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: String,
    pub error: TaskError,
    pub enqueued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl TaskFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self.error, TaskError::Timeout { .. })
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task, self.error)
    }
}

// ============================================================================
// Keeper Errors
// ============================================================================

/// Errors returned to submitters and at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeeperError {
    /// Outstanding work is at capacity; the caller must retry or drop.
    #[error("task queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    /// The keeper is shutting down and admits no new work.
    #[error("keeper is closed")]
    Closed,

    #[error("invalid keeper configuration: {0}")]
    InvalidConfig(String),
}
