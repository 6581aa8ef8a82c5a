//! Failure sink.
//!
//! Workers never call the sink directly. They push [`TaskFailure`]s onto a
//! channel drained by one sink task, so a slow or panicking sink cannot stall
//! or kill a worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::task::TaskFailure;

/// Receives every task failure (timeouts, errors, panics).
pub trait FailureSink: Send + Sync + 'static {
    fn report(&self, failure: &TaskFailure);
}

impl<F> FailureSink for F
where
    F: Fn(&TaskFailure) + Send + Sync + 'static,
{
    fn report(&self, failure: &TaskFailure) {
        self(failure)
    }
}

/// Sink that logs failures at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn report(&self, failure: &TaskFailure) {
        error!(
            task = %failure.task,
            error = %failure.error,
            enqueued_at = %failure.enqueued_at,
            "Keeper task failed"
        );
    }
}

/// Spawns the task that drains `failures` into `sink`.
///
/// Exits once every worker has dropped its sender.
pub(super) fn spawn_sink(
    sink: Arc<dyn FailureSink>,
    mut failures: mpsc::UnboundedReceiver<TaskFailure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            if catch_unwind(AssertUnwindSafe(|| sink.report(&failure))).is_err() {
                error!(task = %failure.task, "Failure sink panicked while reporting");
            }
        }

        debug!("Failure sink stopped");
    })
}
