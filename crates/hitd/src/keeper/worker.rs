//! Keeper workers.
//!
//! Each worker loops: take the next accepted task, run it on its own tokio
//! task under the per-task timeout, report the outcome. A worker only ever
//! runs one task at a time, which bounds concurrency at the worker count.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::task::{Task, TaskError, TaskFailure};

/// A task that passed admission, together with its capacity slot.
///
/// The slot is released when the worker finishes with the task.
pub(super) struct Accepted {
    pub(super) task: Task,
    pub(super) permit: OwnedSemaphorePermit,
}

/// Shared FIFO of accepted tasks.
pub(super) type Queue = Arc<Mutex<mpsc::Receiver<Accepted>>>;

pub(super) async fn run_worker(
    worker: usize,
    queue: Queue,
    task_timeout: Duration,
    failures: mpsc::UnboundedSender<TaskFailure>,
) {
    debug!(worker, "Keeper worker starting");

    loop {
        // Only one worker waits on the channel at a time, preserving FIFO
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };

        let Some(accepted) = next else {
            break;
        };

        execute(worker, accepted, task_timeout, &failures).await;
    }

    debug!(worker, "Keeper worker stopped");
}

async fn execute(
    worker: usize,
    accepted: Accepted,
    task_timeout: Duration,
    failures: &mpsc::UnboundedSender<TaskFailure>,
) {
    let Accepted { task, permit } = accepted;
    let Task {
        name,
        action,
        enqueued,
        enqueued_at,
    } = task;

    debug!(
        worker,
        task = %name,
        queued_ms = enqueued.elapsed().as_millis() as u64,
        "Running task"
    );

    let mut handle = tokio::spawn(action);

    let result = match timeout(task_timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(TaskError::Failed(e.to_string())),
        Ok(Err(join_error)) if join_error.is_panic() => {
            Err(TaskError::Panicked(panic_message(join_error.into_panic())))
        }
        Ok(Err(join_error)) => Err(TaskError::Failed(join_error.to_string())),
        Err(_elapsed) => {
            // Soft cancellation: stop tracking, abort at the next await point
            handle.abort();
            Err(TaskError::Timeout {
                timeout: task_timeout,
            })
        }
    };

    drop(permit);

    if let Err(error) = result {
        debug!(worker, task = %name, error = %error, "Task did not complete");

        let failure = TaskFailure {
            task: name,
            error,
            enqueued_at,
            failed_at: Utc::now(),
        };

        if failures.send(failure).is_err() {
            warn!(worker, "Failure sink is gone, dropping task failure");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic payload");
    }
}
