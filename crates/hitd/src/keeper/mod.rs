//! Task keeper: bounded queue plus a fixed worker pool.
//!
//! The keeper runs fire-and-forget side-effect work (fan-out, retries, error
//! escalation) off the request path. Submitting never blocks: work is either
//! accepted immediately or rejected with `QueueFull`.
//!
//! # Architecture
//!
//! ```text
//!  submit(task)                 ┌──────────┐
//!  ──────────────▶ [ permits ]──│  queue   │──▶ worker 1 ─┐
//!   QueueFull ◀─── (capacity)   │  (FIFO)  │──▶ worker 2 ─┼──▶ failures ──▶ sink task
//!                               └──────────┘──▶ worker N ─┘    (mpsc)
//! ```
//!
//! # Capacity
//!
//! A task holds one of `queue_capacity` slots from the moment it is accepted
//! until its worker is done with it (completed, failed or timed out). Queued
//! plus running tasks therefore never exceed the capacity, and the
//! `(capacity + 1)`th outstanding submission fails with `QueueFull`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Task panics are caught by the worker and reported as failures
//! - Poisoned locks are recovered

mod sink;
mod task;
mod worker;

pub use sink::{FailureSink, LogSink};
pub use task::{BoxError, KeeperError, Task, TaskError, TaskFailure};

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use worker::{run_worker, Accepted};

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default worker count
pub const DEFAULT_WORKERS: usize = 5;

/// Default per-task timeout
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(20);

/// Keeper configuration. Immutable once the keeper is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Maximum accepted-but-unfinished tasks
    pub queue_capacity: usize,

    /// Number of workers (maximum concurrent executions)
    pub workers: usize,

    #[serde(rename = "task_timeout_ms", with = "crate::config::millis")]
    pub task_timeout: Duration,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

impl KeeperConfig {
    pub fn validate(&self) -> Result<(), KeeperError> {
        if self.queue_capacity == 0 {
            return Err(KeeperError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(KeeperError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(KeeperError::InvalidConfig(
                "task_timeout must be greater than zero".to_string(),
            ));
        }
        // Semaphore permits are capped
        if self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(KeeperError::InvalidConfig(format!(
                "queue_capacity must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Handle to a running keeper.
///
/// Cheap to clone; all clones share the same queue and workers.
#[derive(Clone)]
pub struct Keeper {
    inner: Arc<Inner>,
}

struct Inner {
    config: KeeperConfig,

    /// `None` once shutdown has begun
    sender: StdMutex<Option<mpsc::Sender<Accepted>>>,

    /// One permit per outstanding task
    slots: Arc<Semaphore>,

    workers: Mutex<Vec<JoinHandle<()>>>,
    sink: Mutex<Option<JoinHandle<()>>>,
}

/// Spawns the keeper's workers and failure sink task.
///
/// # Errors
///
/// `KeeperError::InvalidConfig` if any bound is zero.
pub fn spawn_keeper(config: KeeperConfig, sink: Arc<dyn FailureSink>) -> Result<Keeper, KeeperError> {
    config.validate()?;

    let (sender, receiver) = mpsc::channel(config.queue_capacity);
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    let queue = Arc::new(Mutex::new(receiver));

    let workers = (0..config.workers)
        .map(|worker| {
            tokio::spawn(run_worker(
                worker,
                Arc::clone(&queue),
                config.task_timeout,
                failure_tx.clone(),
            ))
        })
        .collect();

    // Workers hold the only failure senders now
    drop(failure_tx);
    let sink_handle = sink::spawn_sink(sink, failure_rx);

    info!(
        queue_capacity = config.queue_capacity,
        workers = config.workers,
        task_timeout_ms = config.task_timeout.as_millis() as u64,
        "Keeper started"
    );

    Ok(Keeper {
        inner: Arc::new(Inner {
            slots: Arc::new(Semaphore::new(config.queue_capacity)),
            config,
            sender: StdMutex::new(Some(sender)),
            workers: Mutex::new(workers),
            sink: Mutex::new(Some(sink_handle)),
        }),
    })
}

impl Keeper {
    /// Accepts `task` for execution, or fails immediately.
    ///
    /// Never waits for queue space or for the task to run. Execution
    /// failures go to the failure sink, not to the caller.
    ///
    /// # Errors
    ///
    /// - `KeeperError::QueueFull` if `queue_capacity` tasks are outstanding
    /// - `KeeperError::Closed` once shutdown has begun
    pub fn submit(&self, mut task: Task) -> Result<(), KeeperError> {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(sender) = sender.as_ref() else {
            return Err(KeeperError::Closed);
        };

        let permit = match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                debug!(task = %task.name(), "Keeper queue full, rejecting task");
                return Err(KeeperError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                });
            }
            Err(TryAcquireError::Closed) => return Err(KeeperError::Closed),
        };

        task.stamp();

        sender
            .try_send(Accepted { task, permit })
            .map_err(|e| match e {
                TrySendError::Full(_) => KeeperError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                },
                TrySendError::Closed(_) => KeeperError::Closed,
            })
    }

    /// Number of accepted tasks that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.inner
            .config
            .queue_capacity
            .saturating_sub(self.inner.slots.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.queue_capacity
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops admitting work and waits for the pipeline to drain.
    ///
    /// Tasks accepted before this call still run (or time out). Returns once
    /// every worker and the failure sink have exited, for every caller:
    /// concurrent calls wait for the one doing the draining.
    pub async fn shutdown(&self) {
        // Held until the drain is complete so later callers queue up here
        let mut workers = self.inner.workers.lock().await;

        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if sender.is_none() && workers.is_empty() {
            debug!("Keeper already shut down");
            return;
        }

        // Dropping the only sender lets workers drain the queue and exit
        drop(sender);

        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Keeper worker ended abnormally");
            }
        }

        let sink = self.inner.sink.lock().await.take();
        if let Some(handle) = sink {
            if let Err(e) = handle.await {
                warn!(error = %e, "Failure sink ended abnormally");
            }
        }

        self.inner.slots.close();
        info!("Keeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    type Failures = Arc<StdMutex<Vec<TaskFailure>>>;

    fn collecting_sink() -> (Arc<dyn FailureSink>, Failures) {
        let failures: Failures = Arc::new(StdMutex::new(Vec::new()));
        let store = Arc::clone(&failures);
        let sink: Arc<dyn FailureSink> = Arc::new(move |f: &TaskFailure| {
            store.lock().unwrap().push(f.clone());
        });
        (sink, failures)
    }

    fn config(queue_capacity: usize, workers: usize, task_timeout: Duration) -> KeeperConfig {
        KeeperConfig {
            queue_capacity,
            workers,
            task_timeout,
        }
    }

    #[test]
    fn test_default_config() {
        let config = KeeperConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.workers, 5);
        assert_eq!(config.task_timeout, Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero_capacity = config(0, 1, Duration::from_secs(1));
        assert!(matches!(
            zero_capacity.validate(),
            Err(KeeperError::InvalidConfig(_))
        ));

        let zero_workers = config(1, 0, Duration::from_secs(1));
        assert!(zero_workers.validate().is_err());

        let zero_timeout = config(1, 1, Duration::ZERO);
        assert!(zero_timeout.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_two_single_worker_rejects_third() {
        let (sink, failures) = collecting_sink();
        let keeper = spawn_keeper(config(2, 1, Duration::from_secs(20)), sink).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = Arc::clone(&log);
        keeper
            .submit(Task::infallible("one", async move {
                first.lock().unwrap().push("one:start");
                sleep(Duration::from_secs(1)).await;
                first.lock().unwrap().push("one:end");
            }))
            .unwrap();

        let second = Arc::clone(&log);
        keeper
            .submit(Task::infallible("two", async move {
                second.lock().unwrap().push("two:start");
                second.lock().unwrap().push("two:end");
            }))
            .unwrap();

        let third = keeper.submit(Task::infallible("three", async {}));
        assert_eq!(third, Err(KeeperError::QueueFull { capacity: 2 }));
        assert_eq!(keeper.outstanding(), 2);

        keeper.shutdown().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["one:start", "one:end", "two:start", "two:end"]
        );
        assert!(failures.lock().unwrap().is_empty());
        assert_eq!(keeper.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounded_by_workers() {
        let (sink, _failures) = collecting_sink();
        let keeper = spawn_keeper(config(50, 3, Duration::from_secs(20)), sink).unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            keeper
                .submit(Task::infallible(format!("burst-{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        keeper.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported_exactly_once() {
        let (sink, failures) = collecting_sink();
        let keeper = spawn_keeper(config(10, 1, Duration::from_millis(100)), sink).unwrap();

        keeper
            .submit(Task::infallible("slow", async {
                sleep(Duration::from_secs(5)).await;
            }))
            .unwrap();
        keeper
            .submit(Task::infallible("fast", async {}))
            .unwrap();

        keeper.shutdown().await;

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task, "slow");
        assert_eq!(
            failures[0].error,
            TaskError::Timeout {
                timeout: Duration::from_millis(100)
            }
        );
        assert!(failures[0].is_timeout());
    }

    #[tokio::test]
    async fn test_error_and_panic_reported_to_sink() {
        let (sink, failures) = collecting_sink();
        let keeper = spawn_keeper(config(10, 2, Duration::from_secs(5)), sink).unwrap();

        keeper
            .submit(Task::new("broken", async {
                Err::<(), BoxError>("redis unavailable".into())
            }))
            .unwrap();
        keeper
            .submit(Task::infallible("exploding", async {
                panic!("kaboom");
            }))
            .unwrap();
        keeper
            .submit(Task::infallible("fine", async {}))
            .unwrap();

        keeper.shutdown().await;

        let mut failures = failures.lock().unwrap().clone();
        failures.sort_by(|a, b| a.task.cmp(&b.task));

        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].task, "broken");
        assert_eq!(
            failures[0].error,
            TaskError::Failed("redis unavailable".to_string())
        );
        assert_eq!(failures[1].task, "exploding");
        assert_eq!(failures[1].error, TaskError::Panicked("kaboom".to_string()));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let (sink, _failures) = collecting_sink();
        let keeper = spawn_keeper(KeeperConfig::default(), sink).unwrap();

        keeper.shutdown().await;
        assert!(keeper.is_closed());

        let result = keeper.submit(Task::infallible("late", async {}));
        assert_eq!(result, Err(KeeperError::Closed));

        // Second shutdown is a no-op
        keeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdown_waits_for_drain() {
        let (sink, _failures) = collecting_sink();
        let keeper = spawn_keeper(config(10, 1, Duration::from_secs(20)), sink).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let finished = Arc::clone(&done);
        keeper
            .submit(Task::infallible("slow", async move {
                sleep(Duration::from_secs(1)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let callers: Vec<_> = (0..2)
            .map(|_| {
                let keeper = keeper.clone();
                let done = Arc::clone(&done);
                tokio::spawn(async move {
                    keeper.shutdown().await;
                    done.load(Ordering::SeqCst)
                })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), 1, "shutdown returned before the drain");
        }
        assert!(keeper.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_tasks_finish_during_shutdown() {
        let (sink, _failures) = collecting_sink();
        let keeper = spawn_keeper(config(10, 1, Duration::from_secs(20)), sink).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let done = Arc::clone(&done);
            keeper
                .submit(Task::infallible(format!("pending-{i}"), async move {
                    sleep(Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        keeper.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_frees_after_completion() {
        let (sink, _failures) = collecting_sink();
        let keeper = spawn_keeper(config(1, 1, Duration::from_secs(20)), sink).unwrap();

        keeper.submit(Task::infallible("a", async {})).unwrap();
        assert!(matches!(
            keeper.submit(Task::infallible("b", async {})),
            Err(KeeperError::QueueFull { .. })
        ));

        // Let the worker finish the first task
        sleep(Duration::from_millis(10)).await;
        assert_eq!(keeper.outstanding(), 0);
        assert!(keeper.submit(Task::infallible("c", async {})).is_ok());

        keeper.shutdown().await;
    }
}
