//! Broadcast breaker: bounded fan-out to live viewer connections.
//!
//! # Architecture
//!
//! ```text
//!  broadcast(msg) ──try_send──▶ ┌──────────────┐
//!   PoolExhausted ◀──(full)──── │ message pool │  (bounded, never evicts)
//!                               └──────┬───────┘
//!                                      │ Dispatcher (one task)
//!                    ┌─────────────────┼─────────────────┐
//!                    ▼                 ▼                 ▼
//!               [outbox 1]        [outbox 2]        [outbox N]   (bounded)
//!                    │                 │                 │
//!                  pump 1            pump 2            pump N    (write timeout)
//! ```
//!
//! Every buffer between `broadcast` and the socket is bounded. A connection
//! that cannot keep up (full outbox, write error, write timeout) is dropped
//! on its own; delivery to everyone else continues.
//!
//! Inbound frames are limited to `max_read_bytes`. An oversized frame is a
//! protocol violation: the connection is closed and unregistered.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Per-connection failures never reach broadcast callers. They are logged
//!   and handed to the breaker's [`ErrorSink`], as are rejected broadcasts

mod connection;
mod error;
mod pool;
mod sink;

pub use connection::ViewerConnection;
pub use error::{BreakerError, ConnectionError};
pub use pool::Dispatcher;
pub use sink::{BreakerFailure, ErrorSink};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pool::{Envelope, Registered, Registry};

/// Default inbound frame limit (bytes)
pub const DEFAULT_MAX_READ_BYTES: usize = 1024;

/// Default message pool size
pub const DEFAULT_MAX_POOL: usize = 500;

/// Default per-connection outbox size
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

/// Default write timeout (10 seconds)
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A broadcast payload. Shared between all outboxes it is copied into.
pub type Message = Arc<str>;

/// Identifies a connection for the lifetime of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Breaker configuration. Immutable once the breaker is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Largest accepted inbound frame, newline excluded
    pub max_read_bytes: usize,

    /// Largest number of broadcasts awaiting fan-out
    pub max_pool: usize,

    /// Messages buffered per connection before it counts as too slow
    pub outbox_capacity: usize,

    #[serde(rename = "write_timeout_ms", with = "crate::config::millis")]
    pub write_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            max_pool: DEFAULT_MAX_POOL,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), BreakerError> {
        let zero = [
            ("max_read_bytes", self.max_read_bytes),
            ("max_pool", self.max_pool),
            ("outbox_capacity", self.outbox_capacity),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((name, _)) = zero {
            return Err(BreakerError::InvalidConfig(format!(
                "{name} must be at least 1"
            )));
        }
        if self.write_timeout.is_zero() {
            return Err(BreakerError::InvalidConfig(
                "write_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle to a broadcast breaker. Cheap to clone.
#[derive(Clone)]
pub struct Breaker {
    shared: Arc<Shared>,
}

struct Shared {
    config: BreakerConfig,
    registry: Registry,
    pool: mpsc::Sender<Envelope>,

    /// Next broadcast sequence number
    next_seq: AtomicU64,

    next_id: AtomicU64,

    /// Parent of every connection token
    cancel: CancellationToken,

    dispatcher: StdMutex<Option<JoinHandle<()>>>,

    sink: Arc<dyn ErrorSink>,
}

/// Builds a breaker and spawns its dispatcher.
pub fn spawn_breaker(
    config: BreakerConfig,
    sink: Arc<dyn ErrorSink>,
) -> Result<Breaker, BreakerError> {
    let (breaker, dispatcher) = Breaker::new(config, sink)?;
    let handle = tokio::spawn(dispatcher.run());

    *breaker
        .shared
        .dispatcher
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(handle);

    info!(
        max_pool = breaker.shared.config.max_pool,
        max_read_bytes = breaker.shared.config.max_read_bytes,
        "Breaker started"
    );
    Ok(breaker)
}

impl Breaker {
    /// Builds a breaker without starting delivery.
    ///
    /// Broadcasts queue in the pool until the returned [`Dispatcher`] runs.
    /// Failures are reported to `sink`.
    pub fn new(
        config: BreakerConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<(Self, Dispatcher), BreakerError> {
        config.validate()?;

        let (pool, pool_rx) = mpsc::channel(config.max_pool);
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            pool_rx,
            Arc::clone(&registry),
            cancel.clone(),
            Arc::clone(&sink),
        );

        let breaker = Self {
            shared: Arc::new(Shared {
                config,
                registry,
                pool,
                next_seq: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                cancel,
                dispatcher: StdMutex::new(None),
                sink,
            }),
        };

        Ok((breaker, dispatcher))
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.shared.config
    }

    fn registry(&self) -> Registry {
        Arc::clone(&self.shared.registry)
    }

    fn sink(&self) -> Arc<dyn ErrorSink> {
        Arc::clone(&self.shared.sink)
    }

    fn report(&self, failure: BreakerFailure) {
        sink::report(self.shared.sink.as_ref(), failure);
    }

    /// Wraps a split stream as a viewer connection.
    ///
    /// The write half moves to a pump task. The connection is not registered
    /// for broadcasts until [`register`](Self::register) is called.
    pub fn attach<R, W>(&self, reader: R, writer: W) -> ViewerConnection<R>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.shared.cancel.child_token();

        debug!(connection = %id, "Viewer attached");
        ViewerConnection::open(self.clone(), id, reader, writer, token)
    }

    /// Adds `conn` to the live set.
    ///
    /// Registering the same connection again returns the same id and keeps
    /// its original position in broadcast order.
    ///
    /// # Errors
    ///
    /// - `BreakerError::Closed` after shutdown
    /// - `BreakerError::ConnectionClosed` if `conn` is already closed
    pub async fn register<R>(&self, conn: &ViewerConnection<R>) -> Result<ConnectionId, BreakerError>
    where
        R: AsyncRead + Unpin,
    {
        if self.shared.cancel.is_cancelled() {
            return Err(BreakerError::Closed);
        }

        let id = conn.id();
        let Some(outbox) = conn.outbox() else {
            return Err(BreakerError::ConnectionClosed(id));
        };

        let mut conns = self.shared.registry.write().await;

        // Checked under the lock so a closing pump cannot race the insert
        if conn.token().is_cancelled() {
            return Err(BreakerError::ConnectionClosed(id));
        }

        if conns.contains_key(&id) {
            return Ok(id);
        }

        let first_seq = self.shared.next_seq.load(Ordering::SeqCst);
        conns.insert(
            id,
            Registered {
                outbox: outbox.clone(),
                token: conn.token().clone(),
                first_seq,
            },
        );

        debug!(connection = %id, first_seq, "Connection registered");
        Ok(id)
    }

    /// Removes `id` from the live set. Returns whether it was registered.
    ///
    /// The connection itself stays open.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.shared.registry.write().await.remove(&id).is_some();
        if removed {
            debug!(connection = %id, "Connection unregistered");
        }
        removed
    }

    /// Queues `message` for every connection registered right now.
    ///
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// - `BreakerError::PoolExhausted` if `max_pool` messages await fan-out;
    ///   also reported to the error sink
    /// - `BreakerError::Closed` after shutdown
    pub fn broadcast(&self, message: impl Into<Message>) -> Result<(), BreakerError> {
        if self.shared.cancel.is_cancelled() {
            return Err(BreakerError::Closed);
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            seq,
            payload: message.into(),
        };

        self.shared.pool.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => {
                let max = self.shared.config.max_pool;
                debug!(max, "Message pool exhausted");
                self.report(BreakerFailure::Broadcast(BreakerError::PoolExhausted { max }));
                BreakerError::PoolExhausted { max }
            }
            TrySendError::Closed(_) => BreakerError::Closed,
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.registry.read().await.len()
    }

    /// Broadcasts waiting for the dispatcher.
    pub fn pool_len(&self) -> usize {
        self.shared
            .config
            .max_pool
            .saturating_sub(self.shared.pool.capacity())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stops the dispatcher and closes every connection. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();

        {
            let mut conns = self.shared.registry.write().await;
            for (_, conn) in conns.drain() {
                conn.token.cancel();
            }
        }

        let dispatcher = self
            .shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher ended abnormally");
            }
            info!("Breaker stopped");
        }
    }
}
