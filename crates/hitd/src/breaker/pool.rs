//! Message pool and dispatcher.
//!
//! The pool is a bounded channel of envelopes drained by a single
//! dispatcher task. The dispatcher copies each payload into the outbox of
//! every connection that was registered when the payload was broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sink::{report, BreakerFailure, ErrorSink};
use super::{ConnectionError, ConnectionId, Message};

/// A broadcast payload waiting in the pool.
#[derive(Debug)]
pub(super) struct Envelope {
    /// Position in broadcast order
    pub(super) seq: u64,
    pub(super) payload: Message,
}

/// Registry entry for a live connection.
pub(super) struct Registered {
    pub(super) outbox: mpsc::Sender<Message>,
    pub(super) token: CancellationToken,

    /// First broadcast sequence number this connection may receive
    pub(super) first_seq: u64,
}

/// Shared map of registered connections.
pub(super) type Registry = Arc<RwLock<HashMap<ConnectionId, Registered>>>;

/// Drains the message pool into connection outboxes.
///
/// Returned by [`Breaker::new`](super::Breaker::new); run it on its own task
/// (or use [`spawn_breaker`](super::spawn_breaker)). Until it runs, broadcasts
/// accumulate in the pool.
pub struct Dispatcher {
    pool: mpsc::Receiver<Envelope>,
    registry: Registry,
    cancel: CancellationToken,
    sink: Arc<dyn ErrorSink>,
}

impl Dispatcher {
    pub(super) fn new(
        pool: mpsc::Receiver<Envelope>,
        registry: Registry,
        cancel: CancellationToken,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            pool,
            registry,
            cancel,
            sink,
        }
    }

    /// Runs until the breaker is cancelled or every pool sender is gone.
    pub async fn run(mut self) {
        debug!("Dispatcher starting");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Dispatcher shutting down");
                    break;
                }

                envelope = self.pool.recv() => {
                    match envelope {
                        Some(envelope) => deliver(&self.registry, envelope, self.sink.as_ref()).await,
                        None => {
                            debug!("Message pool closed");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Fans one envelope out to every eligible connection.
///
/// Connections whose outbox is full or gone are dropped from the registry
/// and closed; the rest still get the message. Full outboxes are reported
/// to `sink`. A closed outbox means the pump already exited on its own.
async fn deliver(registry: &Registry, envelope: Envelope, sink: &dyn ErrorSink) {
    let conns = registry.read().await;
    let mut failed = Vec::new();

    for (id, conn) in conns.iter() {
        if envelope.seq < conn.first_seq {
            continue;
        }

        match conn.outbox.try_send(Arc::clone(&envelope.payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection = %id, "Viewer outbox full, dropping slow connection");
                failed.push((*id, true));
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %id, "Viewer outbox closed");
                failed.push((*id, false));
            }
        }
    }

    // Need to drop read lock first
    drop(conns);

    if failed.is_empty() {
        return;
    }

    let mut dropped = Vec::new();
    {
        let mut conns = registry.write().await;
        for (id, full) in failed {
            if let Some(conn) = conns.remove(&id) {
                // Already closed connections were reported by whoever closed them
                if full && !conn.token.is_cancelled() {
                    dropped.push(id);
                }
                conn.token.cancel();
                debug!(connection = %id, "Removed failed connection");
            }
        }
    }

    for id in dropped {
        report(
            sink,
            BreakerFailure::Connection {
                id,
                error: ConnectionError::OutboxFull,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn quiet() -> Arc<dyn ErrorSink> {
        Arc::new(|_: &BreakerFailure| {})
    }

    fn collecting() -> (Arc<dyn ErrorSink>, Arc<Mutex<Vec<BreakerFailure>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |failure: &BreakerFailure| {
            sink_seen.lock().unwrap().push(failure.clone());
        };
        (Arc::new(sink), seen)
    }

    fn registered(
        capacity: usize,
        first_seq: u64,
    ) -> (Registered, mpsc::Receiver<Message>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        (
            Registered {
                outbox: tx,
                token: token.clone(),
                first_seq,
            },
            rx,
            token,
        )
    }

    fn envelope(seq: u64, text: &str) -> Envelope {
        Envelope {
            seq,
            payload: Arc::from(text),
        }
    }

    #[tokio::test]
    async fn test_deliver_skips_connections_registered_later() {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (early, mut early_rx, _) = registered(4, 0);
        let (late, mut late_rx, _) = registered(4, 5);
        registry.write().await.insert(ConnectionId::new(1), early);
        registry.write().await.insert(ConnectionId::new(2), late);

        deliver(&registry, envelope(3, "count=3"), quiet().as_ref()).await;

        assert_eq!(early_rx.try_recv().unwrap().as_ref(), "count=3");
        assert!(late_rx.try_recv().is_err());
        assert_eq!(registry.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_deliver_drops_full_outbox_only() {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (slow, _slow_rx, slow_token) = registered(1, 0);
        let (fast, mut fast_rx, fast_token) = registered(4, 0);
        registry.write().await.insert(ConnectionId::new(1), slow);
        registry.write().await.insert(ConnectionId::new(2), fast);

        let (sink, seen) = collecting();
        deliver(&registry, envelope(0, "a"), sink.as_ref()).await;
        deliver(&registry, envelope(1, "b"), sink.as_ref()).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![BreakerFailure::Connection {
                id: ConnectionId::new(1),
                error: ConnectionError::OutboxFull,
            }]
        );

        let conns = registry.read().await;
        assert!(!conns.contains_key(&ConnectionId::new(1)));
        assert!(conns.contains_key(&ConnectionId::new(2)));
        assert!(slow_token.is_cancelled());
        assert!(!fast_token.is_cancelled());

        assert_eq!(fast_rx.try_recv().unwrap().as_ref(), "a");
        assert_eq!(fast_rx.try_recv().unwrap().as_ref(), "b");
    }

    #[tokio::test]
    async fn test_deliver_drops_closed_outbox() {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (gone, gone_rx, _) = registered(4, 0);
        drop(gone_rx);
        registry.write().await.insert(ConnectionId::new(9), gone);

        let (sink, seen) = collecting();
        deliver(&registry, envelope(0, "x"), sink.as_ref()).await;
        assert!(registry.read().await.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            rx,
            Arc::new(RwLock::new(HashMap::new())),
            cancel.clone(),
            quiet(),
        );

        let handle = tokio::spawn(dispatcher.run());
        cancel.cancel();
        handle.await.unwrap();
    }
}
