//! Breaker error sink.
//!
//! Per-connection failures and rejected broadcasts never reach broadcast
//! callers. Besides being logged they are handed to an [`ErrorSink`], so the
//! daemon can funnel them to the same place as keeper task failures.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use super::{BreakerError, ConnectionError, ConnectionId};
use crate::keeper::LogSink;

/// A failure inside the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerFailure {
    /// A connection was dropped: oversized frame, I/O error, write timeout
    /// or full outbox.
    Connection {
        id: ConnectionId,
        error: ConnectionError,
    },

    /// A broadcast was rejected.
    Broadcast(BreakerError),
}

impl fmt::Display for BreakerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { id, error } => write!(f, "{id}: {error}"),
            Self::Broadcast(error) => write!(f, "broadcast: {error}"),
        }
    }
}

/// Receives every [`BreakerFailure`].
///
/// Called inline from the dispatcher and connection tasks, so
/// implementations must not block. Panics are contained.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, failure: &BreakerFailure);
}

impl<F> ErrorSink for F
where
    F: Fn(&BreakerFailure) + Send + Sync + 'static,
{
    fn report(&self, failure: &BreakerFailure) {
        self(failure)
    }
}

impl ErrorSink for LogSink {
    fn report(&self, failure: &BreakerFailure) {
        warn!(failure = %failure, "Breaker failure");
    }
}

pub(super) fn report(sink: &dyn ErrorSink, failure: BreakerFailure) {
    if catch_unwind(AssertUnwindSafe(|| sink.report(&failure))).is_err() {
        error!(failure = %failure, "Breaker error sink panicked while reporting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_failure_display() {
        let failure = BreakerFailure::Connection {
            id: ConnectionId::new(4),
            error: ConnectionError::WriteTimeout,
        };
        assert_eq!(failure.to_string(), "conn-4: write timeout");

        let failure = BreakerFailure::Broadcast(BreakerError::PoolExhausted { max: 2 });
        assert_eq!(failure.to_string(), "broadcast: message pool exhausted (max: 2)");
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sink = move |_: &BreakerFailure| {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("sink exploded");
        };

        report(&sink, BreakerFailure::Broadcast(BreakerError::Closed));
        report(&sink, BreakerFailure::Broadcast(BreakerError::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        LogSink.report(&BreakerFailure::Broadcast(BreakerError::Closed));
    }
}
