use super::ConnectionId;

/// Errors returned by breaker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    /// The message pool is full; the broadcast was rejected, nothing evicted.
    #[error("message pool exhausted (max: {max})")]
    PoolExhausted { max: usize },

    /// The breaker has been shut down.
    #[error("breaker is closed")]
    Closed,

    /// Registration of a connection that has already closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("invalid breaker configuration: {0}")]
    InvalidConfig(String),
}

/// Errors on a single viewer connection. None of these affect other
/// connections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Inbound frame over the read limit. The connection has been closed
    /// and unregistered.
    #[error("frame exceeds maximum size of {max} bytes")]
    Violation { max: usize },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("write timeout")]
    WriteTimeout,

    /// The outbox filled up before the pump could drain it.
    #[error("outbox full, viewer too slow")]
    OutboxFull,

    /// The connection was closed locally (violation, slow consumer, shutdown).
    #[error("connection closed")]
    Closed,

    /// The peer closed its end.
    #[error("end of stream")]
    Eof,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_error_display() {
        assert_eq!(
            BreakerError::PoolExhausted { max: 500 }.to_string(),
            "message pool exhausted (max: 500)"
        );
        assert_eq!(
            BreakerError::ConnectionClosed(ConnectionId::new(3)).to_string(),
            "connection conn-3 is closed"
        );
    }

    #[test]
    fn test_violation_display() {
        let err = ConnectionError::Violation { max: 1024 };
        assert!(err.to_string().contains("1024"));
        assert_eq!(
            ConnectionError::OutboxFull.to_string(),
            "outbox full, viewer too slow"
        );
    }
}
