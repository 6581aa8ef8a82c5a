//! Protocol message types for daemon communication.
//!
//! Every message is one JSON object on one line. Client messages carry the
//! protocol version next to a `type`-tagged payload.

use chrono::{DateTime, Utc};
use hit_core::{Count, CounterKey, IconEntry};
use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake, must be the first message on a connection
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Record one visit for `key`
    Hit {
        key: CounterKey,
        /// Visitor identity used to scope rate limiting (e.g. client IP)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visitor: Option<String>,
    },

    /// Render the badge for `key`
    Badge {
        key: CounterKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },

    /// List available icons
    Icons,

    /// Start receiving live count updates
    Subscribe,

    /// Stop receiving live count updates
    Unsubscribe,

    Ping {
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn hit(key: CounterKey) -> Self {
        Self::new(MessageType::Hit { key, visitor: None })
    }

    pub fn hit_from(key: CounterKey, visitor: impl Into<String>) -> Self {
        Self::new(MessageType::Hit {
            key,
            visitor: Some(visitor.into()),
        })
    }

    pub fn badge(key: CounterKey, icon: Option<String>) -> Self {
        Self::new(MessageType::Badge { key, icon })
    }

    pub fn icons() -> Self {
        Self::new(MessageType::Icons)
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn unsubscribe() -> Self {
        Self::new(MessageType::Unsubscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Visit recorded
    Counted { key: CounterKey, count: Count },

    /// Visit refused by the rate limiter; nothing was recorded
    Denied { key: CounterKey },

    /// Rendered badge
    Badge {
        key: CounterKey,
        count: Count,
        svg: String,
    },

    Icons { icons: Vec<IconEntry> },

    Subscribed,

    Unsubscribed,

    /// Live update pushed to every subscriber
    CountUpdated {
        key: CounterKey,
        count: Count,
        at: DateTime<Utc>,
    },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn counted(key: CounterKey, count: Count) -> Self {
        Self::Counted { key, count }
    }

    pub fn denied(key: CounterKey) -> Self {
        Self::Denied { key }
    }

    pub fn badge(key: CounterKey, count: Count, svg: String) -> Self {
        Self::Badge { key, count, svg }
    }

    pub fn icons(icons: Vec<IconEntry>) -> Self {
        Self::Icons { icons }
    }

    /// Creates a live count update stamped with the current time.
    pub fn count_updated(key: CounterKey, count: Count) -> Self {
        Self::CountUpdated {
            key,
            count,
            at: Utc::now(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// Serializes the message as a single protocol line (without the newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
