//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes requests to the [`Handler`]
//! - Registers the connection with the breaker on `subscribe`
//!
//! Every connection is a breaker connection, so the inbound frame limit
//! applies to all clients, subscribed or not.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hit_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use crate::breaker::{ConnectionError, ViewerConnection};
use crate::handler::{Handler, VisitOutcome};

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection handler for a single client.
pub struct ConnectionHandler<R> {
    conn: ViewerConnection<R>,
    handler: Arc<Handler>,

    /// Assigned after handshake
    client_id: Option<String>,

    subscribed: bool,
    connection_number: u64,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(conn: ViewerConnection<R>, handler: Arc<Handler>, connection_number: u64) -> Self {
        Self {
            conn,
            handler,
            client_id: None,
            subscribed: false,
            connection_number,
        }
    }

    /// Runs the connection to completion.
    ///
    /// Returns the client id if the handshake succeeded.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            self.conn.finish().await;
            return None;
        }

        info!(client_id = ?self.client_id, "Client handshake completed");

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        let client_id = self.client_id.take();
        self.conn.finish().await;

        info!(client_id = ?client_id, "Client disconnected");
        client_id
    }

    /// Expects `connect` with a compatible protocol version.
    async fn handle_handshake(&mut self) -> Result<(), ClientError> {
        let msg = match self.read_message().await {
            Ok(msg) => msg,
            Err(ClientError::Parse(e)) => {
                self.send_message(DaemonMessage::error_with_code(
                    &format!("Parse error: {e}"),
                    "parse_error",
                ))
                .await?;
                return Err(ClientError::Parse(e));
            }
            Err(e) => return Err(e),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ClientError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));

                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id)).await?;
                Ok(())
            }
            other => {
                self.send_message(DaemonMessage::error("Expected Connect message for handshake"))
                    .await?;

                Err(ClientError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and handles messages until the client leaves or the connection
    /// fails.
    async fn process_messages(&mut self) -> Result<(), ClientError> {
        loop {
            let msg = match self.next_request().await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ClientError::Connection(ConnectionError::Eof))) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ClientError::Parse(e))) => {
                    // Malformed requests are answered, not fatal
                    debug!(client_id = ?self.client_id, error = %e, "Malformed message");
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Parse error: {e}"),
                        "parse_error",
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ClientError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(ClientError::Connection(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(client_id = ?self.client_id, error = %e, "Error handling message");
                    self.send_message(DaemonMessage::error(&e.to_string())).await?;
                }
            }
        }
    }

    /// Handles one request. Returns `false` when the client asked to leave.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<bool, ClientError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected")).await?;
            }

            MessageType::Hit { key, visitor } => {
                let outcome = match visitor.as_deref() {
                    Some(visitor) => self.handler.record_visit_from(&key, visitor).await,
                    None => self.handler.record_visit(&key).await,
                }
                .map_err(|e| ClientError::Handler(e.to_string()))?;

                let reply = match outcome {
                    VisitOutcome::Counted(count) => DaemonMessage::counted(key, count),
                    VisitOutcome::Denied => DaemonMessage::denied(key),
                };
                self.send_message(reply).await?;
            }

            MessageType::Badge { key, icon } => {
                let badge = self
                    .handler
                    .render_badge(&key, icon.as_deref())
                    .await
                    .map_err(|e| ClientError::Handler(e.to_string()))?;

                let svg = badge.svg();
                self.send_message(DaemonMessage::badge(badge.key, badge.count, svg))
                    .await?;
            }

            MessageType::Icons => {
                let icons = self.handler.icons().to_vec();
                self.send_message(DaemonMessage::icons(icons)).await?;
            }

            MessageType::Subscribe => {
                self.handler
                    .breaker()
                    .register(&self.conn)
                    .await
                    .map_err(|e| ClientError::Handler(e.to_string()))?;
                self.subscribed = true;

                debug!(client_id = ?self.client_id, "Client subscribed to updates");
                self.send_message(DaemonMessage::Subscribed).await?;
            }

            MessageType::Unsubscribe => {
                self.handler.breaker().unregister(self.conn.id()).await;
                self.subscribed = false;

                debug!(client_id = ?self.client_id, "Client unsubscribed from updates");
                self.send_message(DaemonMessage::Unsubscribed).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Reads the next request under the idle timeout.
    ///
    /// Subscribed viewers may stay silent indefinitely; they are only
    /// dropped by the breaker (write failure, slow outbox) or on EOF.
    async fn next_request(&mut self) -> Result<Result<ClientMessage, ClientError>, Elapsed> {
        if self.subscribed {
            Ok(self.read_message().await)
        } else {
            timeout(READ_TIMEOUT, self.read_message()).await
        }
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ClientError> {
        let line = self.conn.next_frame().await?;

        let msg: ClientMessage =
            serde_json::from_str(&line).map_err(|e| ClientError::Parse(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ClientError> {
        let line = msg.to_line().map_err(|e| ClientError::Parse(e.to_string()))?;
        self.conn.send(line).await?;
        Ok(())
    }

}

/// Errors that end or interrupt a client session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Read timeout")]
    Timeout,

    #[error("Request failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
