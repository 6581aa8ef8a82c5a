//! Integration tests for the Unix socket server.
//!
//! These tests run a full `HitServer` over a real socket in a temp
//! directory: handshake, visits, badges, subscriptions and shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hit_core::CounterKey;
use hit_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use hitd::server::HitServer;
use hitd::{Collaborators, FanOut, Handler, HitConfig};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum time to wait for a reply
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to listen before concluding nothing else is coming
const QUIET_PERIOD: Duration = Duration::from_millis(200);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    handler: Arc<Handler>,
    server_task: JoinHandle<()>,
    _temp_dir: TempDir, // Keep alive for RAII cleanup
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(HitConfig::default()).await
    }

    async fn spawn_with(mut config: HitConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");
        config.socket_path = socket_path.clone();

        let handler = Arc::new(
            Handler::new(&config, Collaborators::in_memory(&config))
                .await
                .expect("build handler"),
        );
        let cancel_token = CancellationToken::new();

        let server = HitServer::new(socket_path.clone(), Arc::clone(&handler), cancel_token.clone());

        let server_task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        TestServer {
            socket_path,
            cancel_token,
            handler,
            server_task,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn client(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(None).await;
        client
    }

    /// Connects, handshakes and subscribes.
    async fn subscriber(&self) -> TestClient {
        let mut client = self.client().await;
        client.send(ClientMessage::subscribe()).await;
        assert!(matches!(client.recv().await, DaemonMessage::Subscribed));
        client
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        self.server_task.await.expect("server task");
        self.handler.shutdown().await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("expected a message from the server")
    }

    /// Next message within `wait`, or `None` on timeout or EOF.
    async fn try_recv(&mut self, wait: Duration) -> Option<DaemonMessage> {
        let mut line = String::new();
        match timeout(wait, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => None,
            Ok(Ok(_)) => Some(serde_json::from_str(&line).unwrap()),
        }
    }

    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientMessage::connect(client_id)).await;

        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn hit(&mut self, key: &CounterKey) -> DaemonMessage {
        self.send(ClientMessage::hit(key.clone())).await;
        self.recv().await
    }

    /// Waits for the next `count_updated`, skipping replies.
    async fn next_update(&mut self) -> (CounterKey, u64) {
        loop {
            match self.recv().await {
                DaemonMessage::CountUpdated { key, count, .. } => return (key, count.as_u64()),
                _ => continue,
            }
        }
    }
}

fn key(name: &str) -> CounterKey {
    CounterKey::new(name).unwrap()
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_server_accepts_connection() {
    let server = TestServer::spawn().await;

    let _client = server.connect().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("badge-page".to_string())))
        .await;

    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "badge-page");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(
        client_id.starts_with("client-"),
        "Expected auto-assigned ID starting with 'client-', got: {client_id}"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect { client_id: None },
        })
        .await;

    match client.recv().await {
        DaemonMessage::Rejected { reason, .. } => {
            assert!(
                reason.contains("not compatible"),
                "Expected 'not compatible' in reason, got: {reason}"
            );
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }

    // Server hangs up after rejecting
    assert!(client.try_recv(RECV_TIMEOUT).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_first_message_must_be_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::ping(1)).await;

    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));
    assert!(client.try_recv(RECV_TIMEOUT).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    client.send(ClientMessage::ping(7)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 7 }));

    server.shutdown().await;
}

// ============================================================================
// Visit and Badge Tests
// ============================================================================

#[tokio::test]
async fn test_hits_are_counted() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;
    let page = key("github.com/octo/repo");

    for expected in 1..=3 {
        match client.hit(&page).await {
            DaemonMessage::Counted { key, count } => {
                assert_eq!(key, page);
                assert_eq!(count.as_u64(), expected);
            }
            other => panic!("Expected Counted, got {other:?}"),
        }
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_limiter_denies_over_quota() {
    let mut config = HitConfig::default();
    config.limiter.quota = 2;
    let server = TestServer::spawn_with(config).await;
    let mut client = server.client().await;
    let page = key("limited");

    assert!(matches!(client.hit(&page).await, DaemonMessage::Counted { .. }));
    assert!(matches!(client.hit(&page).await, DaemonMessage::Counted { .. }));
    assert!(matches!(client.hit(&page).await, DaemonMessage::Denied { .. }));

    // A different visitor has its own quota
    client.send(ClientMessage::hit_from(page.clone(), "10.0.0.1")).await;
    match client.recv().await {
        DaemonMessage::Counted { count, .. } => assert_eq!(count.as_u64(), 3),
        other => panic!("Expected Counted, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_badge_reflects_count() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;
    let page = key("docs/intro");

    client.hit(&page).await;
    client.hit(&page).await;

    client.send(ClientMessage::badge(page.clone(), Some("github".to_string()))).await;
    match client.recv().await {
        DaemonMessage::Badge { key, count, svg } => {
            assert_eq!(key, page);
            assert_eq!(count.as_u64(), 2);
            assert!(svg.starts_with("<svg"));
            assert!(svg.contains('2'));
        }
        other => panic!("Expected Badge, got {other:?}"),
    }

    // Unknown icons still render
    client.send(ClientMessage::badge(page, Some("nope".to_string()))).await;
    assert!(matches!(client.recv().await, DaemonMessage::Badge { .. }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_icons_listing() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    client.send(ClientMessage::icons()).await;
    match client.recv().await {
        DaemonMessage::Icons { icons } => {
            assert!(!icons.is_empty());
            assert!(icons.windows(2).all(|w| w[0].name < w[1].name));
            for icon in &icons {
                assert_eq!(icon.url, format!("/icon/{}", icon.name));
            }
        }
        other => panic!("Expected Icons, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Subscription Tests
// ============================================================================

#[tokio::test]
async fn test_three_subscribers_each_get_one_update() {
    for fan_out in [FanOut::Direct, FanOut::Deferred] {
        let config = HitConfig {
            fan_out,
            ..HitConfig::default()
        };
        let server = TestServer::spawn_with(config).await;

        let mut viewers = vec![
            server.subscriber().await,
            server.subscriber().await,
            server.subscriber().await,
        ];
        assert_eq!(server.handler.breaker().connection_count().await, 3);

        let mut visitor = server.client().await;
        let page = key("count-page");
        visitor.hit(&page).await;

        for viewer in viewers.iter_mut() {
            match viewer.recv().await {
                DaemonMessage::CountUpdated { key, count, .. } => {
                    assert_eq!(key, page);
                    assert_eq!(count.as_u64(), 1);
                }
                other => panic!("Expected CountUpdated, got {other:?}"),
            }
            assert!(viewer.try_recv(QUIET_PERIOD).await.is_none());
        }

        // The visitor never subscribed
        assert!(visitor.try_recv(QUIET_PERIOD).await.is_none());

        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_updates_arrive_in_order() {
    let mut config = HitConfig::default();
    config.fan_out = FanOut::Direct;
    let server = TestServer::spawn_with(config).await;

    let mut viewer = server.subscriber().await;
    let mut visitor = server.client().await;
    let page = key("ordered");

    for _ in 0..10 {
        visitor.hit(&page).await;
    }

    for expected in 1..=10 {
        assert_eq!(viewer.next_update().await, (page.clone(), expected));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_updates() {
    let server = TestServer::spawn().await;
    let mut viewer = server.subscriber().await;

    viewer.send(ClientMessage::unsubscribe()).await;
    assert!(matches!(viewer.recv().await, DaemonMessage::Unsubscribed));
    assert_eq!(server.handler.breaker().connection_count().await, 0);

    let mut visitor = server.client().await;
    visitor.hit(&key("quiet")).await;

    assert!(viewer.try_recv(QUIET_PERIOD).await.is_none());

    // Still connected for requests
    viewer.send(ClientMessage::ping(3)).await;
    assert!(matches!(viewer.recv().await, DaemonMessage::Pong { seq: 3 }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_unregisters_subscriber() {
    let server = TestServer::spawn().await;
    let mut viewer = server.subscriber().await;
    assert_eq!(server.handler.breaker().connection_count().await, 1);

    viewer.send(ClientMessage::disconnect()).await;
    assert!(viewer.try_recv(RECV_TIMEOUT).await.is_none());

    assert_eq!(server.handler.breaker().connection_count().await, 0);

    server.shutdown().await;
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_removes_socket_and_closes_clients() {
    let server = TestServer::spawn().await;
    let socket_path = server.socket_path.clone();
    let mut viewer = server.subscriber().await;

    server.shutdown().await;

    assert!(!socket_path.exists());
    assert!(viewer.try_recv(RECV_TIMEOUT).await.is_none());
}
