//! Signaling server harness for end-to-end tests.
//!
//! Runs the real signaling stack (router, registry, room actors, handshake
//! engine) on `127.0.0.1:0` with a [`MockMediaServer`] in place of Kurento.

use crate::client::SignalingTestClient;
use crate::fixtures::test_overlay;

use anyhow::Result;
use broadcast_controller::actors::{ActorMetrics, RoomRegistryHandle};
use broadcast_controller::backend::mock::MockMediaServer;
use broadcast_controller::backend::BackendHandle;
use broadcast_controller::handshake::HandshakeEngine;
use broadcast_controller::signaling::registry::ConnectionRegistry;
use broadcast_controller::signaling::{self, SignalingState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// WebSocket path served by the harness.
pub const TEST_WS_PATH: &str = "/one2many";

/// Media server URI handed to the backend; the mock ignores it.
pub const TEST_MEDIA_SERVER_URI: &str = "ws://mock-media-server:8888/kurento";

/// Default per-message limit used by the harness.
pub const TEST_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Rooms one test connection may touch.
pub const TEST_MAX_ROOMS_PER_CONNECTION: usize = 16;

/// A running signaling server.
pub struct TestBroadcastServer {
    media: MockMediaServer,
    backend: Arc<BackendHandle>,
    registry: RoomRegistryHandle,
    connections: Arc<ConnectionRegistry>,
    metrics: Arc<ActorMetrics>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestBroadcastServer {
    /// Start a server with default limits.
    pub async fn start() -> Result<Self> {
        Self::start_with_limit(TEST_MAX_MESSAGE_BYTES).await
    }

    /// Start a server whose signaling messages are limited to `max_message_bytes`.
    pub async fn start_with_limit(max_message_bytes: usize) -> Result<Self> {
        let media = MockMediaServer::new();
        let backend = Arc::new(BackendHandle::new(
            Arc::new(media.clone()),
            TEST_MEDIA_SERVER_URI,
        ));
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&backend), Arc::clone(&metrics));
        let engine = HandshakeEngine::new(registry.clone(), Arc::clone(&backend), test_overlay());
        let connections = ConnectionRegistry::new(Arc::clone(&metrics));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = SignalingState::new(
            engine,
            Arc::clone(&connections),
            max_message_bytes,
            TEST_MAX_ROOMS_PER_CONNECTION,
        );
        let app = signaling::signaling_router(state, TEST_WS_PATH);
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let _ = signaling::serve(listener, app, server_shutdown).await;
        });

        Ok(Self {
            media,
            backend,
            registry,
            connections,
            metrics,
            addr,
            shutdown,
            task,
        })
    }

    /// The in-memory media server behind this instance.
    #[must_use]
    pub fn media(&self) -> &MockMediaServer {
        &self.media
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<BackendHandle> {
        &self.backend
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, TEST_WS_PATH)
    }

    /// Open a new signaling connection.
    pub async fn connect(&self) -> Result<SignalingTestClient> {
        SignalingTestClient::connect(&self.ws_url()).await
    }

    /// Poll until `check` holds or five seconds pass.
    pub async fn wait_until(&self, mut check: impl FnMut(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        check(self)
    }
}

impl Drop for TestBroadcastServer {
    fn drop(&mut self) {
        self.connections.close_all();
        self.shutdown.cancel();
        self.registry.cancel();
        self.task.abort();
    }
}
