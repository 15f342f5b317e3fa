//! WebSocket signaling server.
//!
//! One route (`BC_WS_PATH`, default `/one2many`) upgrades to a WebSocket.
//! Each connection gets a session id, a bounded outbound queue drained by a
//! writer task, and a [`router::MessageRouter`] for its inbound frames.

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod router;

use crate::handshake::HandshakeEngine;
use registry::ConnectionRegistry;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Frames up to this multiple of the message limit are read and answered with
/// an error; larger ones fail the connection at the transport.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// Shared signaling server state.
#[derive(Clone)]
pub struct SignalingState {
    engine: HandshakeEngine,
    connections: Arc<ConnectionRegistry>,
    max_message_bytes: usize,
    max_rooms_per_connection: usize,
}

impl SignalingState {
    #[must_use]
    pub fn new(
        engine: HandshakeEngine,
        connections: Arc<ConnectionRegistry>,
        max_message_bytes: usize,
        max_rooms_per_connection: usize,
    ) -> Self {
        Self {
            engine,
            connections,
            max_message_bytes,
            max_rooms_per_connection,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &HandshakeEngine {
        &self.engine
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    #[must_use]
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    #[must_use]
    pub fn max_rooms_per_connection(&self) -> usize {
        self.max_rooms_per_connection
    }
}

/// Build the signaling router with the WebSocket endpoint at `ws_path`.
pub fn signaling_router(state: SignalingState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!(target: "bc.signaling", "Signaling server shutting down");
        })
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    let Some(guard) = state.connections.register() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    };

    ws.max_message_size(
        state
            .max_message_bytes
            .saturating_mul(TRANSPORT_LIMIT_FACTOR),
    )
    .on_failed_upgrade(|error| {
        warn!(target: "bc.signaling", error = %error, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| connection::handle_connection(socket, state, guard))
}
