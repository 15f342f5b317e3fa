//! Broadcast Controller
//!
//! WebSocket signaling server for one-presenter, many-viewer WebRTC rooms.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:8443, path `/one2many`)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (text or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Start health HTTP server
//! 5. Initialize media server handle (connects lazily) and room registry
//! 6. Start signaling server and mark ready
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broadcast_controller::actors::{ActorMetrics, RoomRegistryHandle};
use broadcast_controller::backend::kurento::KurentoConnector;
use broadcast_controller::backend::BackendHandle;
use broadcast_controller::config::{Config, LogFormat};
use broadcast_controller::handshake::HandshakeEngine;
use broadcast_controller::observability::{health_router, init_metrics_recorder, HealthState};
use broadcast_controller::signaling::registry::ConnectionRegistry;
use broadcast_controller::signaling::{self, SignalingState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long room actors get to release media server resources on shutdown.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration comes first so the log format can be honored.
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "broadcast_controller=debug,tower_http=debug".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting Broadcast Controller");
    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        ws_path = %config.ws_path,
        media_server_uri = %config.media_server_uri,
        backend_timeout_ms = config.backend_timeout.as_millis(),
        max_message_bytes = config.max_message_bytes,
        max_queued_candidates = config.max_queued_candidates,
        max_rooms_per_connection = config.max_rooms_per_connection,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Health server (MUST succeed)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Media server connection is opened by the first handshake.
    let backend = Arc::new(BackendHandle::new(
        Arc::new(KurentoConnector::new(config.backend_timeout)),
        config.media_server_uri.clone(),
    ));

    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::with_candidate_limit(
        Arc::clone(&backend),
        Arc::clone(&actor_metrics),
        config.max_queued_candidates,
    );
    let engine = HandshakeEngine::new(
        registry.clone(),
        Arc::clone(&backend),
        config.overlay.clone(),
    );
    let connections = ConnectionRegistry::new(Arc::clone(&actor_metrics));
    info!("Actor system initialized");

    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let state = SignalingState::new(
        engine,
        Arc::clone(&connections),
        config.max_message_bytes,
        config.max_rooms_per_connection,
    );
    let app = signaling::signaling_router(state, &config.ws_path);
    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        if let Err(e) = signaling::serve(signaling_listener, app, signaling_shutdown_token).await
        {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!(
        addr = %signaling_addr,
        ws_path = %config.ws_path,
        "Broadcast Controller running - press Ctrl+C to shutdown"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    // Close every signaling connection; each stops its sessions on the way out.
    connections.close_all();
    shutdown_token.cancel();
    if tokio::time::timeout(Duration::from_secs(5), signaling_task)
        .await
        .is_err()
    {
        warn!("Signaling server did not stop in time");
    }

    if let Err(e) = registry.shutdown(ROOM_SHUTDOWN_TIMEOUT).await {
        warn!(error = %e, "Room registry shutdown error");
    }

    backend.close().await;
    let _ = health_task.await;

    info!("Broadcast Controller shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
