//! WebSocket connection handler for individual clients.

use super::protocol::ServerMessage;
use super::registry::ConnectionGuard;
use super::router::MessageRouter;
use super::SignalingState;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bounded outbound queue per client. Senders wait when it is full.
const OUTBOUND_CAPACITY: usize = 64;

/// Serve one client until it disconnects or the server shuts down.
///
/// Closing (cleanly or not) stops the session in every room it referenced.
pub async fn handle_connection(socket: WebSocket, state: SignalingState, guard: ConnectionGuard) {
    let session_id = guard.session_id().to_string();
    info!(
        target: "bc.signaling",
        session_id = %session_id,
        "Connection opened"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "bc.signaling",
                        session_id = %writer_session,
                        error = %e,
                        "Failed to serialize outbound message"
                    );
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(
            target: "bc.signaling",
            session_id = %writer_session,
            "Writer finished"
        );
    });

    let mut router = MessageRouter::new(
        state.engine().clone(),
        session_id.clone(),
        outbound,
        state.max_message_bytes(),
        state.max_rooms_per_connection(),
    );
    let cancel_token = guard.cancel_token().clone();

    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(
                    target: "bc.signaling",
                    session_id = %session_id,
                    "Closing connection for shutdown"
                );
                break;
            }
            frame = ws_receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => router.handle_text(&text).await,
            Some(Ok(Message::Binary(data))) => router.handle_binary(data.len()).await,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(
                    target: "bc.signaling",
                    session_id = %session_id,
                    error = %e,
                    "Transport error"
                );
                break;
            }
        }
    }

    router.close().await;
    writer.abort();
    drop(guard);

    info!(
        target: "bc.signaling",
        session_id = %session_id,
        "Connection closed"
    );
}
