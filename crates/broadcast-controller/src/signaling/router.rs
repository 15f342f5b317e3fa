//! Per-connection message dispatch.
//!
//! Messages of one connection are handled in arrival order. Slot
//! reservations, `stop` and `onIceCandidate` complete inline; the media
//! server part of a presenter or viewer handshake runs in its own task and
//! answers through the connection's outbound queue. Reserving before
//! spawning means candidates sent right after an offer find the handshake's
//! room, and a `stop` or disconnect right after an offer finds its slot.

use super::protocol::{
    parse_client_message, ClientMessage, HandshakeResponse, MessageKind, Outbound, ParseError,
    ServerMessage,
};
use crate::candidates::SessionId;
use crate::errors::BcError;
use crate::handshake::HandshakeEngine;
use crate::observability::metrics::record_message;

use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Routes one connection's inbound messages.
pub struct MessageRouter {
    engine: HandshakeEngine,
    session_id: SessionId,
    outbound: Outbound,
    max_message_bytes: usize,
    max_rooms: usize,
    /// Every room this session may hold state in; stopped when the connection ends.
    rooms: BTreeSet<String>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        engine: HandshakeEngine,
        session_id: SessionId,
        outbound: Outbound,
        max_message_bytes: usize,
        max_rooms: usize,
    ) -> Self {
        Self {
            engine,
            session_id,
            outbound,
            max_message_bytes,
            max_rooms,
            rooms: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Rooms referenced so far.
    pub fn rooms(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(String::as_str)
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        if text.len() > self.max_message_bytes {
            record_message("invalid");
            warn!(
                target: "bc.signaling",
                session_id = %self.session_id,
                len = text.len(),
                limit = self.max_message_bytes,
                "Message too large"
            );
            self.send(ServerMessage::Error {
                message: format!(
                    "Message too large: {} bytes (limit {})",
                    text.len(),
                    self.max_message_bytes
                ),
            })
            .await;
            return;
        }

        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                record_message("invalid");
                self.reject_unparsed(e).await;
                return;
            }
        };

        record_message(message.kind().as_str());
        if !self.track_room(&message).await {
            return;
        }
        self.dispatch(message).await;
    }

    /// Remember the message's room so `close` can stop the session there.
    /// `stop` leaves no state behind and is never tracked. Returns false,
    /// after replying, when the connection already tracks `max_rooms` rooms.
    async fn track_room(&mut self, message: &ClientMessage) -> bool {
        let room_id = message.room_id();
        if matches!(message, ClientMessage::Stop { .. }) || self.rooms.contains(room_id) {
            return true;
        }
        if self.rooms.len() >= self.max_rooms {
            warn!(
                target: "bc.signaling",
                session_id = %self.session_id,
                limit = self.max_rooms,
                "Room limit reached for connection"
            );
            let text = format!("Too many rooms (limit {})", self.max_rooms);
            let reply = match message {
                ClientMessage::Presenter { .. } => {
                    ServerMessage::PresenterResponse(HandshakeResponse::Rejected { message: text })
                }
                ClientMessage::Viewer { .. } => {
                    ServerMessage::ViewerResponse(HandshakeResponse::Rejected { message: text })
                }
                ClientMessage::Stop { .. } | ClientMessage::OnIceCandidate { .. } => {
                    ServerMessage::Error { message: text }
                }
            };
            self.send(reply).await;
            return false;
        }
        self.rooms.insert(room_id.to_string());
        true
    }

    /// Binary frames are not part of the protocol.
    pub async fn handle_binary(&mut self, len: usize) {
        record_message("invalid");
        debug!(
            target: "bc.signaling",
            session_id = %self.session_id,
            len = len,
            "Binary frame rejected"
        );
        self.send(ServerMessage::Error {
            message: "Invalid message: binary frames are not supported".to_string(),
        })
        .await;
    }

    /// The connection ended: stop the session in every room it touched.
    pub async fn close(self) {
        for room_id in &self.rooms {
            self.engine.stop(&self.session_id, room_id).await;
        }
        debug!(
            target: "bc.signaling",
            session_id = %self.session_id,
            rooms = self.rooms.len(),
            "Session stopped in all rooms"
        );
    }

    async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Presenter { room_id, sdp_offer } => {
                let reserved = self
                    .engine
                    .reserve_presenter(&self.session_id, &room_id, self.outbound.clone())
                    .await;
                match reserved {
                    Ok(reservation) => {
                        let engine = self.engine.clone();
                        let outbound = self.outbound.clone();
                        tokio::spawn(async move {
                            let result = engine.complete_presenter(reservation, &sdp_offer).await;
                            let _ = outbound
                                .send(ServerMessage::PresenterResponse(handshake_response(result)))
                                .await;
                        });
                    }
                    Err(e) => {
                        self.send(ServerMessage::PresenterResponse(handshake_response(Err(e))))
                            .await;
                    }
                }
            }

            ClientMessage::Viewer { room_id, sdp_offer } => {
                let reserved = self
                    .engine
                    .reserve_viewer(&self.session_id, &room_id, self.outbound.clone())
                    .await;
                match reserved {
                    Ok(reservation) => {
                        let engine = self.engine.clone();
                        let outbound = self.outbound.clone();
                        tokio::spawn(async move {
                            let result = engine.complete_viewer(reservation, &sdp_offer).await;
                            let _ = outbound
                                .send(ServerMessage::ViewerResponse(handshake_response(result)))
                                .await;
                        });
                    }
                    Err(e) => {
                        self.send(ServerMessage::ViewerResponse(handshake_response(Err(e))))
                            .await;
                    }
                }
            }

            ClientMessage::Stop { room_id } => {
                self.engine.stop(&self.session_id, &room_id).await;
            }

            ClientMessage::OnIceCandidate { room_id, candidate } => {
                self.engine
                    .on_ice_candidate(&self.session_id, &room_id, candidate)
                    .await;
            }
        }
    }

    async fn reject_unparsed(&self, error: ParseError) {
        let reason = match &error {
            ParseError::InvalidJson(_) => "invalid_json",
            ParseError::UnknownKind(_) => "unknown_kind",
            ParseError::InvalidFields { .. } => "invalid_fields",
        };
        debug!(
            target: "bc.signaling",
            session_id = %self.session_id,
            reason = reason,
            "Unparseable message"
        );

        let reply = match error {
            ParseError::UnknownKind(raw) => ServerMessage::Error {
                message: format!("Invalid message {raw}"),
            },
            ParseError::InvalidJson(detail) => ServerMessage::Error {
                message: BcError::MalformedMessage(detail).client_message(),
            },
            ParseError::InvalidFields { kind, detail } => {
                let message = BcError::MalformedMessage(detail).client_message();
                match kind {
                    MessageKind::Presenter => {
                        ServerMessage::PresenterResponse(HandshakeResponse::Rejected { message })
                    }
                    MessageKind::Viewer => {
                        ServerMessage::ViewerResponse(HandshakeResponse::Rejected { message })
                    }
                    MessageKind::Stop | MessageKind::OnIceCandidate => {
                        ServerMessage::Error { message }
                    }
                }
            }
        };
        self.send(reply).await;
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!(
                target: "bc.signaling",
                session_id = %self.session_id,
                "Outbound queue closed"
            );
        }
    }
}

fn handshake_response(result: Result<String, BcError>) -> HandshakeResponse {
    match result {
        Ok(sdp_answer) => HandshakeResponse::Accepted { sdp_answer },
        Err(e) => HandshakeResponse::Rejected {
            message: e.client_message(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomRegistryHandle};
    use crate::backend::mock::{ElementKind, MockMediaServer, MockOperation};
    use crate::backend::{BackendHandle, OverlayConfig};
    use crate::errors::NO_PRESENTER_MESSAGE;

    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn overlay() -> OverlayConfig {
        OverlayConfig {
            image_uri: "http://files.openvidu.io/img/mario-wings.png".to_string(),
            offset_x: -0.35,
            offset_y: -1.2,
            width: 1.6,
            height: 1.6,
        }
    }

    const PRESENTER_R1: &str = r#"{"id":"presenter","roomId":"r1","sdpOffer":"v=0 offer"}"#;

    fn engine() -> (HandshakeEngine, MockMediaServer) {
        let server = MockMediaServer::new();
        let backend = Arc::new(BackendHandle::new(
            Arc::new(server.clone()),
            "ws://mock/kurento",
        ));
        let registry = RoomRegistryHandle::new(Arc::clone(&backend), ActorMetrics::new());
        (HandshakeEngine::new(registry, backend, overlay()), server)
    }

    fn router_on(
        engine: &HandshakeEngine,
        session_id: &str,
        max_rooms: usize,
    ) -> (MessageRouter, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(16);
        (
            MessageRouter::new(engine.clone(), session_id.to_string(), outbound, 1024, max_rooms),
            rx,
        )
    }

    fn router(session_id: &str) -> (MessageRouter, mpsc::Receiver<ServerMessage>) {
        router_on(&engine().0, session_id, 16)
    }

    /// Poll `check` for up to five seconds.
    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_kind_echoes_message() {
        let (mut router, mut rx) = router("0");
        let raw = r#"{"id":"dance","roomId":"r1"}"#;

        router.handle_text(raw).await;

        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Error {
                message: format!("Invalid message {raw}")
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error() {
        let (mut router, mut rx) = router("0");
        router.handle_text("{nope").await;

        let ServerMessage::Error { message } = next(&mut rx).await else {
            unreachable!("expected error reply");
        };
        assert!(message.starts_with("Invalid message:"));
    }

    #[tokio::test]
    async fn test_viewer_missing_offer_is_rejected() {
        let (mut router, mut rx) = router("0");
        router.handle_text(r#"{"id":"viewer","roomId":"r1"}"#).await;

        let ServerMessage::ViewerResponse(HandshakeResponse::Rejected { message }) =
            next(&mut rx).await
        else {
            unreachable!("expected rejected viewerResponse");
        };
        assert!(message.contains("sdpOffer"));
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let (mut router, mut rx) = router("0");
        let offer = "a".repeat(2048);
        router
            .handle_text(&format!(
                r#"{{"id":"presenter","roomId":"r1","sdpOffer":"{offer}"}}"#
            ))
            .await;

        let ServerMessage::Error { message } = next(&mut rx).await else {
            unreachable!("expected error reply");
        };
        assert!(message.starts_with("Message too large"));
        assert_eq!(router.rooms().count(), 0);
    }

    #[tokio::test]
    async fn test_binary_frame_is_rejected() {
        let (mut router, mut rx) = router("0");
        router.handle_binary(12).await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_viewer_without_presenter() {
        let (mut router, mut rx) = router("0");
        router
            .handle_text(r#"{"id":"viewer","roomId":"r2","sdpOffer":"v=0 offer"}"#)
            .await;

        assert_eq!(
            next(&mut rx).await,
            ServerMessage::ViewerResponse(HandshakeResponse::Rejected {
                message: NO_PRESENTER_MESSAGE.to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_presenter_accepted_and_rooms_tracked() {
        let (mut router, mut rx) = router("0");
        router
            .handle_text(r#"{"id":"presenter","roomId":"r1","sdpOffer":"v=0 offer"}"#)
            .await;
        router
            .handle_text(r#"{"id":"stop","roomId":"elsewhere"}"#)
            .await;

        // The answer may trail local candidates; skip those.
        loop {
            match next(&mut rx).await {
                ServerMessage::IceCandidate { .. } => continue,
                ServerMessage::PresenterResponse(HandshakeResponse::Accepted { sdp_answer }) => {
                    assert!(sdp_answer.starts_with("v=0"));
                    break;
                }
                other => unreachable!("unexpected message {other:?}"),
            }
        }

        // `stop` leaves nothing behind, so only r1 is tracked.
        assert_eq!(router.rooms().collect::<Vec<_>>(), vec!["r1"]);
        router.close().await;
    }

    #[tokio::test]
    async fn test_close_right_after_offer_stops_presenter() {
        let (engine, server) = engine();
        let gate = server.pause(MockOperation::CreatePipeline);
        let (mut router, mut rx) = router_on(&engine, "0", 16);

        router.handle_text(PRESENTER_R1).await;
        gate.wait_entered(1).await;
        router.close().await;
        gate.open();

        assert_eq!(
            next(&mut rx).await,
            ServerMessage::PresenterResponse(HandshakeResponse::Rejected {
                message: NO_PRESENTER_MESSAGE.to_string()
            })
        );
        let backend = Arc::clone(engine.backend());
        let media = server.clone();
        assert!(
            eventually(|| {
                backend.active_sessions() == 0
                    && media.live_elements(ElementKind::Pipeline).is_empty()
                    && !media.is_connected()
            })
            .await
        );

        // The slot is free for the next presenter.
        let (outbound, _rx) = mpsc::channel(16);
        engine
            .become_presenter("1", "r1", "v=0 offer", outbound)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_offer_then_close_never_leaks_presenter() {
        let (engine, server) = engine();

        for n in 0..50 {
            let (mut router, _rx) = router_on(&engine, &n.to_string(), 16);
            router.handle_text(PRESENTER_R1).await;
            router.close().await;
        }

        let backend = Arc::clone(engine.backend());
        let media = server.clone();
        assert!(
            eventually(|| {
                backend.active_sessions() == 0
                    && media.live_elements(ElementKind::Pipeline).is_empty()
            })
            .await
        );
        match engine.registry().get_room("r1").await {
            Ok(room) => assert!(room.get_state().await.unwrap().presenter.is_none()),
            Err(e) => assert!(matches!(e, BcError::RoomNotFound(_))),
        }
    }

    #[tokio::test]
    async fn test_room_limit_per_connection() {
        let (engine, _server) = engine();
        let (mut router, mut rx) = router_on(&engine, "0", 2);
        let candidate = r#""candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}"#;

        for room in ["a", "b"] {
            router
                .handle_text(&format!(r#"{{"id":"onIceCandidate","roomId":"{room}",{candidate}}}"#))
                .await;
        }
        router
            .handle_text(&format!(r#"{{"id":"onIceCandidate","roomId":"c",{candidate}}}"#))
            .await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Error {
                message: "Too many rooms (limit 2)".to_string()
            }
        );

        router
            .handle_text(r#"{"id":"presenter","roomId":"c","sdpOffer":"v=0 offer"}"#)
            .await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::PresenterResponse(HandshakeResponse::Rejected {
                message: "Too many rooms (limit 2)".to_string()
            })
        );

        // Stops are never refused and never tracked.
        router.handle_text(r#"{"id":"stop","roomId":"d"}"#).await;
        assert_eq!(router.rooms().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(engine.registry().get_status().await.unwrap().room_count, 0);
    }
}
