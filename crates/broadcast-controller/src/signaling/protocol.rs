//! Signaling wire protocol.
//!
//! Every frame is a JSON object whose `id` field names the message kind.

use crate::backend::IceCandidate;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Sender half of a connection's outbound message queue.
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Client-to-server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Become the presenter of a room.
    #[serde(rename_all = "camelCase")]
    Presenter { room_id: String, sdp_offer: String },

    /// Watch a room's presenter.
    #[serde(rename_all = "camelCase")]
    Viewer { room_id: String, sdp_offer: String },

    /// Leave a room.
    #[serde(rename_all = "camelCase")]
    Stop { room_id: String },

    /// Trickle a remote ICE candidate.
    #[serde(rename_all = "camelCase")]
    OnIceCandidate {
        room_id: String,
        candidate: IceCandidate,
    },
}

/// Known client message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Presenter,
    Viewer,
    Stop,
    OnIceCandidate,
}

impl MessageKind {
    fn from_id(id: &str) -> Option<Self> {
        match id {
            "presenter" => Some(MessageKind::Presenter),
            "viewer" => Some(MessageKind::Viewer),
            "stop" => Some(MessageKind::Stop),
            "onIceCandidate" => Some(MessageKind::OnIceCandidate),
            _ => None,
        }
    }

    /// Label used for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Presenter => "presenter",
            MessageKind::Viewer => "viewer",
            MessageKind::Stop => "stop",
            MessageKind::OnIceCandidate => "onIceCandidate",
        }
    }
}

impl ClientMessage {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Presenter { .. } => MessageKind::Presenter,
            ClientMessage::Viewer { .. } => MessageKind::Viewer,
            ClientMessage::Stop { .. } => MessageKind::Stop,
            ClientMessage::OnIceCandidate { .. } => MessageKind::OnIceCandidate,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            ClientMessage::Presenter { room_id, .. }
            | ClientMessage::Viewer { room_id, .. }
            | ClientMessage::Stop { room_id }
            | ClientMessage::OnIceCandidate { room_id, .. } => room_id,
        }
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not a JSON object with a string `id`.
    InvalidJson(String),
    /// `id` names no known kind. Carries the raw frame for the reply.
    UnknownKind(String),
    /// Known kind with missing or mistyped fields.
    InvalidFields { kind: MessageKind, detail: String },
}

/// Parse one inbound text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let Some(id) = value.get("id").and_then(Value::as_str) else {
        return Err(ParseError::UnknownKind(text.to_string()));
    };
    let Some(kind) = MessageKind::from_id(id) else {
        return Err(ParseError::UnknownKind(text.to_string()));
    };

    serde_json::from_value(value).map_err(|e| ParseError::InvalidFields {
        kind,
        detail: e.to_string(),
    })
}

/// Outcome of a presenter or viewer handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "camelCase")]
pub enum HandshakeResponse {
    #[serde(rename_all = "camelCase")]
    Accepted { sdp_answer: String },
    Rejected { message: String },
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    PresenterResponse(HandshakeResponse),
    ViewerResponse(HandshakeResponse),
    /// Local ICE candidate discovered by the media server.
    IceCandidate { candidate: IceCandidate },
    /// The presenter left; the viewer's stream is gone.
    StopCommunication,
    Error { message: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_presenter() {
        let msg = parse_client_message(r#"{"id":"presenter","roomId":"r1","sdpOffer":"v=0"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Presenter {
                room_id: "r1".to_string(),
                sdp_offer: "v=0".to_string()
            }
        );
        assert_eq!(msg.kind(), MessageKind::Presenter);
        assert_eq!(msg.room_id(), "r1");
    }

    #[test]
    fn test_parse_on_ice_candidate() {
        let msg = parse_client_message(
            r#"{"id":"onIceCandidate","roomId":"r1","candidate":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        let ClientMessage::OnIceCandidate { room_id, candidate } = msg else {
            unreachable!("parsed as wrong kind");
        };
        assert_eq!(room_id, "r1");
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_client_message("{not json"),
            Err(ParseError::InvalidJson(_))
        ));

        let raw = r#"{"id":"dance","roomId":"r1"}"#;
        assert_eq!(
            parse_client_message(raw),
            Err(ParseError::UnknownKind(raw.to_string()))
        );

        assert!(matches!(
            parse_client_message(r#"{"roomId":"r1"}"#),
            Err(ParseError::UnknownKind(_))
        ));

        assert!(matches!(
            parse_client_message(r#"{"id":"viewer","roomId":"r1"}"#),
            Err(ParseError::InvalidFields {
                kind: MessageKind::Viewer,
                ..
            })
        ));
    }

    #[test]
    fn test_server_message_wire_format() {
        let accepted = ServerMessage::PresenterResponse(HandshakeResponse::Accepted {
            sdp_answer: "v=0 answer".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&accepted).unwrap(),
            json!({"id": "presenterResponse", "response": "accepted", "sdpAnswer": "v=0 answer"})
        );

        let rejected = ServerMessage::ViewerResponse(HandshakeResponse::Rejected {
            message: "No active presenter. Try again later...".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&rejected).unwrap(),
            json!({
                "id": "viewerResponse",
                "response": "rejected",
                "message": "No active presenter. Try again later..."
            })
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::StopCommunication).unwrap(),
            json!({"id": "stopCommunication"})
        );
    }

    #[test]
    fn test_server_message_parses_back() {
        let text = r#"{"id":"iceCandidate","candidate":{"candidate":"candidate:9","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        assert!(matches!(msg, ServerMessage::IceCandidate { .. }));

        let text = r#"{"id":"presenterResponse","response":"rejected","message":"Already a presenter exists"}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            ServerMessage::PresenterResponse(HandshakeResponse::Rejected {
                message: "Already a presenter exists".to_string()
            })
        );
    }
}
