//! Broadcast controller error types.
//!
//! Errors surface to clients as the `message` of a rejected
//! `presenterResponse` / `viewerResponse`. Media server details are logged
//! server-side but not exposed to clients.

use thiserror::Error;

/// Message sent to clients when a viewer joins a room without a presenter,
/// or when the presenter vanished while a handshake was in flight.
pub const NO_PRESENTER_MESSAGE: &str = "No active presenter. Try again later...";

/// Broadcast controller error type.
#[derive(Debug, Error)]
pub enum BcError {
    /// Room does not exist.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room already has a presenter.
    #[error("Room already has a presenter")]
    PresenterConflict,

    /// The session is already presenting or viewing in this room.
    #[error("Session already active in room")]
    SessionConflict,

    /// No presenter is active (viewer joined an empty room, or the presenter
    /// stopped while a handshake was in flight).
    #[error("No active presenter")]
    NoActivePresenter,

    /// The media server could not be reached.
    #[error("Media server unreachable: {0}")]
    BackendUnreachable(String),

    /// A remote create/connect/offer step failed on the media server.
    #[error("Media server operation '{operation}' failed: {reason}")]
    BackendOperationFailed {
        operation: &'static str,
        reason: String,
    },

    /// Inbound client message could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The room actor retired (room became idle) while the request was queued.
    /// Callers retry against a freshly created room.
    #[error("Room retired")]
    RoomRetired,

    /// Internal error with context (actor channel failures).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BcError {
    /// Convenience constructor for media server operation failures.
    pub fn backend_failed(operation: &'static str, reason: impl Into<String>) -> Self {
        BcError::BackendOperationFailed {
            operation,
            reason: reason.into(),
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    pub fn error_type_label(&self) -> &'static str {
        match self {
            BcError::RoomNotFound(_) => "room_not_found",
            BcError::PresenterConflict => "presenter_conflict",
            BcError::SessionConflict => "session_conflict",
            BcError::NoActivePresenter => "no_active_presenter",
            BcError::BackendUnreachable(_) => "backend_unreachable",
            BcError::BackendOperationFailed { .. } => "backend_operation_failed",
            BcError::MalformedMessage(_) => "malformed_message",
            BcError::RoomRetired => "room_retired",
            BcError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no media server internals).
    pub fn client_message(&self) -> String {
        match self {
            // Empty rooms are pruned, so to a viewer a missing room and a room
            // without a presenter look the same.
            BcError::RoomNotFound(_) | BcError::NoActivePresenter => {
                NO_PRESENTER_MESSAGE.to_string()
            }
            BcError::PresenterConflict => "Already a presenter exists".to_string(),
            BcError::SessionConflict => "Session is already active in this room".to_string(),
            BcError::BackendUnreachable(_) => "Could not find media server".to_string(),
            BcError::BackendOperationFailed { operation, .. } => {
                format!("Media server error during {operation}")
            }
            BcError::MalformedMessage(detail) => format!("Invalid message: {detail}"),
            BcError::RoomRetired | BcError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_hide_backend_details() {
        let err = BcError::BackendUnreachable("ws://10.0.0.7:8888/kurento refused".to_string());
        assert!(!err.client_message().contains("10.0.0.7"));

        let err = BcError::backend_failed("processOffer", "SDP parse error at line 4");
        assert_eq!(
            err.client_message(),
            "Media server error during processOffer"
        );
        assert!(!err.client_message().contains("line 4"));

        let err = BcError::Internal("channel send failed: closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_no_presenter_message() {
        assert_eq!(
            BcError::NoActivePresenter.client_message(),
            "No active presenter. Try again later..."
        );
        assert_eq!(
            BcError::RoomNotFound("r2".to_string()).client_message(),
            NO_PRESENTER_MESSAGE
        );
    }

    #[test]
    fn test_error_type_labels_are_bounded() {
        let errors = [
            BcError::RoomNotFound("r1".to_string()),
            BcError::PresenterConflict,
            BcError::SessionConflict,
            BcError::NoActivePresenter,
            BcError::BackendUnreachable("x".to_string()),
            BcError::backend_failed("create", "x"),
            BcError::MalformedMessage("x".to_string()),
            BcError::RoomRetired,
            BcError::Internal("x".to_string()),
        ];

        for err in &errors {
            let label = err.error_type_label();
            assert!(!label.is_empty());
            assert!(label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", BcError::RoomNotFound("r2".to_string())),
            "Room not found: r2"
        );
        assert_eq!(
            format!("{}", BcError::backend_failed("connect", "timeout")),
            "Media server operation 'connect' failed: timeout"
        );
    }
}
