//! Test data for signaling tests.

use broadcast_controller::backend::{IceCandidate, OverlayConfig};

/// A presenter SDP offer. Content is opaque to the controller.
#[must_use]
pub fn presenter_offer() -> String {
    "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=presenter\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=sendonly\r\n".to_string()
}

/// A viewer SDP offer, distinct per `n`.
#[must_use]
pub fn viewer_offer(n: usize) -> String {
    format!(
        "v=0\r\no=- {n} 2 IN IP4 127.0.0.1\r\ns=viewer-{n}\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n"
    )
}

/// A remote host candidate, distinct per `n`.
#[must_use]
pub fn remote_candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!(
            "candidate:{n} 1 udp 2122260223 192.168.1.{} {} typ host",
            n % 250 + 2,
            50000 + n
        ),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}

/// Overlay settings matching the service defaults.
#[must_use]
pub fn test_overlay() -> OverlayConfig {
    OverlayConfig {
        image_uri: "http://files.openvidu.io/img/mario-wings.png".to_string(),
        offset_x: -0.35,
        offset_y: -1.2,
        width: 1.6,
        height: 1.6,
    }
}
