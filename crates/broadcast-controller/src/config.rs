//! Broadcast controller configuration.
//!
//! Configuration is loaded from environment variables with defaults for
//! everything, so a bare `broadcast-controller` talks to a local media server.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::backend::OverlayConfig;

/// Default signaling WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8443";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default WebSocket route for signaling.
pub const DEFAULT_WS_PATH: &str = "/one2many";

/// Default media server control URI.
pub const DEFAULT_MEDIA_SERVER_URI: &str = "ws://localhost:8888/kurento";

/// Default overlay image placed over detected faces.
pub const DEFAULT_OVERLAY_IMAGE_URI: &str = "http://files.openvidu.io/img/mario-wings.png";

/// Default overlay placement, as fractions of the detected face box.
pub const DEFAULT_OVERLAY_OFFSET_X: f64 = -0.35;
pub const DEFAULT_OVERLAY_OFFSET_Y: f64 = -1.2;
pub const DEFAULT_OVERLAY_WIDTH: f64 = 1.6;
pub const DEFAULT_OVERLAY_HEIGHT: f64 = 1.6;

/// Default per-call timeout for media server RPCs.
pub const DEFAULT_BACKEND_TIMEOUT_SECONDS: u64 = 10;

/// Default maximum inbound WebSocket message size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default cap on ICE candidates queued per session while its endpoint is missing.
pub const DEFAULT_MAX_QUEUED_CANDIDATES: usize = 64;

/// Default cap on distinct rooms one connection may hold state in.
pub const DEFAULT_MAX_ROOMS_PER_CONNECTION: usize = 16;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Broadcast controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling server bind address (default: "0.0.0.0:8443").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// WebSocket route for signaling (default: "/one2many").
    pub ws_path: String,

    /// Media server control URI (default: "ws://localhost:8888/kurento").
    pub media_server_uri: String,

    /// Overlay image and placement applied to every presenter stream.
    pub overlay: OverlayConfig,

    /// Timeout for a single media server RPC.
    pub backend_timeout: Duration,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_bytes: usize,

    /// ICE candidates queued per session before further ones are dropped.
    pub max_queued_candidates: usize,

    /// Distinct rooms a single connection may present, view or trickle in.
    pub max_rooms_per_connection: usize,

    /// Log output format.
    pub log_format: LogFormat,
}

/// Custom Debug implementation that keeps the overlay URI query string out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overlay_uri = self
            .overlay
            .image_uri
            .split('?')
            .next()
            .unwrap_or_default();

        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("ws_path", &self.ws_path)
            .field("media_server_uri", &self.media_server_uri)
            .field("overlay_image_uri", &overlay_uri)
            .field("backend_timeout", &self.backend_timeout)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("max_queued_candidates", &self.max_queued_candidates)
            .field("max_rooms_per_connection", &self.max_rooms_per_connection)
            .field("log_format", &self.log_format)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("BC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let ws_path = vars
            .get("BC_WS_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WS_PATH.to_string());
        if !ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "BC_WS_PATH must start with '/', got '{ws_path}'"
            )));
        }

        let media_server_uri = vars
            .get("KMS_WS_URI")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEDIA_SERVER_URI.to_string());
        if !(media_server_uri.starts_with("ws://") || media_server_uri.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "KMS_WS_URI must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let overlay = OverlayConfig {
            image_uri: vars
                .get("BC_OVERLAY_IMAGE_URI")
                .cloned()
                .unwrap_or_else(|| DEFAULT_OVERLAY_IMAGE_URI.to_string()),
            offset_x: parse_or(vars, "BC_OVERLAY_OFFSET_X", DEFAULT_OVERLAY_OFFSET_X)?,
            offset_y: parse_or(vars, "BC_OVERLAY_OFFSET_Y", DEFAULT_OVERLAY_OFFSET_Y)?,
            width: parse_or(vars, "BC_OVERLAY_WIDTH", DEFAULT_OVERLAY_WIDTH)?,
            height: parse_or(vars, "BC_OVERLAY_HEIGHT", DEFAULT_OVERLAY_HEIGHT)?,
        };

        let backend_timeout_seconds: u64 = parse_or(
            vars,
            "BC_BACKEND_TIMEOUT_SECONDS",
            DEFAULT_BACKEND_TIMEOUT_SECONDS,
        )?;
        if backend_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "BC_BACKEND_TIMEOUT_SECONDS must be greater than 0".to_string(),
            ));
        }

        let max_message_bytes = parse_or(vars, "BC_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?;

        let max_queued_candidates = parse_or(
            vars,
            "BC_MAX_QUEUED_CANDIDATES",
            DEFAULT_MAX_QUEUED_CANDIDATES,
        )?;

        let max_rooms_per_connection: usize = parse_or(
            vars,
            "BC_MAX_ROOMS_PER_CONNECTION",
            DEFAULT_MAX_ROOMS_PER_CONNECTION,
        )?;
        if max_rooms_per_connection == 0 {
            return Err(ConfigError::InvalidValue(
                "BC_MAX_ROOMS_PER_CONNECTION must be greater than 0".to_string(),
            ));
        }

        let log_format = match vars.get("BC_LOG_FORMAT").map(String::as_str) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "BC_LOG_FORMAT must be 'text' or 'json', got '{other}'"
                )))
            }
        };

        Ok(Config {
            bind_address,
            health_bind_address,
            ws_path,
            media_server_uri,
            overlay,
            backend_timeout: Duration::from_secs(backend_timeout_seconds),
            max_message_bytes,
            max_queued_candidates,
            max_rooms_per_connection,
            log_format,
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} has invalid value '{raw}'"))),
    }
}
