//! Media server client seam.
//!
//! The controller never processes media itself. Every presenter owns a
//! pipeline on the media server holding a WebRTC endpoint and a face overlay
//! filter; viewers get their own endpoint under the presenter's pipeline, fed
//! from the filter. This module defines the small capability set the
//! controller needs from the media server:
//!
//! - [`MediaConnector`] opens a control connection and yields a [`MediaClient`]
//! - [`MediaClient`] creates, wires and releases elements by id
//! - [`BackendHandle`] is the process-wide, lazily connected client shared by
//!   all rooms, closed again once no presenter or viewer is active
//!
//! Implementations:
//!
//! - [`kurento`] - JSON-RPC over WebSocket against a Kurento media server
//! - [`mock`] - in-memory media server for tests

pub mod kurento;
pub mod mock;

use crate::errors::BcError;
use crate::observability::metrics::{
    record_backend_close, record_backend_connect, set_sessions_active,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Media server element identifier (pipeline, endpoint or filter).
pub type ElementId = String;

/// Stream of local ICE candidates discovered by an endpoint.
///
/// The stream ends when the endpoint (or its pipeline) is released or the
/// control connection closes.
pub type CandidateStream = mpsc::UnboundedReceiver<IceCandidate>;

/// An ICE candidate as exchanged with browsers (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

/// Image overlay applied by the presenter's face overlay filter.
///
/// Offsets and sizes are fractions of the detected face box.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    pub image_uri: String,
    pub offset_x: f64,
    pub offset_y: f64,
    pub width: f64,
    pub height: f64,
}

/// Opens control connections to a media server.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    /// Connect to the media server at `uri`.
    ///
    /// Fails with [`BcError::BackendUnreachable`] if the server cannot be reached.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MediaClient>, BcError>;
}

/// An established media server control connection.
#[async_trait]
pub trait MediaClient: Send + Sync {
    /// Create a media pipeline.
    async fn create_pipeline(&self) -> Result<ElementId, BcError>;

    /// Create a WebRTC endpoint inside `pipeline`.
    async fn create_webrtc_endpoint(&self, pipeline: &ElementId) -> Result<ElementId, BcError>;

    /// Create a face overlay filter inside `pipeline`.
    async fn create_face_overlay_filter(&self, pipeline: &ElementId)
        -> Result<ElementId, BcError>;

    /// Configure the image drawn by a face overlay filter.
    async fn set_overlayed_image(
        &self,
        filter: &ElementId,
        overlay: &OverlayConfig,
    ) -> Result<(), BcError>;

    /// Feed the media output of `source` into `sink`.
    async fn connect(&self, source: &ElementId, sink: &ElementId) -> Result<(), BcError>;

    /// Submit an SDP offer to an endpoint and return the SDP answer.
    async fn process_offer(&self, endpoint: &ElementId, offer: &str) -> Result<String, BcError>;

    /// Add a remote ICE candidate to an endpoint.
    async fn add_ice_candidate(
        &self,
        endpoint: &ElementId,
        candidate: &IceCandidate,
    ) -> Result<(), BcError>;

    /// Start gathering local ICE candidates on an endpoint.
    async fn gather_candidates(&self, endpoint: &ElementId) -> Result<(), BcError>;

    /// Subscribe to local ICE candidates discovered by an endpoint.
    async fn subscribe_ice_candidates(&self, endpoint: &ElementId)
        -> Result<CandidateStream, BcError>;

    /// Release an element. Releasing a pipeline releases every element in it.
    async fn release(&self, element: &ElementId) -> Result<(), BcError>;

    /// Close the control connection.
    async fn close(&self);

    /// Whether the control connection is gone, closed by us or lost.
    fn is_closed(&self) -> bool;
}

/// Process-wide handle to the media server.
///
/// Connects lazily on first use and caches the client. The handle counts
/// active presenters and viewers through [`SessionLease`]s; [`close_if_idle`]
/// closes the cached client only when that count is zero, checked under the
/// same lock `ensure_connected` takes, so a close never races an in-flight
/// connect.
///
/// [`close_if_idle`]: BackendHandle::close_if_idle
pub struct BackendHandle {
    connector: Arc<dyn MediaConnector>,
    uri: String,
    client: Mutex<Option<Arc<dyn MediaClient>>>,
    active_sessions: Arc<AtomicUsize>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("uri", &self.uri)
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    /// Create a handle that connects to `uri` through `connector` on first use.
    #[must_use]
    pub fn new(connector: Arc<dyn MediaConnector>, uri: impl Into<String>) -> Self {
        Self {
            connector,
            uri: uri.into(),
            client: Mutex::new(None),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register an active presenter or viewer. The count drops when the lease is dropped.
    #[must_use]
    pub fn lease(&self) -> SessionLease {
        let count = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        set_sessions_active(count);
        SessionLease {
            counter: Arc::clone(&self.active_sessions),
        }
    }

    /// Number of live session leases.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Whether a client is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Return the cached client, connecting first if needed.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn MediaClient>, BcError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
        }
        if let Some(stale) = guard.take() {
            warn!(
                target: "bc.backend",
                uri = %self.uri,
                "Media server connection lost, reconnecting"
            );
            stale.close().await;
            record_backend_close();
        }

        match self.connector.connect(&self.uri).await {
            Ok(client) => {
                record_backend_connect("success");
                info!(
                    target: "bc.backend",
                    uri = %self.uri,
                    "Connected to media server"
                );
                *guard = Some(Arc::clone(&client));
                Ok(client)
            }
            Err(e) => {
                record_backend_connect("error");
                warn!(
                    target: "bc.backend",
                    uri = %self.uri,
                    error = %e,
                    "Could not find media server"
                );
                Err(e)
            }
        }
    }

    /// Close the cached client if no presenter or viewer is active anywhere.
    ///
    /// Returns true if a client was closed.
    pub async fn close_if_idle(&self) -> bool {
        let mut guard = self.client.lock().await;
        if self.active_sessions() > 0 {
            return false;
        }

        match guard.take() {
            Some(client) => {
                info!(target: "bc.backend", "Closing media server client");
                client.close().await;
                record_backend_close();
                true
            }
            None => false,
        }
    }

    /// Close the cached client regardless of active sessions (shutdown).
    pub async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
            record_backend_close();
        }
    }
}

/// Counts one active presenter or viewer against the [`BackendHandle`].
#[derive(Debug)]
pub struct SessionLease {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(1, Ordering::SeqCst);
        set_sessions_active(previous.saturating_sub(1));
    }
}
