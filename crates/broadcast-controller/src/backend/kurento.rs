//! Kurento media server client.
//!
//! Speaks Kurento's JSON-RPC 2.0 protocol over a single WebSocket:
//!
//! - `create` with `MediaPipeline`, `WebRtcEndpoint` or `FaceOverlayFilter`
//! - `invoke` for element operations (`connect`, `processOffer`, ...)
//! - `subscribe` to `IceCandidateFound` events
//! - `release` to destroy an element
//!
//! Requests are correlated with responses by id. A reader task resolves
//! pending calls and routes `onEvent` notifications to per-endpoint candidate
//! channels; a writer task owns the sink. The session id returned by the
//! server is attached to every subsequent request.

use super::{
    CandidateStream, ElementId, IceCandidate, MediaClient, MediaConnector, OverlayConfig,
};
use crate::errors::BcError;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound request buffer.
const OUTBOUND_CHANNEL_BUFFER: usize = 256;

const CANDIDATE_EVENT: &str = "IceCandidateFound";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingCall = oneshot::Sender<Result<Value, String>>;

/// Connects to Kurento media servers.
#[derive(Debug, Clone)]
pub struct KurentoConnector {
    call_timeout: Duration,
}

impl KurentoConnector {
    /// Create a connector whose clients time out each RPC after `call_timeout`.
    #[must_use]
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

#[async_trait]
impl MediaConnector for KurentoConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MediaClient>, BcError> {
        let client = KurentoClient::connect(uri, self.call_timeout).await?;
        Ok(Arc::new(client))
    }
}

#[derive(Debug, Default)]
struct RpcState {
    pending: HashMap<u64, PendingCall>,
    subscriptions: HashMap<ElementId, mpsc::UnboundedSender<IceCandidate>>,
    /// Endpoints created inside each pipeline, so releasing the pipeline can
    /// end their candidate streams.
    children: HashMap<ElementId, Vec<ElementId>>,
    session_id: Option<String>,
}

impl RpcState {
    fn fail_all(&mut self, reason: &str) {
        for (_, call) in self.pending.drain() {
            let _ = call.send(Err(reason.to_string()));
        }
        self.subscriptions.clear();
        self.children.clear();
    }
}

fn lock(state: &Mutex<RpcState>) -> MutexGuard<'_, RpcState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Inbound JSON-RPC frame (response or notification).
#[derive(Debug, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
    #[serde(default)]
    params: Option<EventParams>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EventParams {
    value: EventValue,
}

#[derive(Debug, Deserialize)]
struct EventValue {
    #[serde(rename = "type")]
    kind: String,
    object: ElementId,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct CandidateEventData {
    candidate: IceCandidate,
}

/// JSON-RPC client for one Kurento control connection.
pub struct KurentoClient {
    outbound: mpsc::Sender<Message>,
    state: Arc<Mutex<RpcState>>,
    next_id: AtomicU64,
    call_timeout: Duration,
    cancel_token: CancellationToken,
}

impl KurentoClient {
    /// Open a control connection to `uri`.
    pub async fn connect(uri: &str, call_timeout: Duration) -> Result<Self, BcError> {
        let (ws, _) = tokio::time::timeout(call_timeout, connect_async(uri))
            .await
            .map_err(|_| BcError::BackendUnreachable(format!("connecting to {uri} timed out")))?
            .map_err(|e| BcError::BackendUnreachable(format!("connecting to {uri} failed: {e}")))?;

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        let state = Arc::new(Mutex::new(RpcState::default()));
        let cancel_token = CancellationToken::new();

        tokio::spawn(write_loop(sink, outbound_rx, cancel_token.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&state), cancel_token.clone()));

        debug!(target: "bc.backend.kurento", uri = %uri, "Kurento control connection open");

        Ok(Self {
            outbound,
            state,
            next_id: AtomicU64::new(1),
            call_timeout,
            cancel_token,
        })
    }

    async fn call(
        &self,
        operation: &'static str,
        method: &str,
        mut params: Value,
    ) -> Result<Value, BcError> {
        if self.cancel_token.is_cancelled() {
            return Err(BcError::backend_failed(
                operation,
                "media server connection closed",
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if let (Some(session_id), Value::Object(map)) = (&state.session_id, &mut params) {
                map.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            state.pending.insert(id, tx);
        }

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if self
            .outbound
            .send(Message::Text(request.to_string()))
            .await
            .is_err()
        {
            lock(&self.state).pending.remove(&id);
            return Err(BcError::backend_failed(
                operation,
                "media server connection closed",
            ));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(reason))) => Err(BcError::backend_failed(operation, reason)),
            Ok(Err(_)) => Err(BcError::backend_failed(
                operation,
                "media server connection closed",
            )),
            Err(_) => {
                lock(&self.state).pending.remove(&id);
                Err(BcError::backend_failed(
                    operation,
                    format!("timed out after {:?}", self.call_timeout),
                ))
            }
        }
    }

    async fn create(
        &self,
        operation: &'static str,
        kind: &str,
        pipeline: Option<&ElementId>,
    ) -> Result<ElementId, BcError> {
        let constructor_params = match pipeline {
            Some(pipeline) => json!({ "mediaPipeline": pipeline }),
            None => json!({}),
        };
        let result = self
            .call(
                operation,
                "create",
                json!({
                    "type": kind,
                    "constructorParams": constructor_params,
                    "properties": {},
                }),
            )
            .await?;
        string_value(operation, &result)
    }

    async fn invoke(
        &self,
        operation: &'static str,
        object: &ElementId,
        operation_params: Value,
    ) -> Result<Value, BcError> {
        self.call(
            operation,
            "invoke",
            json!({
                "object": object,
                "operation": operation,
                "operationParams": operation_params,
            }),
        )
        .await
    }
}

impl Drop for KurentoClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Extract `result.value` as a string.
fn string_value(operation: &'static str, result: &Value) -> Result<String, BcError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BcError::backend_failed(operation, "response missing string value"))
}

#[async_trait]
impl MediaClient for KurentoClient {
    async fn create_pipeline(&self) -> Result<ElementId, BcError> {
        self.create("createPipeline", "MediaPipeline", None).await
    }

    async fn create_webrtc_endpoint(&self, pipeline: &ElementId) -> Result<ElementId, BcError> {
        let endpoint = self
            .create("createWebRtcEndpoint", "WebRtcEndpoint", Some(pipeline))
            .await?;
        lock(&self.state)
            .children
            .entry(pipeline.clone())
            .or_default()
            .push(endpoint.clone());
        Ok(endpoint)
    }

    async fn create_face_overlay_filter(
        &self,
        pipeline: &ElementId,
    ) -> Result<ElementId, BcError> {
        self.create("createFaceOverlayFilter", "FaceOverlayFilter", Some(pipeline))
            .await
    }

    async fn set_overlayed_image(
        &self,
        filter: &ElementId,
        overlay: &OverlayConfig,
    ) -> Result<(), BcError> {
        self.invoke(
            "setOverlayedImage",
            filter,
            json!({
                "uri": overlay.image_uri,
                "offsetXPercent": overlay.offset_x,
                "offsetYPercent": overlay.offset_y,
                "widthPercent": overlay.width,
                "heightPercent": overlay.height,
            }),
        )
        .await?;
        Ok(())
    }

    async fn connect(&self, source: &ElementId, sink: &ElementId) -> Result<(), BcError> {
        self.invoke("connect", source, json!({ "sink": sink }))
            .await?;
        Ok(())
    }

    async fn process_offer(&self, endpoint: &ElementId, offer: &str) -> Result<String, BcError> {
        let result = self
            .invoke("processOffer", endpoint, json!({ "offer": offer }))
            .await?;
        string_value("processOffer", &result)
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &ElementId,
        candidate: &IceCandidate,
    ) -> Result<(), BcError> {
        self.invoke(
            "addIceCandidate",
            endpoint,
            json!({
                "candidate": {
                    "__module__": "kurento",
                    "__type__": "IceCandidate",
                    "candidate": candidate.candidate,
                    "sdpMid": candidate.sdp_mid.as_deref().unwrap_or_default(),
                    "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or_default(),
                }
            }),
        )
        .await?;
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &ElementId) -> Result<(), BcError> {
        self.invoke("gatherCandidates", endpoint, json!({}))
            .await?;
        Ok(())
    }

    async fn subscribe_ice_candidates(
        &self,
        endpoint: &ElementId,
    ) -> Result<CandidateStream, BcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state)
            .subscriptions
            .insert(endpoint.clone(), tx);

        let result = self
            .call(
                "subscribe",
                "subscribe",
                json!({ "object": endpoint, "type": CANDIDATE_EVENT }),
            )
            .await;
        if let Err(e) = result {
            lock(&self.state).subscriptions.remove(endpoint);
            return Err(e);
        }
        Ok(rx)
    }

    async fn release(&self, element: &ElementId) -> Result<(), BcError> {
        {
            let mut state = lock(&self.state);
            state.subscriptions.remove(element);
            if let Some(children) = state.children.remove(element) {
                for child in children {
                    state.subscriptions.remove(&child);
                }
            }
        }
        self.call("release", "release", json!({ "object": element }))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel_token.cancel();
        lock(&self.state).fail_all("media server client closed");
        info!(target: "bc.backend.kurento", "Kurento client closed");
    }

    fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    warn!(target: "bc.backend.kurento", error = %e, "Failed to write to media server");
                    cancel_token.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    state: Arc<Mutex<RpcState>>,
    cancel_token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_frame(&state, &text),
            Some(Ok(Message::Close(_))) | None => {
                info!(target: "bc.backend.kurento", "Media server closed the control connection");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target: "bc.backend.kurento", error = %e, "Media server connection error");
                break;
            }
        }
    }

    cancel_token.cancel();
    lock(&state).fail_all("media server connection closed");
}

fn handle_frame(state: &Mutex<RpcState>, text: &str) {
    let frame: RpcFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "bc.backend.kurento", error = %e, "Ignoring unparseable media server frame");
            return;
        }
    };

    if let (Some(id), None) = (frame.id, frame.method.as_deref()) {
        let mut state = lock(state);
        let outcome = match (frame.error, frame.result) {
            (Some(error), _) => Err(format!("{} (code {})", error.message, error.code)),
            (None, Some(result)) => {
                if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
                    state.session_id = Some(session_id.to_string());
                }
                Ok(result)
            }
            (None, None) => Ok(Value::Null),
        };
        match state.pending.remove(&id) {
            Some(call) => {
                let _ = call.send(outcome);
            }
            None => debug!(target: "bc.backend.kurento", id, "Response for unknown or expired call"),
        }
        return;
    }

    if frame.method.as_deref() == Some("onEvent") {
        if let Some(params) = frame.params {
            route_event(state, params.value);
        }
    }
}

fn route_event(state: &Mutex<RpcState>, event: EventValue) {
    if event.kind != CANDIDATE_EVENT {
        debug!(target: "bc.backend.kurento", kind = %event.kind, "Ignoring media server event");
        return;
    }

    let data: CandidateEventData = match serde_json::from_value(event.data) {
        Ok(data) => data,
        Err(e) => {
            warn!(target: "bc.backend.kurento", error = %e, "Malformed IceCandidateFound event");
            return;
        }
    };

    let mut state = lock(state);
    let delivered = state
        .subscriptions
        .get(&event.object)
        .is_some_and(|tx| tx.send(data.candidate).is_ok());
    if !delivered {
        state.subscriptions.remove(&event.object);
    }
}
