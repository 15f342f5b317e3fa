//! In-memory media server for tests.
//!
//! `MockMediaServer` implements both [`MediaConnector`] and (through the
//! clients it hands out) [`MediaClient`]. It records every call, tracks which
//! elements are alive, and lets tests inject failures, make the server
//! unreachable, or hold an operation mid-flight with a [`MockGate`] to
//! exercise races between handshakes and teardown.

use super::{
    CandidateStream, ElementId, IceCandidate, MediaClient, MediaConnector, OverlayConfig,
};
use crate::errors::BcError;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

/// Prefix of every SDP answer produced by the mock.
pub const MOCK_ANSWER_PREFIX: &str = "v=0 mock-answer for ";

/// Media server operations that can fail or be paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    CreatePipeline,
    CreateEndpoint,
    CreateFilter,
    SetOverlayedImage,
    Connect,
    ProcessOffer,
    AddIceCandidate,
    GatherCandidates,
    Subscribe,
    Release,
}

impl MockOperation {
    fn name(self) -> &'static str {
        match self {
            MockOperation::CreatePipeline => "createPipeline",
            MockOperation::CreateEndpoint => "createWebRtcEndpoint",
            MockOperation::CreateFilter => "createFaceOverlayFilter",
            MockOperation::SetOverlayedImage => "setOverlayedImage",
            MockOperation::Connect => "connect",
            MockOperation::ProcessOffer => "processOffer",
            MockOperation::AddIceCandidate => "addIceCandidate",
            MockOperation::GatherCandidates => "gatherCandidates",
            MockOperation::Subscribe => "subscribe",
            MockOperation::Release => "release",
        }
    }
}

/// Kind of element living on the mock server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Pipeline,
    WebRtcEndpoint,
    FaceOverlayFilter,
}

/// A recorded media server call.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub operation: MockOperation,
    pub element: Option<ElementId>,
}

#[derive(Debug)]
struct MockElement {
    kind: ElementKind,
    pipeline: Option<ElementId>,
    released: bool,
    sinks: Vec<ElementId>,
    remote_candidates: Vec<IceCandidate>,
    offers: Vec<String>,
    overlay: Option<OverlayConfig>,
}

#[derive(Debug, Default)]
struct MockInner {
    next_id: u64,
    elements: HashMap<ElementId, MockElement>,
    calls: Vec<MockCall>,
    failures: HashSet<MockOperation>,
    subscriptions: HashMap<ElementId, mpsc::UnboundedSender<IceCandidate>>,
}

/// Holds every call of one operation until [`MockGate::open`] is called.
#[derive(Debug, Clone)]
pub struct MockGate {
    open: Arc<watch::Sender<bool>>,
    entered: Arc<watch::Sender<usize>>,
}

impl MockGate {
    fn new() -> Self {
        let (open, _) = watch::channel(false);
        let (entered, _) = watch::channel(0);
        Self {
            open: Arc::new(open),
            entered: Arc::new(entered),
        }
    }

    /// Wait until at least `count` calls are blocked on this gate.
    pub async fn wait_entered(&self, count: usize) {
        let mut rx = self.entered.subscribe();
        // The sender lives as long as the gate, so this only fails if the
        // gate itself is gone.
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Let every held and future call through.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        self.entered.send_modify(|n| *n += 1);
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug, Default)]
struct MockState {
    inner: Mutex<MockInner>,
    gates: Mutex<HashMap<MockOperation, MockGate>>,
    unreachable: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    /// Bumped by `drop_connections`; clients from an older generation are dead.
    generation: AtomicUsize,
}

/// In-memory media server. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockMediaServer {
    state: Arc<MockState>,
}

impl MockMediaServer {
    /// Create a reachable mock server with no elements.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockInner> {
        self.state
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every subsequent call of `operation` fail.
    pub fn fail_on(&self, operation: MockOperation) {
        self.inner().failures.insert(operation);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.inner().failures.clear();
    }

    /// Hold every subsequent call of `operation` until the returned gate opens.
    pub fn pause(&self, operation: MockOperation) -> MockGate {
        let gate = MockGate::new();
        self.state
            .gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(operation, gate.clone());
        gate
    }

    /// Sever every open control connection, as if the media server restarted.
    ///
    /// Existing clients report themselves closed and fail every call. Elements
    /// created through them stay as they are.
    pub fn drop_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.inner().subscriptions.clear();
    }

    /// Number of successful connections opened.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connect_count() > self.close_count()
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner().calls.clone()
    }

    /// Number of recorded calls of `operation`.
    pub fn call_count(&self, operation: MockOperation) -> usize {
        self.inner()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Ids of live (unreleased) elements of `kind`, in creation order.
    pub fn live_elements(&self, kind: ElementKind) -> Vec<ElementId> {
        let inner = self.inner();
        let mut ids: Vec<(u64, ElementId)> = inner
            .elements
            .iter()
            .filter(|(_, e)| e.kind == kind && !e.released)
            .map(|(id, _)| (element_seq(id), id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of elements ever created.
    pub fn created_count(&self, kind: ElementKind) -> usize {
        self.inner()
            .elements
            .values()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Whether `element` exists and has been released.
    pub fn is_released(&self, element: &str) -> bool {
        self.inner()
            .elements
            .get(element)
            .is_some_and(|e| e.released)
    }

    /// Pipeline an endpoint or filter was created in.
    pub fn pipeline_of(&self, element: &str) -> Option<ElementId> {
        self.inner()
            .elements
            .get(element)
            .and_then(|e| e.pipeline.clone())
    }

    /// Sinks `source` has been connected to, in call order.
    pub fn sinks_of(&self, source: &str) -> Vec<ElementId> {
        self.inner()
            .elements
            .get(source)
            .map(|e| e.sinks.clone())
            .unwrap_or_default()
    }

    /// Remote candidates added to `endpoint`, in arrival order.
    pub fn remote_candidates(&self, endpoint: &str) -> Vec<IceCandidate> {
        self.inner()
            .elements
            .get(endpoint)
            .map(|e| e.remote_candidates.clone())
            .unwrap_or_default()
    }

    /// Offers submitted to `endpoint`.
    pub fn offers(&self, endpoint: &str) -> Vec<String> {
        self.inner()
            .elements
            .get(endpoint)
            .map(|e| e.offers.clone())
            .unwrap_or_default()
    }

    /// Overlay configured on a filter.
    pub fn overlay_of(&self, filter: &str) -> Option<OverlayConfig> {
        self.inner()
            .elements
            .get(filter)
            .and_then(|e| e.overlay.clone())
    }

    /// Emit a local candidate from `endpoint` to its subscriber, if any.
    pub fn emit_local_candidate(&self, endpoint: &str, candidate: IceCandidate) -> bool {
        self.inner()
            .subscriptions
            .get(endpoint)
            .is_some_and(|tx| tx.send(candidate).is_ok())
    }

    /// The SDP answer the mock returns for `endpoint`.
    pub fn answer_for(endpoint: &str) -> String {
        format!("{MOCK_ANSWER_PREFIX}{endpoint}")
    }

    /// The local candidate the mock emits when gathering starts on `endpoint`.
    pub fn gathered_candidate(endpoint: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{endpoint} 1 udp 2122260223 10.0.0.1 40000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Record a call, then apply pause gates and injected failures.
    async fn enter(&self, operation: MockOperation, element: Option<&str>) -> Result<(), BcError> {
        self.inner().calls.push(MockCall {
            operation,
            element: element.map(str::to_string),
        });

        let gate = self
            .state
            .gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&operation)
            .cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if self.inner().failures.contains(&operation) {
            return Err(BcError::backend_failed(operation.name(), "injected failure"));
        }
        Ok(())
    }

    fn create(
        &self,
        operation: MockOperation,
        kind: ElementKind,
        pipeline: Option<&ElementId>,
    ) -> Result<ElementId, BcError> {
        let mut inner = self.inner();
        if let Some(pipeline) = pipeline {
            ensure_live(&inner, operation, pipeline)?;
        }
        inner.next_id += 1;
        let prefix = match kind {
            ElementKind::Pipeline => "pipeline",
            ElementKind::WebRtcEndpoint => "endpoint",
            ElementKind::FaceOverlayFilter => "filter",
        };
        let id = format!("{prefix}-{}", inner.next_id);
        inner.elements.insert(
            id.clone(),
            MockElement {
                kind,
                pipeline: pipeline.cloned(),
                released: false,
                sinks: Vec::new(),
                remote_candidates: Vec::new(),
                offers: Vec::new(),
                overlay: None,
            },
        );
        Ok(id)
    }
}

fn element_seq(id: &str) -> u64 {
    id.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or_default()
}

fn ensure_live(inner: &MockInner, operation: MockOperation, id: &str) -> Result<(), BcError> {
    match inner.elements.get(id) {
        Some(e) if !e.released => Ok(()),
        Some(_) => Err(BcError::backend_failed(
            operation.name(),
            format!("element {id} was released"),
        )),
        None => Err(BcError::backend_failed(
            operation.name(),
            format!("element {id} not found"),
        )),
    }
}

#[async_trait]
impl MediaConnector for MockMediaServer {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MediaClient>, BcError> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(BcError::BackendUnreachable(format!(
                "mock media server at {uri} is unreachable"
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockMediaClient {
            server: self.clone(),
            generation: self.state.generation.load(Ordering::SeqCst),
        }))
    }
}

/// Client handed out by [`MockMediaServer`].
#[derive(Debug)]
pub struct MockMediaClient {
    server: MockMediaServer,
    generation: usize,
}

impl MockMediaClient {
    async fn enter(&self, operation: MockOperation, element: Option<&str>) -> Result<(), BcError> {
        if self.is_closed() {
            return Err(BcError::backend_failed(operation.name(), "connection closed"));
        }
        self.server.enter(operation, element).await
    }
}

#[async_trait]
impl MediaClient for MockMediaClient {
    async fn create_pipeline(&self) -> Result<ElementId, BcError> {
        self.enter(MockOperation::CreatePipeline, None).await?;
        self.server
            .create(MockOperation::CreatePipeline, ElementKind::Pipeline, None)
    }

    async fn create_webrtc_endpoint(&self, pipeline: &ElementId) -> Result<ElementId, BcError> {
        self
            .enter(MockOperation::CreateEndpoint, Some(pipeline))
            .await?;
        self.server.create(
            MockOperation::CreateEndpoint,
            ElementKind::WebRtcEndpoint,
            Some(pipeline),
        )
    }

    async fn create_face_overlay_filter(
        &self,
        pipeline: &ElementId,
    ) -> Result<ElementId, BcError> {
        self
            .enter(MockOperation::CreateFilter, Some(pipeline))
            .await?;
        self.server.create(
            MockOperation::CreateFilter,
            ElementKind::FaceOverlayFilter,
            Some(pipeline),
        )
    }

    async fn set_overlayed_image(
        &self,
        filter: &ElementId,
        overlay: &OverlayConfig,
    ) -> Result<(), BcError> {
        self
            .enter(MockOperation::SetOverlayedImage, Some(filter))
            .await?;
        let mut inner = self.server.inner();
        ensure_live(&inner, MockOperation::SetOverlayedImage, filter)?;
        if let Some(element) = inner.elements.get_mut(filter) {
            element.overlay = Some(overlay.clone());
        }
        Ok(())
    }

    async fn connect(&self, source: &ElementId, sink: &ElementId) -> Result<(), BcError> {
        self.enter(MockOperation::Connect, Some(source)).await?;
        let mut inner = self.server.inner();
        ensure_live(&inner, MockOperation::Connect, source)?;
        ensure_live(&inner, MockOperation::Connect, sink)?;
        if let Some(element) = inner.elements.get_mut(source) {
            element.sinks.push(sink.clone());
        }
        Ok(())
    }

    async fn process_offer(&self, endpoint: &ElementId, offer: &str) -> Result<String, BcError> {
        self
            .enter(MockOperation::ProcessOffer, Some(endpoint))
            .await?;
        let mut inner = self.server.inner();
        ensure_live(&inner, MockOperation::ProcessOffer, endpoint)?;
        if let Some(element) = inner.elements.get_mut(endpoint) {
            element.offers.push(offer.to_string());
        }
        Ok(MockMediaServer::answer_for(endpoint))
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &ElementId,
        candidate: &IceCandidate,
    ) -> Result<(), BcError> {
        self
            .enter(MockOperation::AddIceCandidate, Some(endpoint))
            .await?;
        let mut inner = self.server.inner();
        ensure_live(&inner, MockOperation::AddIceCandidate, endpoint)?;
        if let Some(element) = inner.elements.get_mut(endpoint) {
            element.remote_candidates.push(candidate.clone());
        }
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &ElementId) -> Result<(), BcError> {
        self
            .enter(MockOperation::GatherCandidates, Some(endpoint))
            .await?;
        let inner = self.server.inner();
        ensure_live(&inner, MockOperation::GatherCandidates, endpoint)?;
        if let Some(tx) = inner.subscriptions.get(endpoint) {
            let _ = tx.send(MockMediaServer::gathered_candidate(endpoint));
        }
        Ok(())
    }

    async fn subscribe_ice_candidates(
        &self,
        endpoint: &ElementId,
    ) -> Result<CandidateStream, BcError> {
        self
            .enter(MockOperation::Subscribe, Some(endpoint))
            .await?;
        let mut inner = self.server.inner();
        ensure_live(&inner, MockOperation::Subscribe, endpoint)?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscriptions.insert(endpoint.clone(), tx);
        Ok(rx)
    }

    async fn release(&self, element: &ElementId) -> Result<(), BcError> {
        self
            .enter(MockOperation::Release, Some(element))
            .await?;
        let mut inner = self.server.inner();
        ensure_live(&inner, MockOperation::Release, element)?;

        let mut released = vec![element.clone()];
        let children: Vec<ElementId> = inner
            .elements
            .iter()
            .filter(|(_, e)| e.pipeline.as_deref() == Some(element.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        released.extend(children);

        for id in &released {
            if let Some(e) = inner.elements.get_mut(id) {
                e.released = true;
            }
            inner.subscriptions.remove(id);
        }
        Ok(())
    }

    async fn close(&self) {
        self.server.inner().subscriptions.clear();
        self.server.state.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.server.state.generation.load(Ordering::SeqCst) != self.generation
    }
}
