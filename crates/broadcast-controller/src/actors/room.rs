//! `RoomActor` - one per room, owns the room's presenter and viewers.
//!
//! Every mutation of a room goes through this actor's mailbox, so slot
//! reservation, candidate routing, viewer wiring and teardown never
//! interleave. Handshakes run outside the actor and talk to it between remote
//! calls; each slot carries an epoch so a handshake can tell whether the slot
//! it reserved is still its own after a suspension point.
//!
//! The room owns the presenter's pipeline from the moment it is attached.
//! Releasing it on stop or shutdown takes every endpoint under it along, so
//! viewer endpoints are only released individually when a single viewer
//! leaves.

use super::messages::{
    PresenterInfo, RegistryMessage, RoomMessage, RoomState, ViewerInfo, ViewerTicket,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::backend::{BackendHandle, ElementId, IceCandidate, MediaClient, SessionLease};
use crate::candidates::{CandidateQueue, SessionId};
use crate::errors::BcError;
use crate::observability::metrics::{record_candidate_dropped, record_candidate_queued};
use crate::signaling::protocol::{Outbound, ServerMessage};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How long a `stopCommunication` notice waits for room in a full viewer queue.
const STOP_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a `RoomActor`.
///
/// A closed mailbox or a dropped reply means the room retired (or the process
/// is shutting down); both surface as [`BcError::RoomRetired`].
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    instance: u64,
    mailbox: Arc<MailboxMonitor>,
}

impl fmt::Debug for RoomActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomActorHandle")
            .field("room_id", &self.room_id)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Registry-assigned instance number; a re-created room gets a new one.
    #[must_use]
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Whether the actor stopped accepting messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, BcError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self.sender.send(build(tx)).await.is_err() {
            self.mailbox.record_dequeue();
            return Err(BcError::RoomRetired);
        }
        rx.await.map_err(|_| BcError::RoomRetired)
    }

    /// Claim the presenter slot. Returns the slot epoch.
    pub async fn reserve_presenter(
        &self,
        session_id: SessionId,
        outbound: Outbound,
        lease: SessionLease,
    ) -> Result<u64, BcError> {
        self.request(|respond_to| RoomMessage::ReservePresenter {
            session_id,
            outbound,
            lease,
            respond_to,
        })
        .await?
    }

    /// Hand the presenter's pipeline to the room.
    ///
    /// On error the slot is gone and the caller still owns (and must release)
    /// the pipeline.
    pub async fn attach_pipeline(
        &self,
        session_id: SessionId,
        epoch: u64,
        client: Arc<dyn MediaClient>,
        pipeline: ElementId,
    ) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::AttachPipeline {
            session_id,
            epoch,
            client,
            pipeline,
            respond_to,
        })
        .await?
    }

    pub async fn attach_presenter_endpoint(
        &self,
        session_id: SessionId,
        epoch: u64,
        endpoint: ElementId,
        filter: ElementId,
    ) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::AttachPresenterEndpoint {
            session_id,
            epoch,
            endpoint,
            filter,
            respond_to,
        })
        .await?
    }

    pub async fn check_presenter(&self, session_id: SessionId, epoch: u64) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::CheckPresenter {
            session_id,
            epoch,
            respond_to,
        })
        .await?
    }

    pub async fn abort_presenter(&self, session_id: SessionId, epoch: u64) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::AbortPresenter {
            session_id,
            epoch,
            respond_to,
        })
        .await
    }

    /// Claim a viewer slot under the current presenter.
    pub async fn begin_viewer(
        &self,
        session_id: SessionId,
        outbound: Outbound,
        lease: SessionLease,
    ) -> Result<ViewerTicket, BcError> {
        self.request(|respond_to| RoomMessage::BeginViewer {
            session_id,
            outbound,
            lease,
            respond_to,
        })
        .await?
    }

    /// Record the viewer's endpoint. On error the caller still owns it.
    pub async fn register_viewer(
        &self,
        session_id: SessionId,
        epoch: u64,
        endpoint: ElementId,
    ) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::RegisterViewer {
            session_id,
            epoch,
            endpoint,
            respond_to,
        })
        .await?
    }

    pub async fn check_viewer(&self, session_id: SessionId, epoch: u64) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::CheckViewer {
            session_id,
            epoch,
            respond_to,
        })
        .await?
    }

    pub async fn wire_viewer(&self, session_id: SessionId, epoch: u64) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::WireViewer {
            session_id,
            epoch,
            respond_to,
        })
        .await?
    }

    pub async fn abort_viewer(&self, session_id: SessionId, epoch: u64) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::AbortViewer {
            session_id,
            epoch,
            respond_to,
        })
        .await
    }

    /// Tear down whatever the session holds in this room. Idempotent.
    pub async fn stop(&self, session_id: SessionId) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::Stop {
            session_id,
            respond_to,
        })
        .await
    }

    /// Route a remote ICE candidate. Returns once the room has forwarded or
    /// queued it, or [`BcError::RoomRetired`] if the room exited first.
    pub async fn ice_candidate(
        &self,
        session_id: SessionId,
        candidate: IceCandidate,
    ) -> Result<(), BcError> {
        self.request(|respond_to| RoomMessage::IceCandidate {
            session_id,
            candidate,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<RoomState, BcError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Ask the room to exit if it is idle. Returns its instance if it retired.
    pub async fn try_retire(&self) -> Result<Option<u64>, BcError> {
        self.request(|respond_to| RoomMessage::TryRetire { respond_to })
            .await
    }

    /// Cancel the actor; it releases everything it owns before exiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The presenter slot, from reservation to teardown.
struct PresenterSlot {
    session_id: SessionId,
    epoch: u64,
    outbound: Outbound,
    client: Option<Arc<dyn MediaClient>>,
    pipeline: Option<ElementId>,
    endpoint: Option<ElementId>,
    filter: Option<ElementId>,
    _lease: SessionLease,
}

impl PresenterSlot {
    fn matches(&self, session_id: &str, epoch: u64) -> bool {
        self.session_id == session_id && self.epoch == epoch
    }

    fn is_ready(&self) -> bool {
        self.filter.is_some()
    }

    fn to_info(&self) -> PresenterInfo {
        PresenterInfo {
            session_id: self.session_id.clone(),
            pipeline: self.pipeline.clone(),
            endpoint: self.endpoint.clone(),
            ready: self.is_ready(),
        }
    }
}

struct ViewerSlot {
    epoch: u64,
    outbound: Outbound,
    endpoint: Option<ElementId>,
    wired: bool,
    _lease: SessionLease,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    instance: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Weak so rooms never keep the registry mailbox open.
    registry: mpsc::WeakSender<RegistryMessage>,
    backend: Arc<BackendHandle>,
    presenter: Option<PresenterSlot>,
    viewers: HashMap<SessionId, ViewerSlot>,
    candidates: CandidateQueue,
    next_epoch: u64,
    /// `RoomIdle` already sent for the current idle period.
    idle_notified: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        instance: u64,
        cancel_token: CancellationToken,
        registry: mpsc::WeakSender<RegistryMessage>,
        backend: Arc<BackendHandle>,
        metrics: Arc<ActorMetrics>,
        candidate_limit: usize,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Room, &room_id));

        let actor = Self {
            room_id: room_id.clone(),
            instance,
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            backend,
            presenter: None,
            viewers: HashMap::new(),
            candidates: CandidateQueue::with_limit(candidate_limit),
            next_epoch: 1,
            idle_notified: false,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            instance,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "bc.actor.room", fields(room_id = %self.room_id, instance = self.instance))]
    async fn run(mut self) {
        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "bc.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RoomMessage::TryRetire { respond_to }) => {
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if self.is_idle() {
                                let _ = respond_to.send(Some(self.instance));
                                self.retire().await;
                                break;
                            }
                            // Busy again; a later idle period notifies anew.
                            self.idle_notified = false;
                            let _ = respond_to.send(None);
                        }
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            self.notify_if_idle();
                        }
                        None => {
                            debug!(
                                target: "bc.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::ReservePresenter {
                session_id,
                outbound,
                lease,
                respond_to,
            } => {
                let result = self.reserve_presenter(session_id, outbound, lease);
                let _ = respond_to.send(result);
            }

            RoomMessage::AttachPipeline {
                session_id,
                epoch,
                client,
                pipeline,
                respond_to,
            } => {
                let result = match self.presenter.as_mut() {
                    Some(slot) if slot.matches(&session_id, epoch) => {
                        slot.client = Some(client);
                        slot.pipeline = Some(pipeline);
                        Ok(())
                    }
                    _ => Err(BcError::NoActivePresenter),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::AttachPresenterEndpoint {
                session_id,
                epoch,
                endpoint,
                filter,
                respond_to,
            } => {
                let result = self
                    .attach_presenter_endpoint(&session_id, epoch, endpoint, filter)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CheckPresenter {
                session_id,
                epoch,
                respond_to,
            } => {
                let result = match &self.presenter {
                    Some(slot) if slot.matches(&session_id, epoch) => Ok(()),
                    _ => Err(BcError::NoActivePresenter),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::AbortPresenter {
                session_id,
                epoch,
                respond_to,
            } => {
                if self
                    .presenter
                    .as_ref()
                    .is_some_and(|slot| slot.matches(&session_id, epoch))
                {
                    self.teardown_presenter().await;
                    self.candidates.discard(&session_id);
                    self.backend.close_if_idle().await;
                }
                let _ = respond_to.send(());
            }

            RoomMessage::BeginViewer {
                session_id,
                outbound,
                lease,
                respond_to,
            } => {
                let result = self.begin_viewer(session_id, outbound, lease);
                let _ = respond_to.send(result);
            }

            RoomMessage::RegisterViewer {
                session_id,
                epoch,
                endpoint,
                respond_to,
            } => {
                let result = self.register_viewer(&session_id, epoch, endpoint).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CheckViewer {
                session_id,
                epoch,
                respond_to,
            } => {
                let result = match self.viewers.get(&session_id) {
                    Some(slot) if slot.epoch == epoch => Ok(()),
                    _ => Err(BcError::NoActivePresenter),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::WireViewer {
                session_id,
                epoch,
                respond_to,
            } => {
                let result = self.wire_viewer(&session_id, epoch).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::AbortViewer {
                session_id,
                epoch,
                respond_to,
            } => {
                if self
                    .viewers
                    .get(&session_id)
                    .is_some_and(|slot| slot.epoch == epoch)
                {
                    self.remove_viewer(&session_id).await;
                    self.candidates.discard(&session_id);
                    self.backend.close_if_idle().await;
                }
                let _ = respond_to.send(());
            }

            RoomMessage::Stop {
                session_id,
                respond_to,
            } => {
                self.stop(&session_id).await;
                let _ = respond_to.send(());
            }

            RoomMessage::IceCandidate {
                session_id,
                candidate,
                respond_to,
            } => {
                self.route_candidate(&session_id, candidate).await;
                let _ = respond_to.send(());
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            // Handled in the run loop
            RoomMessage::TryRetire { respond_to } => {
                let _ = respond_to.send(None);
            }
        }
    }

    fn next_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    fn reserve_presenter(
        &mut self,
        session_id: SessionId,
        outbound: Outbound,
        lease: SessionLease,
    ) -> Result<u64, BcError> {
        if self.presenter.is_some() {
            return Err(BcError::PresenterConflict);
        }
        if self.viewers.contains_key(&session_id) {
            return Err(BcError::SessionConflict);
        }

        let epoch = self.next_epoch();
        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            epoch = epoch,
            "Presenter slot reserved"
        );
        self.presenter = Some(PresenterSlot {
            session_id,
            epoch,
            outbound,
            client: None,
            pipeline: None,
            endpoint: None,
            filter: None,
            _lease: lease,
        });
        Ok(epoch)
    }

    async fn attach_presenter_endpoint(
        &mut self,
        session_id: &str,
        epoch: u64,
        endpoint: ElementId,
        filter: ElementId,
    ) -> Result<(), BcError> {
        let Some(slot) = self
            .presenter
            .as_mut()
            .filter(|slot| slot.matches(session_id, epoch))
        else {
            return Err(BcError::NoActivePresenter);
        };
        let Some(client) = slot.client.clone() else {
            return Err(BcError::Internal(
                "presenter endpoint attached before pipeline".to_string(),
            ));
        };

        slot.endpoint = Some(endpoint.clone());
        slot.filter = Some(filter);

        let queued = self.candidates.take(session_id);
        if !queued.is_empty() {
            debug!(
                target: "bc.actor.room",
                room_id = %self.room_id,
                session_id = %session_id,
                count = queued.len(),
                "Flushing queued candidates to presenter endpoint"
            );
        }
        for candidate in queued {
            self.add_candidate(client.as_ref(), &endpoint, session_id, &candidate)
                .await;
        }

        info!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            "Presenter ready"
        );
        Ok(())
    }

    fn begin_viewer(
        &mut self,
        session_id: SessionId,
        outbound: Outbound,
        lease: SessionLease,
    ) -> Result<ViewerTicket, BcError> {
        let Some(presenter) = self.presenter.as_ref() else {
            return Err(BcError::NoActivePresenter);
        };
        if presenter.session_id == session_id || self.viewers.contains_key(&session_id) {
            return Err(BcError::SessionConflict);
        }
        let (Some(client), Some(pipeline), true) = (
            presenter.client.clone(),
            presenter.pipeline.clone(),
            presenter.is_ready(),
        ) else {
            return Err(BcError::NoActivePresenter);
        };

        let epoch = self.next_epoch();
        self.viewers.insert(
            session_id,
            ViewerSlot {
                epoch,
                outbound,
                endpoint: None,
                wired: false,
                _lease: lease,
            },
        );

        Ok(ViewerTicket {
            epoch,
            client,
            pipeline,
        })
    }

    async fn register_viewer(
        &mut self,
        session_id: &str,
        epoch: u64,
        endpoint: ElementId,
    ) -> Result<(), BcError> {
        let Some(client) = self.presenter_client() else {
            return Err(BcError::NoActivePresenter);
        };
        let Some(slot) = self
            .viewers
            .get_mut(session_id)
            .filter(|slot| slot.epoch == epoch && slot.endpoint.is_none())
        else {
            return Err(BcError::NoActivePresenter);
        };
        slot.endpoint = Some(endpoint.clone());

        for candidate in self.candidates.take(session_id) {
            self.add_candidate(client.as_ref(), &endpoint, session_id, &candidate)
                .await;
        }

        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            "Viewer endpoint registered"
        );
        Ok(())
    }

    async fn wire_viewer(&mut self, session_id: &str, epoch: u64) -> Result<(), BcError> {
        let (Some(client), Some(filter)) = (
            self.presenter_client(),
            self.presenter.as_ref().and_then(|p| p.filter.clone()),
        ) else {
            return Err(BcError::NoActivePresenter);
        };
        let Some(endpoint) = self
            .viewers
            .get(session_id)
            .filter(|slot| slot.epoch == epoch)
            .and_then(|slot| slot.endpoint.clone())
        else {
            return Err(BcError::NoActivePresenter);
        };

        client.connect(&filter, &endpoint).await?;

        if let Some(slot) = self.viewers.get_mut(session_id) {
            slot.wired = true;
        }
        info!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            viewers = self.viewers.len(),
            "Viewer wired to presenter"
        );
        Ok(())
    }

    async fn stop(&mut self, session_id: &str) {
        let is_presenter = self
            .presenter
            .as_ref()
            .is_some_and(|slot| slot.session_id == session_id);

        let removed = if is_presenter {
            self.teardown_presenter().await;
            true
        } else {
            self.remove_viewer(session_id).await
        };

        let discarded = self.candidates.discard(session_id);
        if discarded > 0 {
            debug!(
                target: "bc.actor.room",
                room_id = %self.room_id,
                session_id = %session_id,
                discarded = discarded,
                "Discarded queued candidates"
            );
        }

        if removed {
            self.backend.close_if_idle().await;
        }
    }

    /// Notify viewers, release the pipeline and clear the room.
    async fn teardown_presenter(&mut self) {
        let Some(presenter) = self.presenter.take() else {
            return;
        };

        let viewer_count = self.viewers.len();
        for (viewer_session, viewer) in self.viewers.drain() {
            notify_presenter_gone(&self.room_id, &viewer_session, viewer.outbound);
            self.candidates.discard(&viewer_session);
        }

        if let (Some(client), Some(pipeline)) = (&presenter.client, &presenter.pipeline) {
            if let Err(e) = client.release(pipeline).await {
                warn!(
                    target: "bc.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Failed to release presenter pipeline"
                );
            }
        }

        info!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            session_id = %presenter.session_id,
            viewers = viewer_count,
            "Presenter stopped"
        );
        // Dropping the slot returns its lease; viewer leases went with drain().
        drop(presenter);
    }

    /// Remove a viewer, releasing its endpoint. Returns false if unknown.
    async fn remove_viewer(&mut self, session_id: &str) -> bool {
        let Some(viewer) = self.viewers.remove(session_id) else {
            return false;
        };

        if let (Some(client), Some(endpoint)) = (self.presenter_client(), &viewer.endpoint) {
            if let Err(e) = client.release(endpoint).await {
                warn!(
                    target: "bc.actor.room",
                    room_id = %self.room_id,
                    session_id = %session_id,
                    error = %e,
                    "Failed to release viewer endpoint"
                );
            }
        }

        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            viewers = self.viewers.len(),
            "Viewer removed"
        );
        true
    }

    async fn route_candidate(&mut self, session_id: &str, candidate: IceCandidate) {
        let endpoint = match &self.presenter {
            Some(slot) if slot.session_id == session_id => slot.endpoint.clone(),
            _ => self
                .viewers
                .get(session_id)
                .and_then(|slot| slot.endpoint.clone()),
        };

        match (endpoint, self.presenter_client()) {
            (Some(endpoint), Some(client)) => {
                self.add_candidate(client.as_ref(), &endpoint, session_id, &candidate)
                    .await;
            }
            _ => {
                let candidate_len = candidate.candidate.len();
                if self.candidates.push(session_id, candidate) {
                    record_candidate_queued();
                } else {
                    record_candidate_dropped();
                    warn!(
                        target: "bc.actor.room",
                        room_id = %self.room_id,
                        session_id = %session_id,
                        candidate_len = candidate_len,
                        limit = self.candidates.limit(),
                        "Candidate queue full, dropping ICE candidate"
                    );
                }
            }
        }
    }

    async fn add_candidate(
        &self,
        client: &dyn MediaClient,
        endpoint: &ElementId,
        session_id: &str,
        candidate: &IceCandidate,
    ) {
        if let Err(e) = client.add_ice_candidate(endpoint, candidate).await {
            warn!(
                target: "bc.actor.room",
                room_id = %self.room_id,
                session_id = %session_id,
                candidate_len = candidate.candidate.len(),
                error = %e,
                "Failed to add ICE candidate"
            );
        }
    }

    fn presenter_client(&self) -> Option<Arc<dyn MediaClient>> {
        self.presenter.as_ref().and_then(|slot| slot.client.clone())
    }

    fn is_idle(&self) -> bool {
        self.presenter.is_none() && self.viewers.is_empty() && self.candidates.is_empty()
    }

    fn notify_if_idle(&mut self) {
        if !self.is_idle() {
            self.idle_notified = false;
            return;
        }
        if self.idle_notified {
            return;
        }

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let notice = RegistryMessage::RoomIdle {
            room_id: self.room_id.clone(),
            instance: self.instance,
        };
        if registry.try_send(notice).is_ok() {
            self.idle_notified = true;
        }
    }

    fn get_state(&self) -> RoomState {
        let mut viewers: Vec<ViewerInfo> = self
            .viewers
            .iter()
            .map(|(session_id, slot)| ViewerInfo {
                session_id: session_id.clone(),
                endpoint: slot.endpoint.clone(),
                wired: slot.wired,
            })
            .collect();
        viewers.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        RoomState {
            room_id: self.room_id.clone(),
            presenter: self.presenter.as_ref().map(PresenterSlot::to_info),
            viewers,
            queued_candidates: self.candidates.total(),
        }
    }

    /// Stop taking messages and answer whatever is still queued.
    async fn retire(&mut self) {
        self.receiver.close();
        let mut rejected = 0usize;
        while let Some(message) = self.receiver.recv().await {
            self.mailbox.record_dequeue();
            rejected += 1;
            reject_retired(message);
        }

        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            instance = self.instance,
            rejected = rejected,
            "Room retired"
        );
    }

    async fn graceful_shutdown(&mut self) {
        debug!(
            target: "bc.actor.room",
            room_id = %self.room_id,
            has_presenter = self.presenter.is_some(),
            viewers = self.viewers.len(),
            "Performing graceful shutdown"
        );

        self.teardown_presenter().await;
        self.candidates = CandidateQueue::with_limit(self.candidates.limit());
        self.receiver.close();
        while let Some(message) = self.receiver.recv().await {
            self.mailbox.record_dequeue();
            reject_retired(message);
        }
    }
}

/// Send `stopCommunication` to a viewer whose presenter left.
///
/// A viewer with a full outbound queue gets the notice from a background
/// task that waits up to [`STOP_NOTICE_TIMEOUT`], off the actor.
fn notify_presenter_gone(room_id: &str, session_id: &str, outbound: Outbound) {
    match outbound.try_send(ServerMessage::StopCommunication) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(message)) => {
            let room_id = room_id.to_string();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if outbound.send_timeout(message, STOP_NOTICE_TIMEOUT).await.is_err() {
                    warn!(
                        target: "bc.actor.room",
                        room_id = %room_id,
                        session_id = %session_id,
                        "Viewer queue stayed full, stopCommunication not delivered"
                    );
                }
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                target: "bc.actor.room",
                room_id = %room_id,
                session_id = %session_id,
                "Viewer connection gone, stopCommunication not delivered"
            );
        }
    }
}

/// Answer a message that arrived after the room stopped serving.
fn reject_retired(message: RoomMessage) {
    match message {
        RoomMessage::ReservePresenter { respond_to, .. } => {
            let _ = respond_to.send(Err(BcError::RoomRetired));
        }
        RoomMessage::BeginViewer { respond_to, .. } => {
            let _ = respond_to.send(Err(BcError::RoomRetired));
        }
        RoomMessage::AttachPipeline { respond_to, .. }
        | RoomMessage::AttachPresenterEndpoint { respond_to, .. }
        | RoomMessage::CheckPresenter { respond_to, .. }
        | RoomMessage::RegisterViewer { respond_to, .. }
        | RoomMessage::CheckViewer { respond_to, .. }
        | RoomMessage::WireViewer { respond_to, .. } => {
            let _ = respond_to.send(Err(BcError::RoomRetired));
        }
        RoomMessage::AbortPresenter { respond_to, .. }
        | RoomMessage::AbortViewer { respond_to, .. }
        | RoomMessage::Stop { respond_to, .. } => {
            let _ = respond_to.send(());
        }
        RoomMessage::TryRetire { respond_to } => {
            let _ = respond_to.send(None);
        }
        // Dropped replies reach the caller as RoomRetired.
        RoomMessage::IceCandidate { .. } | RoomMessage::GetState { .. } => {}
    }
}
