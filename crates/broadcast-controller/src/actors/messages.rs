//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use crate::backend::{ElementId, IceCandidate, MediaClient, SessionLease};
use crate::candidates::SessionId;
use crate::errors::BcError;
use crate::signaling::protocol::Outbound;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room's actor handle, spawning it if the room is unknown.
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<super::RoomActorHandle, BcError>>,
    },

    /// Return the room's actor handle, or `RoomNotFound`.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<super::RoomActorHandle, BcError>>,
    },

    /// A room has no presenter, viewers or queued candidates.
    RoomIdle { room_id: String, instance: u64 },

    /// A room actor agreed to retire; drop it if it is still the registered instance.
    RoomRetired { room_id: String, instance: u64 },

    /// Current registry status.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and cancel every room actor.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },
}

/// Messages sent to `RoomActor`.
pub enum RoomMessage {
    /// Claim the presenter slot before any media server call.
    ReservePresenter {
        session_id: SessionId,
        outbound: Outbound,
        lease: SessionLease,
        respond_to: oneshot::Sender<Result<u64, BcError>>,
    },

    /// Hand the presenter's pipeline to the room, which owns it from now on.
    AttachPipeline {
        session_id: SessionId,
        epoch: u64,
        client: Arc<dyn MediaClient>,
        pipeline: ElementId,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },

    /// Record the presenter's endpoint and wired filter, flushing queued candidates.
    AttachPresenterEndpoint {
        session_id: SessionId,
        epoch: u64,
        endpoint: ElementId,
        filter: ElementId,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },

    /// Verify the presenter slot still belongs to this handshake.
    CheckPresenter {
        session_id: SessionId,
        epoch: u64,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },

    /// A presenter handshake failed; release whatever the room owns for it.
    AbortPresenter {
        session_id: SessionId,
        epoch: u64,
        respond_to: oneshot::Sender<()>,
    },

    /// Claim a viewer slot under the current presenter.
    BeginViewer {
        session_id: SessionId,
        outbound: Outbound,
        lease: SessionLease,
        respond_to: oneshot::Sender<Result<ViewerTicket, BcError>>,
    },

    /// Record a viewer's endpoint, flushing queued candidates.
    RegisterViewer {
        session_id: SessionId,
        epoch: u64,
        endpoint: ElementId,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },

    /// Verify the viewer slot still belongs to this handshake.
    CheckViewer {
        session_id: SessionId,
        epoch: u64,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },

    /// Connect the presenter's filter output to the viewer's endpoint.
    WireViewer {
        session_id: SessionId,
        epoch: u64,
        respond_to: oneshot::Sender<Result<(), BcError>>,
    },

    /// A viewer handshake failed; release its endpoint if the room owns it.
    AbortViewer {
        session_id: SessionId,
        epoch: u64,
        respond_to: oneshot::Sender<()>,
    },

    /// Tear down whatever the session holds in this room.
    Stop {
        session_id: SessionId,
        respond_to: oneshot::Sender<()>,
    },

    /// Route a remote ICE candidate to the session's endpoint or queue it.
    IceCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
        respond_to: oneshot::Sender<()>,
    },

    /// Current room state.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Registry asks an idle room to exit. Replies with the instance id if retired.
    TryRetire {
        respond_to: oneshot::Sender<Option<u64>>,
    },
}

impl fmt::Debug for RoomMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomMessage::ReservePresenter { .. } => "ReservePresenter",
            RoomMessage::AttachPipeline { .. } => "AttachPipeline",
            RoomMessage::AttachPresenterEndpoint { .. } => "AttachPresenterEndpoint",
            RoomMessage::CheckPresenter { .. } => "CheckPresenter",
            RoomMessage::AbortPresenter { .. } => "AbortPresenter",
            RoomMessage::BeginViewer { .. } => "BeginViewer",
            RoomMessage::RegisterViewer { .. } => "RegisterViewer",
            RoomMessage::CheckViewer { .. } => "CheckViewer",
            RoomMessage::WireViewer { .. } => "WireViewer",
            RoomMessage::AbortViewer { .. } => "AbortViewer",
            RoomMessage::Stop { .. } => "Stop",
            RoomMessage::IceCandidate { .. } => "IceCandidate",
            RoomMessage::GetState { .. } => "GetState",
            RoomMessage::TryRetire { .. } => "TryRetire",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Granted viewer slot: what the viewer handshake needs to build its endpoint.
#[derive(Clone)]
pub struct ViewerTicket {
    /// Identifies this viewer slot; stale once the viewer or presenter stops.
    pub epoch: u64,
    /// The presenter's media server client.
    pub client: Arc<dyn MediaClient>,
    /// The presenter's pipeline, which the viewer endpoint joins.
    pub pipeline: ElementId,
}

impl fmt::Debug for ViewerTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerTicket")
            .field("epoch", &self.epoch)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Presenter summary within a [`RoomState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenterInfo {
    pub session_id: SessionId,
    pub pipeline: Option<ElementId>,
    pub endpoint: Option<ElementId>,
    /// Filter wired; viewers may join.
    pub ready: bool,
}

/// Viewer summary within a [`RoomState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerInfo {
    pub session_id: SessionId,
    pub endpoint: Option<ElementId>,
    /// Filter output connected to the endpoint.
    pub wired: bool,
}

/// Snapshot of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub presenter: Option<PresenterInfo>,
    pub viewers: Vec<ViewerInfo>,
    pub queued_candidates: usize,
}

impl RoomState {
    /// No presenter, no viewers, nothing queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.presenter.is_none() && self.viewers.is_empty() && self.queued_candidates == 0
    }
}

/// Registry status (for health and tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub is_shutting_down: bool,
    pub mailbox_depth: usize,
}
