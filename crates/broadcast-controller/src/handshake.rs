//! Presenter and viewer handshakes, teardown and ICE routing.
//!
//! A handshake is a straight-line sequence of media server calls. State lives
//! in the room actor; between calls the handshake checks back with the room
//! using the epoch it was granted, and stops with `NoActivePresenter` as soon
//! as its slot is gone. Whatever the handshake created and the room does not
//! own yet is released before the error is returned; whatever the room owns
//! is released by the room (`abort_*`).
//!
//! Each handshake holds a [`SessionLease`](crate::backend::SessionLease) while
//! it runs, so a concurrent teardown elsewhere never closes the media server
//! connection under it. Once a failed handshake has unwound, the backend is
//! closed if nothing else is active.

use crate::actors::{RoomActorHandle, RoomRegistryHandle, ViewerTicket};
use crate::backend::{
    BackendHandle, CandidateStream, ElementId, IceCandidate, MediaClient, OverlayConfig,
    SessionLease,
};
use crate::candidates::SessionId;
use crate::errors::BcError;
use crate::observability::metrics::{record_handshake, record_handshake_failure};
use crate::signaling::protocol::{Outbound, ServerMessage};

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

const ROLE_PRESENTER: &str = "presenter";
const ROLE_VIEWER: &str = "viewer";

/// Runs handshakes against the room registry and the shared media server.
#[derive(Clone)]
pub struct HandshakeEngine {
    registry: RoomRegistryHandle,
    backend: Arc<BackendHandle>,
    overlay: Arc<OverlayConfig>,
}

impl HandshakeEngine {
    #[must_use]
    pub fn new(
        registry: RoomRegistryHandle,
        backend: Arc<BackendHandle>,
        overlay: OverlayConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            overlay: Arc::new(overlay),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<BackendHandle> {
        &self.backend
    }

    /// Make `session_id` the presenter of `room_id`. Returns the SDP answer.
    ///
    /// Local ICE candidates of the presenter endpoint are pushed to
    /// `outbound` as `iceCandidate` messages.
    pub async fn become_presenter(
        &self,
        session_id: &str,
        room_id: &str,
        sdp_offer: &str,
        outbound: Outbound,
    ) -> Result<String, BcError> {
        let reservation = self.reserve_presenter(session_id, room_id, outbound).await?;
        self.complete_presenter(reservation, sdp_offer).await
    }

    /// Claim the presenter slot of `room_id` without touching the media server.
    ///
    /// The signaling layer awaits this inline, so a `stop` or disconnect that
    /// follows the offer always finds the slot. A failed reservation is
    /// recorded as a rejected handshake.
    #[instrument(skip_all, name = "bc.handshake.reserve_presenter", fields(session_id = %session_id, room_id = %room_id))]
    pub async fn reserve_presenter(
        &self,
        session_id: &str,
        room_id: &str,
        outbound: Outbound,
    ) -> Result<PresenterReservation, BcError> {
        let started = Instant::now();
        let in_flight = self.backend.lease();
        match self.claim_presenter(session_id, room_id, &outbound).await {
            Ok((room, epoch)) => Ok(PresenterReservation {
                room,
                session_id: session_id.to_string(),
                epoch,
                outbound,
                started,
                in_flight,
            }),
            Err(e) => {
                drop(in_flight);
                self.reject(ROLE_PRESENTER, session_id, room_id, started, &e).await;
                Err(e)
            }
        }
    }

    /// Run the media server side of a reserved presenter. Returns the SDP answer.
    #[instrument(skip_all, name = "bc.handshake.presenter", fields(session_id = %reservation.session_id, room_id = %reservation.room.room_id()))]
    pub async fn complete_presenter(
        &self,
        reservation: PresenterReservation,
        sdp_offer: &str,
    ) -> Result<String, BcError> {
        let PresenterReservation {
            room,
            session_id,
            epoch,
            outbound,
            started,
            in_flight,
        } = reservation;

        let result = match self
            .build_presenter(&room, &session_id, epoch, sdp_offer, &outbound)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => {
                // A concurrent stop releases our elements, failing backend calls.
                // Report the stop rather than the backend error.
                let e = match room.check_presenter(session_id.clone(), epoch).await {
                    Err(BcError::NoActivePresenter | BcError::RoomRetired) => {
                        BcError::NoActivePresenter
                    }
                    _ => e,
                };
                let _ = room.abort_presenter(session_id.clone(), epoch).await;
                Err(e)
            }
        };

        drop(in_flight);
        self.finish(ROLE_PRESENTER, &session_id, room.room_id(), started, result)
            .await
    }

    /// Attach `session_id` as a viewer of `room_id`. Returns the SDP answer.
    pub async fn become_viewer(
        &self,
        session_id: &str,
        room_id: &str,
        sdp_offer: &str,
        outbound: Outbound,
    ) -> Result<String, BcError> {
        let reservation = self.reserve_viewer(session_id, room_id, outbound).await?;
        self.complete_viewer(reservation, sdp_offer).await
    }

    /// Claim a viewer slot under the current presenter of `room_id`.
    #[instrument(skip_all, name = "bc.handshake.reserve_viewer", fields(session_id = %session_id, room_id = %room_id))]
    pub async fn reserve_viewer(
        &self,
        session_id: &str,
        room_id: &str,
        outbound: Outbound,
    ) -> Result<ViewerReservation, BcError> {
        let started = Instant::now();
        let in_flight = self.backend.lease();
        match self.claim_viewer(session_id, room_id, &outbound).await {
            Ok((room, ticket)) => Ok(ViewerReservation {
                room,
                session_id: session_id.to_string(),
                ticket,
                outbound,
                started,
                in_flight,
            }),
            Err(e) => {
                drop(in_flight);
                self.reject(ROLE_VIEWER, session_id, room_id, started, &e).await;
                Err(e)
            }
        }
    }

    /// Run the media server side of a reserved viewer. Returns the SDP answer.
    #[instrument(skip_all, name = "bc.handshake.viewer", fields(session_id = %reservation.session_id, room_id = %reservation.room.room_id()))]
    pub async fn complete_viewer(
        &self,
        reservation: ViewerReservation,
        sdp_offer: &str,
    ) -> Result<String, BcError> {
        let ViewerReservation {
            room,
            session_id,
            ticket,
            outbound,
            started,
            in_flight,
        } = reservation;

        let result = match self
            .build_viewer(&room, &session_id, &ticket, sdp_offer, &outbound)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => {
                let e = match room.check_viewer(session_id.clone(), ticket.epoch).await {
                    Err(BcError::NoActivePresenter | BcError::RoomRetired) => {
                        BcError::NoActivePresenter
                    }
                    _ => e,
                };
                let _ = room.abort_viewer(session_id.clone(), ticket.epoch).await;
                Err(e)
            }
        };

        drop(in_flight);
        self.finish(ROLE_VIEWER, &session_id, room.room_id(), started, result)
            .await
    }

    /// Tear down whatever `session_id` holds in `room_id`. Never fails.
    pub async fn stop(&self, session_id: &str, room_id: &str) {
        match self.registry.get_room(room_id).await {
            Ok(room) => {
                if let Err(e) = room.stop(session_id.to_string()).await {
                    debug!(
                        target: "bc.handshake",
                        session_id = %session_id,
                        room_id = %room_id,
                        error = %e,
                        "Stop reached a retired room"
                    );
                }
            }
            Err(BcError::RoomNotFound(_)) => {}
            Err(e) => {
                warn!(
                    target: "bc.handshake",
                    session_id = %session_id,
                    room_id = %room_id,
                    error = %e,
                    "Stop failed"
                );
            }
        }
    }

    /// Route a remote ICE candidate. Candidates for unknown rooms are dropped.
    pub async fn on_ice_candidate(&self, session_id: &str, room_id: &str, candidate: IceCandidate) {
        let room = match self.registry.get_room(room_id).await {
            Ok(room) => room,
            Err(e) => {
                debug!(
                    target: "bc.handshake",
                    session_id = %session_id,
                    room_id = %room_id,
                    error = %e,
                    "Dropping ICE candidate"
                );
                return;
            }
        };
        self.route_candidate(room, session_id, candidate).await;
    }

    /// Send a candidate to a room already looked up.
    async fn route_candidate(
        &self,
        room: RoomActorHandle,
        session_id: &str,
        candidate: IceCandidate,
    ) {
        match room.ice_candidate(session_id.to_string(), candidate.clone()).await {
            Ok(()) => {}
            Err(BcError::RoomRetired) => {
                // Retired between lookup and delivery. The room was known when
                // the candidate arrived, so queue it in the room's successor.
                match self.registry.get_or_create_room(room.room_id()).await {
                    Ok(room) => {
                        if let Err(e) = room.ice_candidate(session_id.to_string(), candidate).await
                        {
                            debug!(
                                target: "bc.handshake",
                                session_id = %session_id,
                                room_id = %room.room_id(),
                                error = %e,
                                "Dropping ICE candidate"
                            );
                        }
                    }
                    Err(e) => {
                        debug!(
                            target: "bc.handshake",
                            session_id = %session_id,
                            room_id = %room.room_id(),
                            error = %e,
                            "Dropping ICE candidate"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    target: "bc.handshake",
                    session_id = %session_id,
                    room_id = %room.room_id(),
                    error = %e,
                    "Failed to route ICE candidate"
                );
            }
        }
    }

    /// Reserve the presenter slot, retrying once on a room that retired
    /// between lookup and reservation.
    async fn claim_presenter(
        &self,
        session_id: &str,
        room_id: &str,
        outbound: &Outbound,
    ) -> Result<(RoomActorHandle, u64), BcError> {
        let room = self.registry.get_or_create_room(room_id).await?;
        let reserved = room
            .reserve_presenter(session_id.to_string(), outbound.clone(), self.backend.lease())
            .await;
        match reserved {
            Err(BcError::RoomRetired) => {
                let room = self.registry.get_or_create_room(room_id).await?;
                let epoch = room
                    .reserve_presenter(session_id.to_string(), outbound.clone(), self.backend.lease())
                    .await?;
                Ok((room, epoch))
            }
            result => Ok((room, result?)),
        }
    }

    async fn build_presenter(
        &self,
        room: &RoomActorHandle,
        session_id: &str,
        epoch: u64,
        sdp_offer: &str,
        outbound: &Outbound,
    ) -> Result<String, BcError> {
        let client = self.backend.ensure_connected().await?;

        let pipeline = client.create_pipeline().await?;
        if let Err(e) = room
            .attach_pipeline(session_id.to_string(), epoch, Arc::clone(&client), pipeline.clone())
            .await
        {
            release_quietly(client.as_ref(), &pipeline).await;
            return Err(e);
        }
        // The room owns the pipeline from here; aborting releases it.

        let endpoint = client.create_webrtc_endpoint(&pipeline).await?;
        room.check_presenter(session_id.to_string(), epoch).await?;

        let filter = client.create_face_overlay_filter(&pipeline).await?;
        room.check_presenter(session_id.to_string(), epoch).await?;
        client.set_overlayed_image(&filter, &self.overlay).await?;
        client.connect(&endpoint, &filter).await?;

        room.attach_presenter_endpoint(session_id.to_string(), epoch, endpoint.clone(), filter)
            .await?;

        let candidates = client.subscribe_ice_candidates(&endpoint).await?;
        forward_local_candidates(candidates, outbound.clone());

        debug!(
            target: "bc.handshake",
            session_id = %session_id,
            offer_len = sdp_offer.len(),
            "Processing presenter offer"
        );
        let answer = client.process_offer(&endpoint, sdp_offer).await?;
        room.check_presenter(session_id.to_string(), epoch).await?;

        let room = room.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.gather_candidates(&endpoint).await {
                warn!(
                    target: "bc.handshake",
                    session_id = %session_id,
                    room_id = %room.room_id(),
                    error = %e,
                    "Presenter candidate gathering failed, tearing down"
                );
                let _ = room.abort_presenter(session_id, epoch).await;
            }
        });

        Ok(answer)
    }

    async fn claim_viewer(
        &self,
        session_id: &str,
        room_id: &str,
        outbound: &Outbound,
    ) -> Result<(RoomActorHandle, ViewerTicket), BcError> {
        let room = self.registry.get_room(room_id).await?;
        let begun = room
            .begin_viewer(session_id.to_string(), outbound.clone(), self.backend.lease())
            .await;
        match begun {
            Err(BcError::RoomRetired) => {
                let room = self.registry.get_room(room_id).await?;
                let ticket = room
                    .begin_viewer(session_id.to_string(), outbound.clone(), self.backend.lease())
                    .await?;
                Ok((room, ticket))
            }
            result => Ok((room, result?)),
        }
    }

    async fn build_viewer(
        &self,
        room: &RoomActorHandle,
        session_id: &str,
        ticket: &ViewerTicket,
        sdp_offer: &str,
        outbound: &Outbound,
    ) -> Result<String, BcError> {
        let client = Arc::clone(&ticket.client);
        let epoch = ticket.epoch;

        let endpoint = client.create_webrtc_endpoint(&ticket.pipeline).await?;
        if let Err(e) = room
            .register_viewer(session_id.to_string(), epoch, endpoint.clone())
            .await
        {
            release_quietly(client.as_ref(), &endpoint).await;
            return Err(e);
        }

        let candidates = client.subscribe_ice_candidates(&endpoint).await?;
        forward_local_candidates(candidates, outbound.clone());

        debug!(
            target: "bc.handshake",
            session_id = %session_id,
            offer_len = sdp_offer.len(),
            "Processing viewer offer"
        );
        let answer = client.process_offer(&endpoint, sdp_offer).await?;
        room.check_viewer(session_id.to_string(), epoch).await?;

        room.wire_viewer(session_id.to_string(), epoch).await?;

        let room = room.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.gather_candidates(&endpoint).await {
                warn!(
                    target: "bc.handshake",
                    session_id = %session_id,
                    room_id = %room.room_id(),
                    error = %e,
                    "Viewer candidate gathering failed, tearing down"
                );
                let _ = room.abort_viewer(session_id, epoch).await;
            }
        });

        Ok(answer)
    }

    async fn finish(
        &self,
        role: &'static str,
        session_id: &str,
        room_id: &str,
        started: Instant,
        result: Result<String, BcError>,
    ) -> Result<String, BcError> {
        match &result {
            Ok(_) => {
                let elapsed = started.elapsed();
                record_handshake(role, "success", elapsed);
                info!(
                    target: "bc.handshake",
                    role = role,
                    session_id = %session_id,
                    room_id = %room_id,
                    duration_ms = elapsed.as_millis(),
                    "Handshake accepted"
                );
            }
            Err(e) => self.reject(role, session_id, room_id, started, e).await,
        }
        result
    }

    async fn reject(
        &self,
        role: &'static str,
        session_id: &str,
        room_id: &str,
        started: Instant,
        error: &BcError,
    ) {
        record_handshake(role, "error", started.elapsed());
        record_handshake_failure(role, error.error_type_label());
        info!(
            target: "bc.handshake",
            role = role,
            session_id = %session_id,
            room_id = %room_id,
            error = %error,
            "Handshake rejected"
        );
        self.backend.close_if_idle().await;
    }
}

/// A claimed presenter slot whose media server work has not run yet.
///
/// Holds a backend lease, so the media server connection stays open until
/// the reservation is completed or dropped.
pub struct PresenterReservation {
    room: RoomActorHandle,
    session_id: SessionId,
    epoch: u64,
    outbound: Outbound,
    started: Instant,
    in_flight: SessionLease,
}

impl PresenterReservation {
    #[must_use]
    pub fn room_id(&self) -> &str {
        self.room.room_id()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A claimed viewer slot whose media server work has not run yet.
pub struct ViewerReservation {
    room: RoomActorHandle,
    session_id: SessionId,
    ticket: ViewerTicket,
    outbound: Outbound,
    started: Instant,
    in_flight: SessionLease,
}

impl ViewerReservation {
    #[must_use]
    pub fn room_id(&self) -> &str {
        self.room.room_id()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.ticket.epoch
    }
}

/// Push an endpoint's local candidates to the client until either side goes away.
fn forward_local_candidates(mut candidates: CandidateStream, outbound: Outbound) {
    tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            if outbound
                .send(ServerMessage::IceCandidate { candidate })
                .await
                .is_err()
            {
                break;
            }
        }
    });
}

async fn release_quietly(client: &dyn MediaClient, element: &ElementId) {
    if let Err(e) = client.release(element).await {
        debug!(
            target: "bc.handshake",
            element = %element,
            error = %e,
            "Release of unowned element failed"
        );
    }
}
