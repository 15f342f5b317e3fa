//! Handshake flows against the in-memory media server.
//!
//! Covers presenter exclusivity, viewer admission, candidate ordering,
//! teardown races and media server connection lifetime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bc_test_utils::{presenter_offer, remote_candidate, test_overlay, viewer_offer};
use broadcast_controller::actors::{ActorMetrics, RoomRegistryHandle};
use broadcast_controller::backend::mock::{ElementKind, MockMediaServer, MockOperation};
use broadcast_controller::backend::BackendHandle;
use broadcast_controller::errors::{BcError, NO_PRESENTER_MESSAGE};
use broadcast_controller::handshake::HandshakeEngine;
use broadcast_controller::signaling::protocol::{Outbound, ServerMessage};
use tokio::sync::mpsc;

struct Fixture {
    media: MockMediaServer,
    backend: Arc<BackendHandle>,
    engine: HandshakeEngine,
}

fn fixture() -> Fixture {
    let media = MockMediaServer::new();
    let backend = Arc::new(BackendHandle::new(
        Arc::new(media.clone()),
        "ws://mock-media-server:8888/kurento",
    ));
    let registry = RoomRegistryHandle::new(Arc::clone(&backend), ActorMetrics::new());
    let engine = HandshakeEngine::new(registry, Arc::clone(&backend), test_overlay());
    Fixture {
        media,
        backend,
        engine,
    }
}

fn outbound() -> (Outbound, mpsc::Receiver<ServerMessage>) {
    mpsc::channel(64)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

async fn present(f: &Fixture, session_id: &str, room_id: &str) -> mpsc::Receiver<ServerMessage> {
    let (tx, rx) = outbound();
    f.engine
        .become_presenter(session_id, room_id, &presenter_offer(), tx)
        .await
        .unwrap();
    rx
}

fn only(elements: Vec<String>) -> String {
    assert_eq!(elements.len(), 1, "expected exactly one element");
    elements.into_iter().next().unwrap()
}

// ============================================================================
// Presenter exclusivity
// ============================================================================

#[tokio::test]
async fn test_concurrent_presenters_exactly_one_wins() {
    let f = fixture();
    let (tx_a, _rx_a) = outbound();
    let (tx_b, _rx_b) = outbound();
    let offer = presenter_offer();

    let (a, b) = tokio::join!(
        f.engine.become_presenter("a", "r3", &offer, tx_a),
        f.engine.become_presenter("b", "r3", &offer, tx_b),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(BcError::PresenterConflict)))
            .count(),
        1
    );
    assert_eq!(f.media.created_count(ElementKind::Pipeline), 1);
}

#[tokio::test]
async fn test_presenter_setup_wires_overlay_filter() {
    let f = fixture();
    let (tx, _rx) = outbound();

    let answer = f
        .engine
        .become_presenter("p", "r1", &presenter_offer(), tx)
        .await
        .unwrap();

    let endpoint = only(f.media.live_elements(ElementKind::WebRtcEndpoint));
    let filter = only(f.media.live_elements(ElementKind::FaceOverlayFilter));
    assert_eq!(answer, MockMediaServer::answer_for(&endpoint));
    assert_eq!(f.media.offers(&endpoint), vec![presenter_offer()]);
    assert_eq!(f.media.sinks_of(&endpoint), vec![filter.clone()]);
    assert_eq!(f.media.overlay_of(&filter), Some(test_overlay()));
}

#[tokio::test]
async fn test_presenter_receives_local_candidates() {
    let f = fixture();
    let mut rx = present(&f, "p", "r1").await;
    let endpoint = only(f.media.live_elements(ElementKind::WebRtcEndpoint));

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        message,
        ServerMessage::IceCandidate {
            candidate: MockMediaServer::gathered_candidate(&endpoint)
        }
    );
}

// ============================================================================
// Viewer admission
// ============================================================================

#[tokio::test]
async fn test_viewer_without_presenter_fails_fast() {
    let f = fixture();
    let (tx, _rx) = outbound();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        f.engine.become_viewer("v", "r2", &viewer_offer(1), tx),
    )
    .await
    .expect("viewer handshake hung");

    let err = result.unwrap_err();
    assert_eq!(err.client_message(), NO_PRESENTER_MESSAGE);
    assert_eq!(f.media.connect_count(), 0);
}

#[tokio::test]
async fn test_viewer_rejected_while_presenter_is_setting_up() {
    let f = fixture();
    let gate = f.media.pause(MockOperation::CreateFilter);

    let engine = f.engine.clone();
    let (tx_p, _rx_p) = outbound();
    let presenter = tokio::spawn(async move {
        engine
            .become_presenter("p", "r1", &presenter_offer(), tx_p)
            .await
    });
    gate.wait_entered(1).await;

    let (tx_v, _rx_v) = outbound();
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        f.engine.become_viewer("v", "r1", &viewer_offer(1), tx_v),
    )
    .await
    .expect("viewer handshake hung");
    assert!(matches!(result, Err(BcError::NoActivePresenter)));

    gate.open();
    assert!(presenter.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_viewer_wired_from_filter() {
    let f = fixture();
    let _rx_p = present(&f, "p", "r1").await;
    let presenter_endpoint = only(f.media.live_elements(ElementKind::WebRtcEndpoint));
    let filter = only(f.media.live_elements(ElementKind::FaceOverlayFilter));

    let (tx, _rx) = outbound();
    let answer = f
        .engine
        .become_viewer("v", "r1", &viewer_offer(1), tx)
        .await
        .unwrap();

    let viewer_endpoint = f
        .media
        .live_elements(ElementKind::WebRtcEndpoint)
        .into_iter()
        .find(|e| *e != presenter_endpoint)
        .unwrap();
    assert_eq!(answer, MockMediaServer::answer_for(&viewer_endpoint));
    assert_eq!(f.media.sinks_of(&filter), vec![viewer_endpoint.clone()]);
    assert_eq!(
        f.media.pipeline_of(&viewer_endpoint),
        f.media.pipeline_of(&presenter_endpoint)
    );
}

#[tokio::test]
async fn test_presenter_session_cannot_view_own_room() {
    let f = fixture();
    let _rx_p = present(&f, "p", "r1").await;

    let (tx, _rx) = outbound();
    let result = f.engine.become_viewer("p", "r1", &viewer_offer(1), tx).await;
    assert!(matches!(result, Err(BcError::SessionConflict)));
}

// ============================================================================
// Candidate ordering
// ============================================================================

#[tokio::test]
async fn test_early_presenter_candidates_flushed_in_order_exactly_once() {
    let f = fixture();
    let gate = f.media.pause(MockOperation::CreateEndpoint);

    let engine = f.engine.clone();
    let (tx, _rx) = outbound();
    let presenter = tokio::spawn(async move {
        engine
            .become_presenter("p", "r1", &presenter_offer(), tx)
            .await
    });
    gate.wait_entered(1).await;

    for n in 0..3 {
        f.engine.on_ice_candidate("p", "r1", remote_candidate(n)).await;
    }
    gate.open();
    presenter.await.unwrap().unwrap();

    f.engine.on_ice_candidate("p", "r1", remote_candidate(3)).await;

    let endpoint = only(f.media.live_elements(ElementKind::WebRtcEndpoint));
    wait_for(|| f.media.remote_candidates(&endpoint).len() >= 4).await;

    let expected: Vec<_> = (0..4).map(remote_candidate).collect();
    assert_eq!(f.media.remote_candidates(&endpoint), expected);
    assert_eq!(f.media.call_count(MockOperation::AddIceCandidate), 4);
}

#[tokio::test]
async fn test_early_viewer_candidates_flushed_in_order() {
    let f = fixture();
    let _rx_p = present(&f, "p", "r1").await;
    let presenter_endpoint = only(f.media.live_elements(ElementKind::WebRtcEndpoint));
    let gate = f.media.pause(MockOperation::CreateEndpoint);

    let engine = f.engine.clone();
    let (tx, _rx) = outbound();
    let viewer = tokio::spawn(async move {
        engine
            .become_viewer("v", "r1", &viewer_offer(1), tx)
            .await
    });
    gate.wait_entered(1).await;

    for n in 10..13 {
        f.engine.on_ice_candidate("v", "r1", remote_candidate(n)).await;
    }
    gate.open();
    viewer.await.unwrap().unwrap();

    let viewer_endpoint = f
        .media
        .live_elements(ElementKind::WebRtcEndpoint)
        .into_iter()
        .find(|e| *e != presenter_endpoint)
        .unwrap();
    let expected: Vec<_> = (10..13).map(remote_candidate).collect();
    assert_eq!(f.media.remote_candidates(&viewer_endpoint), expected);
    assert!(f.media.remote_candidates(&presenter_endpoint).is_empty());
}

#[tokio::test]
async fn test_candidates_for_unknown_room_are_dropped() {
    let f = fixture();

    f.engine
        .on_ice_candidate("x", "nowhere", remote_candidate(0))
        .await;

    let status = f.engine.registry().get_status().await.unwrap();
    assert_eq!(status.room_count, 0);
    assert_eq!(f.media.call_count(MockOperation::AddIceCandidate), 0);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_presenter_stop_aborts_viewer_handshake() {
    let f = fixture();
    let _rx_p = present(&f, "p", "r1").await;
    let gate = f.media.pause(MockOperation::ProcessOffer);

    let engine = f.engine.clone();
    let (tx, mut rx_v) = outbound();
    let viewer = tokio::spawn(async move {
        engine
            .become_viewer("v", "r1", &viewer_offer(1), tx)
            .await
    });
    gate.wait_entered(1).await;

    f.engine.stop("p", "r1").await;
    gate.open();

    let result = viewer.await.unwrap();
    assert!(matches!(result, Err(BcError::NoActivePresenter)));
    assert_eq!(rx_v.recv().await, Some(ServerMessage::StopCommunication));

    assert!(f.media.live_elements(ElementKind::Pipeline).is_empty());
    assert!(f.media.live_elements(ElementKind::WebRtcEndpoint).is_empty());
    assert_eq!(f.backend.active_sessions(), 0);
    assert!(!f.media.is_connected());
}

/// Stop the presenter while its own handshake is held at `operation`.
async fn stop_presenter_during(operation: MockOperation) {
    let f = fixture();
    let gate = f.media.pause(operation);

    let engine = f.engine.clone();
    let (tx, _rx) = outbound();
    let presenter = tokio::spawn(async move {
        engine
            .become_presenter("p", "r1", &presenter_offer(), tx)
            .await
    });
    gate.wait_entered(1).await;

    f.engine.stop("p", "r1").await;
    gate.open();

    let result = presenter.await.unwrap();
    assert!(
        matches!(result, Err(BcError::NoActivePresenter)),
        "unexpected result {result:?}"
    );
    assert!(f.media.live_elements(ElementKind::Pipeline).is_empty());
    assert!(f.media.live_elements(ElementKind::WebRtcEndpoint).is_empty());
    assert_eq!(f.backend.active_sessions(), 0);
    assert!(!f.media.is_connected());

    // Nothing left behind blocks the next presenter.
    let _rx = present(&f, "q", "r1").await;
}

#[tokio::test]
async fn test_presenter_stopped_before_pipeline_exists() {
    stop_presenter_during(MockOperation::CreatePipeline).await;
}

#[tokio::test]
async fn test_presenter_stopped_while_processing_offer() {
    stop_presenter_during(MockOperation::ProcessOffer).await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let f = fixture();
    let _rx_p = present(&f, "p", "r1").await;
    let (tx, _rx_v) = outbound();
    f.engine
        .become_viewer("v", "r1", &viewer_offer(1), tx)
        .await
        .unwrap();

    f.engine.stop("v", "r1").await;
    f.engine.stop("v", "r1").await;
    assert_eq!(f.media.live_elements(ElementKind::WebRtcEndpoint).len(), 1);

    f.engine.stop("p", "r1").await;
    f.engine.stop("p", "r1").await;
    f.engine.stop("ghost", "r1").await;
    f.engine.stop("ghost", "never-existed").await;

    // One endpoint release for the viewer, one pipeline release for the presenter.
    assert_eq!(f.media.call_count(MockOperation::Release), 2);
    assert!(f.media.live_elements(ElementKind::Pipeline).is_empty());
}

#[tokio::test]
async fn test_room_reusable_after_presenter_leaves() {
    let f = fixture();
    let _rx_a = present(&f, "a", "r1").await;
    f.engine.stop("a", "r1").await;

    let _rx_b = present(&f, "b", "r1").await;
    assert_eq!(f.media.live_elements(ElementKind::Pipeline).len(), 1);
}

// ============================================================================
// Media server connection lifetime and failures
// ============================================================================

#[tokio::test]
async fn test_backend_closed_when_idle_and_reopened() {
    let f = fixture();
    let _rx = present(&f, "p", "r1").await;
    assert_eq!(f.media.connect_count(), 1);
    assert!(f.media.is_connected());

    f.engine.stop("p", "r1").await;
    assert_eq!(f.media.close_count(), 1);
    assert!(!f.media.is_connected());

    let _rx = present(&f, "p2", "r1").await;
    assert_eq!(f.media.connect_count(), 2);
}

#[tokio::test]
async fn test_backend_stays_open_while_viewer_remains_elsewhere() {
    let f = fixture();
    let _rx_1 = present(&f, "p1", "r1").await;
    let _rx_2 = present(&f, "p2", "r2").await;

    f.engine.stop("p1", "r1").await;
    assert!(f.media.is_connected());

    f.engine.stop("p2", "r2").await;
    assert!(!f.media.is_connected());
}

#[tokio::test]
async fn test_handshakes_recover_after_media_server_restart() {
    let f = fixture();
    let _rx = present(&f, "p1", "r1").await;

    f.media.drop_connections();

    // The cached connection is dead; the next handshake opens a new one.
    let _rx = present(&f, "p2", "r2").await;
    assert_eq!(f.media.connect_count(), 2);
    assert!(f.media.is_connected());
}

#[tokio::test]
async fn test_backend_unreachable_rejects_presenter() {
    let f = fixture();
    f.media.set_unreachable(true);
    let (tx, _rx) = outbound();

    let err = f
        .engine
        .become_presenter("p", "r1", &presenter_offer(), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, BcError::BackendUnreachable(_)));
    assert!(!err.client_message().contains("mock-media-server"));

    // The slot was cleared, so a retry succeeds once the server is back.
    f.media.set_unreachable(false);
    let _rx = present(&f, "p", "r1").await;
}

#[tokio::test]
async fn test_failed_presenter_step_unwinds() {
    let f = fixture();
    f.media.fail_on(MockOperation::CreateFilter);
    let (tx, _rx) = outbound();

    let err = f
        .engine
        .become_presenter("p", "r1", &presenter_offer(), tx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BcError::BackendOperationFailed {
            operation: "createFaceOverlayFilter",
            ..
        }
    ));
    assert!(f.media.live_elements(ElementKind::Pipeline).is_empty());
    assert!(f.media.live_elements(ElementKind::WebRtcEndpoint).is_empty());
    assert!(!f.media.is_connected());

    f.media.clear_failures();
    let _rx = present(&f, "p", "r1").await;
}

#[tokio::test]
async fn test_failed_viewer_releases_its_endpoint() {
    let f = fixture();
    let _rx_p = present(&f, "p", "r1").await;
    f.media.fail_on(MockOperation::ProcessOffer);
    let (tx, _rx) = outbound();

    let err = f
        .engine
        .become_viewer("v", "r1", &viewer_offer(1), tx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BcError::BackendOperationFailed {
            operation: "processOffer",
            ..
        }
    ));

    // Only the presenter endpoint survives; the presenter is untouched.
    assert_eq!(f.media.live_elements(ElementKind::WebRtcEndpoint).len(), 1);
    assert_eq!(f.media.live_elements(ElementKind::Pipeline).len(), 1);
    assert!(f.media.is_connected());

    f.media.clear_failures();
    let (tx, _rx) = outbound();
    assert!(f
        .engine
        .become_viewer("v", "r1", &viewer_offer(1), tx)
        .await
        .is_ok());
}
