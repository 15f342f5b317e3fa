//! Metric definitions for the broadcast controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `bc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `role`: presenter, viewer
//! - `outcome`: success, error
//! - `error_type`: bounded by `BcError::error_type_label`
//! - `kind`: bounded by signaling message kinds
//! - `actor_type`: registry, room

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded. Handshake buckets cover
/// media server round trips (create, offer, wire), which run to seconds.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("bc_handshake".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set handshake buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `bc_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bc_rooms_active").set(count as f64);
}

/// Set the number of presenters and viewers holding media server resources.
///
/// Metric: `bc_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bc_sessions_active").set(count as f64);
}

/// Metric: `bc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bc_connections_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `bc_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room)
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

// ============================================================================
// Handshakes
// ============================================================================

/// Record the duration of a presenter or viewer handshake.
///
/// Metric: `bc_handshake_duration_seconds`
/// Labels: `role`, `outcome`
pub fn record_handshake(role: &'static str, outcome: &'static str, duration: Duration) {
    histogram!(
        "bc_handshake_duration_seconds",
        "role" => role,
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());
}

/// Metric: `bc_handshake_failures_total`
/// Labels: `role`, `error_type`
pub fn record_handshake_failure(role: &'static str, error_type: &'static str) {
    counter!(
        "bc_handshake_failures_total",
        "role" => role,
        "error_type" => error_type
    )
    .increment(1);
}

// ============================================================================
// Candidates, backend, messages
// ============================================================================

/// Count an ICE candidate buffered because its endpoint did not exist yet.
///
/// Metric: `bc_candidates_queued_total`
pub fn record_candidate_queued() {
    counter!("bc_candidates_queued_total").increment(1);
}

/// Count an ICE candidate refused because its session's queue was full.
///
/// Metric: `bc_candidates_dropped_total`
pub fn record_candidate_dropped() {
    counter!("bc_candidates_dropped_total").increment(1);
}

/// Metric: `bc_backend_connects_total`
/// Labels: `outcome` (success, error)
pub fn record_backend_connect(outcome: &'static str) {
    counter!("bc_backend_connects_total", "outcome" => outcome).increment(1);
}

/// Metric: `bc_backend_closes_total`
pub fn record_backend_close() {
    counter!("bc_backend_closes_total").increment(1);
}

/// Count an inbound signaling message by kind.
///
/// Metric: `bc_messages_total`
/// Labels: `kind` (presenter, viewer, stop, onIceCandidate, invalid)
pub fn record_message(kind: &'static str) {
    counter!("bc_messages_total", "kind" => kind).increment(1);
}
