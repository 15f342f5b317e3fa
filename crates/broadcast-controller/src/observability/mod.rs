//! Observability for the broadcast controller.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit fields; SDP
//! bodies and candidate strings are never logged. Metric labels are bounded
//! (see [`metrics`]).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `bc_rooms_active` | Gauge | none |
//! | `bc_sessions_active` | Gauge | none |
//! | `bc_connections_active` | Gauge | none |
//! | `bc_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `bc_handshake_duration_seconds` | Histogram | `role`, `outcome` |
//! | `bc_handshake_failures_total` | Counter | `role`, `error_type` |
//! | `bc_candidates_queued_total` | Counter | none |
//! | `bc_candidates_dropped_total` | Counter | none |
//! | `bc_backend_connects_total` | Counter | `outcome` |
//! | `bc_backend_closes_total` | Counter | none |
//! | `bc_messages_total` | Counter | `kind` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
