//! Actor model for room state.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room id)
//!         ├── presenter slot (pipeline, endpoint, overlay filter)
//!         ├── viewer slots (endpoint per viewer)
//!         └── candidate queue (per session, until its endpoint exists)
//! ```
//!
//! Actors communicate through `tokio::sync::mpsc` mailboxes and reply over
//! `oneshot` channels. Each room processes one message at a time, so all
//! mutations of a room are serialized while different rooms run
//! independently.

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use messages::{PresenterInfo, RegistryStatus, RoomState, ViewerInfo, ViewerTicket};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::RoomRegistryHandle;
pub use room::{RoomActor, RoomActorHandle};
