//! Broadcast Controller Library
//!
//! WebSocket signaling controller for one-to-many WebRTC broadcast rooms over
//! a Kurento media server:
//!
//! - One presenter per room, any number of viewers
//! - The presenter stream passes through a face overlay filter before fan-out
//! - Trickle ICE with per-session candidate queues until endpoints exist
//! - One shared media server connection, closed when no session needs it
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room id)
//!         ├── presenter slot (pipeline, endpoint, overlay filter)
//!         ├── viewer slots (endpoint each)
//!         └── candidate queue per session
//! ```
//!
//! Signaling connections run a [`signaling::router::MessageRouter`] each.
//! Handshakes ([`handshake::HandshakeEngine`]) talk to the media server
//! through [`backend::BackendHandle`] and commit their results to the room
//! actor, which rejects results from handshakes that were stopped meanwhile.
//!
//! # Modules
//!
//! - [`actors`] - Room registry and room actors
//! - [`backend`] - Media server client abstraction and Kurento JSON-RPC client
//! - [`candidates`] - Pending ICE candidate queues
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types and client-facing messages
//! - [`handshake`] - Presenter and viewer handshakes
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - WebSocket server and message routing

pub mod actors;
pub mod backend;
pub mod candidates;
pub mod config;
pub mod errors;
pub mod handshake;
pub mod observability;
pub mod signaling;
