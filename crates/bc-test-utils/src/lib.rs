//! # Broadcast Controller Test Utilities
//!
//! Shared test utilities for the broadcast signaling controller.
//!
//! ## Modules
//!
//! - `server` - Full signaling server on an ephemeral port, backed by the
//!   in-memory media server
//! - `client` - WebSocket signaling client speaking the JSON protocol
//! - `fixtures` - SDP offers, ICE candidates and overlay settings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestBroadcastServer::start().await.unwrap();
//!     let mut presenter = server.connect().await.unwrap();
//!
//!     presenter.presenter("room-1", &presenter_offer()).await.unwrap();
//!     let answer = presenter.recv_handshake_response().await.unwrap();
//! }
//! ```

pub mod client;
pub mod fixtures;
pub mod server;

pub use client::*;
pub use fixtures::*;
pub use server::*;
