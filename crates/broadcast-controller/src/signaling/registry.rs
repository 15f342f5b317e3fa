//! Live signaling connections.
//!
//! Assigns session ids (a process-wide counter rendered as a string) and
//! keeps a cancellation token per connection so shutdown can close them all.

use crate::actors::ActorMetrics;
use crate::candidates::SessionId;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry of open signaling connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next_session: AtomicU64,
    connections: Mutex<HashMap<SessionId, CancellationToken>>,
    root_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(metrics: Arc<ActorMetrics>) -> Arc<Self> {
        Arc::new(Self {
            next_session: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
            metrics,
        })
    }

    /// Register a new connection and allocate its session id.
    ///
    /// Returns `None` once [`close_all`](Self::close_all) has been called.
    pub fn register(self: &Arc<Self>) -> Option<ConnectionGuard> {
        if self.root_token.is_cancelled() {
            return None;
        }

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed).to_string();
        let cancel_token = self.root_token.child_token();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), cancel_token.clone());
        self.metrics.connection_opened();

        debug!(
            target: "bc.signaling",
            session_id = %session_id,
            connections = self.count(),
            "Connection registered"
        );

        Some(ConnectionGuard {
            registry: Arc::clone(self),
            session_id,
            cancel_token,
        })
    }

    /// Number of open connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Refuse new connections and signal every open one to close.
    pub fn close_all(&self) {
        self.root_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.root_token.is_cancelled()
    }

    fn unregister(&self, session_id: &str) {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            self.metrics.connection_closed();
        }
    }
}

/// A registered connection. Unregisters on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    session_id: SessionId,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cancelled when the server shuts down.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.session_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_sequential() {
        let registry = ConnectionRegistry::new(ActorMetrics::new());

        let first = registry.register().unwrap();
        let second = registry.register().unwrap();
        assert_eq!(first.session_id(), "0");
        assert_eq!(second.session_id(), "1");
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let metrics = ActorMetrics::new();
        let registry = ConnectionRegistry::new(Arc::clone(&metrics));

        let guard = registry.register().unwrap();
        assert_eq!(metrics.connection_count(), 1);

        drop(guard);
        assert_eq!(registry.count(), 0);
        assert_eq!(metrics.connection_count(), 0);

        // Ids are never reused
        assert_eq!(registry.register().unwrap().session_id(), "1");
    }

    #[test]
    fn test_close_all_cancels_connections() {
        let registry = ConnectionRegistry::new(ActorMetrics::new());
        let guard = registry.register().unwrap();

        registry.close_all();

        assert!(guard.cancel_token().is_cancelled());
        assert!(registry.is_closed());
        assert!(registry.register().is_none());
    }
}
