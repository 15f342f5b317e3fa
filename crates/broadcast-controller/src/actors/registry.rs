//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The registry is the only map from room id to room actor:
//!
//! - Spawns a `RoomActor` on the first presenter request for an unknown room
//! - Prunes rooms that went idle, re-creating them on demand
//! - Owns the root `CancellationToken`; room actors get child tokens
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Pruning
//!
//! An idle room sends `RoomIdle`. The registry asks it to retire from a
//! background task (the room may be busy with media server calls) and drops
//! the entry on `RoomRetired`, but only if the registered instance is still
//! the one that retired. A room that became busy again refuses.
//!
//! # Graceful Shutdown
//!
//! `shutdown` stops room creation, cancels every room (each releases its
//! pipeline) and waits for them up to the deadline.

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};
use crate::backend::BackendHandle;
use crate::config::DEFAULT_MAX_QUEUED_CANDIDATES;
use crate::errors::BcError;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(backend: Arc<BackendHandle>, metrics: Arc<ActorMetrics>) -> Self {
        Self::with_candidate_limit(backend, metrics, DEFAULT_MAX_QUEUED_CANDIDATES)
    }

    /// Like [`new`](Self::new), with rooms queueing at most `candidate_limit`
    /// candidates per session.
    #[must_use]
    pub fn with_candidate_limit(
        backend: Arc<BackendHandle>,
        metrics: Arc<ActorMetrics>,
        candidate_limit: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, "registry"));

        let actor = RoomRegistryActor {
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            next_instance: 1,
            accepting_new: true,
            backend,
            metrics,
            candidate_limit,
            mailbox: Arc::clone(&mailbox),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, BcError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.mailbox.record_dequeue();
            return Err(BcError::Internal(format!("channel send failed: {e}")));
        }
        rx.await
            .map_err(|e| BcError::Internal(format!("response receive failed: {e}")))
    }

    /// Return the room's actor, spawning one if the room is unknown.
    pub async fn get_or_create_room(&self, room_id: &str) -> Result<RoomActorHandle, BcError> {
        self.request(|respond_to| RegistryMessage::GetOrCreateRoom {
            room_id: room_id.to_string(),
            respond_to,
        })
        .await?
    }

    /// Return the room's actor, or [`BcError::RoomNotFound`].
    pub async fn get_room(&self, room_id: &str) -> Result<RoomActorHandle, BcError> {
        self.request(|respond_to| RegistryMessage::GetRoom {
            room_id: room_id.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, BcError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Stop creating rooms, cancel every room actor and wait for them.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), BcError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed (weakly) to room actors for idle notifications.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    next_instance: u64,
    accepting_new: bool,
    backend: Arc<BackendHandle>,
    metrics: Arc<ActorMetrics>,
    candidate_limit: usize,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "bc.actor.registry")]
    async fn run(mut self) {
        info!(target: "bc.actor.registry", "RoomRegistryActor started");

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "bc.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown(Duration::from_secs(30)).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "bc.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "bc.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = match self.rooms.get(&room_id) {
                    Some(managed) if !managed.handle.is_closed() => Ok(managed.handle.clone()),
                    _ => Err(BcError::RoomNotFound(room_id)),
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::RoomIdle { room_id, instance } => {
                self.request_retirement(&room_id, instance);
            }

            RegistryMessage::RoomRetired { room_id, instance } => {
                if self
                    .rooms
                    .get(&room_id)
                    .is_some_and(|managed| managed.handle.instance() == instance)
                {
                    self.remove_room(&room_id, "retired");
                }
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.graceful_shutdown(deadline).await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: String) -> Result<RoomActorHandle, BcError> {
        if !self.accepting_new {
            return Err(BcError::Internal("registry shutting down".to_string()));
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_closed() {
                return Ok(managed.handle.clone());
            }
            // Retired but its RoomRetired notice is still queued
            self.remove_room(&room_id, "closed");
        }

        let instance = self.next_instance;
        self.next_instance += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            instance,
            self.cancel_token.child_token(),
            self.self_sender.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.metrics),
            self.candidate_limit,
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "bc.actor.registry",
            room_id = %room_id,
            instance = instance,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(handle)
    }

    fn request_retirement(&self, room_id: &str, instance: u64) {
        let Some(managed) = self
            .rooms
            .get(room_id)
            .filter(|managed| managed.handle.instance() == instance)
        else {
            return;
        };

        let handle = managed.handle.clone();
        let registry = self.self_sender.clone();
        tokio::spawn(async move {
            let Ok(Some(instance)) = handle.try_retire().await else {
                return;
            };
            if let Some(registry) = registry.upgrade() {
                let _ = registry
                    .send(RegistryMessage::RoomRetired {
                        room_id: handle.room_id().to_string(),
                        instance,
                    })
                    .await;
            }
        });
    }

    fn remove_room(&mut self, room_id: &str, reason: &'static str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };
        self.metrics.room_removed();

        let lifetime_secs = chrono::Utc::now().timestamp() - managed.created_at;
        debug!(
            target: "bc.actor.registry",
            room_id = %room_id,
            instance = managed.handle.instance(),
            reason = reason,
            lifetime_secs = lifetime_secs,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            is_shutting_down: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        if !self.accepting_new && self.rooms.is_empty() {
            return;
        }
        info!(
            target: "bc.actor.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let waits = self.rooms.drain().map(|(room_id, managed)| async move {
            (
                room_id,
                tokio::time::timeout(deadline, managed.task_handle).await,
            )
        });
        for (room_id, outcome) in futures::future::join_all(waits).await {
            self.metrics.room_removed();
            match outcome {
                Ok(Ok(())) => {
                    debug!(
                        target: "bc.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "bc.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "bc.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
        }

        info!(target: "bc.actor.registry", "Graceful shutdown complete");
    }

    /// Drop rooms whose actor task ended without retiring through us.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.metrics.room_removed();

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "bc.actor.registry",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "bc.actor.registry",
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Room);
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::mock::MockMediaServer;

    fn registry() -> (RoomRegistryHandle, Arc<BackendHandle>, Arc<ActorMetrics>) {
        let server = MockMediaServer::new();
        let backend = Arc::new(BackendHandle::new(Arc::new(server), "ws://mock/kurento"));
        let metrics = ActorMetrics::new();
        let handle = RoomRegistryHandle::new(Arc::clone(&backend), Arc::clone(&metrics));
        (handle, backend, metrics)
    }

    /// Poll until the registry reports `count` rooms.
    async fn wait_for_room_count(registry: &RoomRegistryHandle, count: usize) {
        for _ in 0..200 {
            if registry.get_status().await.unwrap().room_count == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.get_status().await.unwrap().room_count, count);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let (registry, _backend, metrics) = registry();

        let first = registry.get_or_create_room("r1").await.unwrap();
        let second = registry.get_or_create_room("r1").await.unwrap();
        assert_eq!(first.instance(), second.instance());

        let other = registry.get_or_create_room("r2").await.unwrap();
        assert_ne!(first.instance(), other.instance());

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 2);
        assert!(!status.is_shutting_down);
        assert_eq!(metrics.room_count(), 2);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_room_not_found() {
        let (registry, _backend, _metrics) = registry();

        let result = registry.get_room("missing").await;
        assert!(matches!(result, Err(BcError::RoomNotFound(ref id)) if id == "missing"));

        registry.get_or_create_room("r1").await.unwrap();
        assert!(registry.get_room("r1").await.is_ok());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_idle_room_is_pruned_and_recreated() {
        let (registry, backend, metrics) = registry();

        let room = registry.get_or_create_room("r1").await.unwrap();
        let (outbound, _rx) = mpsc::channel(4);
        room.reserve_presenter("1".to_string(), outbound, backend.lease())
            .await
            .unwrap();
        room.stop("1".to_string()).await.unwrap();

        wait_for_room_count(&registry, 0).await;
        assert!(matches!(
            registry.get_room("r1").await,
            Err(BcError::RoomNotFound(_))
        ));
        assert_eq!(metrics.room_count(), 0);

        let recreated = registry.get_or_create_room("r1").await.unwrap();
        assert_ne!(recreated.instance(), room.instance());
        assert!(recreated.get_state().await.unwrap().is_idle());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_busy_room_is_kept() {
        let (registry, backend, _metrics) = registry();

        let room = registry.get_or_create_room("r1").await.unwrap();
        let (outbound, _rx) = mpsc::channel(4);
        room.reserve_presenter("1".to_string(), outbound, backend.lease())
            .await
            .unwrap();
        // A viewer stopping in a room with a presenter leaves it busy
        room.stop("9".to_string()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);
        assert_eq!(
            registry.get_room("r1").await.unwrap().instance(),
            room.instance()
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_rooms() {
        let (registry, _backend, _metrics) = registry();

        let room = registry.get_or_create_room("r1").await.unwrap();
        registry.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(room.is_cancelled());
        assert!(room.is_closed());
        assert!(registry.is_cancelled());
    }

    #[tokio::test]
    async fn test_rejects_rooms_after_shutdown() {
        let (registry, _backend, _metrics) = registry();

        registry.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = registry.get_or_create_room("r1").await;
        assert!(matches!(result, Err(BcError::Internal(_))));
    }
}
