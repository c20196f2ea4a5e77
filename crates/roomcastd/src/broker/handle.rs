//! Client interface for the broker controller.
//!
//! `BrokerHandle` is cheap to clone and is shared by every connection task.
//! Registrations are enqueued without waiting so a busy controller pushes
//! back on callers instead of stalling them.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - Channel errors map to `BrokerError` variants or are logged

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use roomcast_core::{ConnectionId, RoomName};

use super::commands::{BrokerCommand, BrokerError, InboundSink, Registration, RoomInfo};
use crate::sink::OutboundSink;

// ============================================================================
// Broker Handle
// ============================================================================

/// Handle for interacting with the broker.
#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerCommand>,
    stopped: CancellationToken,
    capacity: usize,
    join_timeout: Duration,
}

impl BrokerHandle {
    /// Create a new broker handle.
    ///
    /// # Arguments
    ///
    /// * `sender` - The controller's command queue
    /// * `stopped` - Token the controller cancels once every room is gone
    /// * `join_timeout` - Upper bound on waiting for a room to admit a member
    pub fn new(
        sender: mpsc::Sender<BrokerCommand>,
        stopped: CancellationToken,
        join_timeout: Duration,
    ) -> Self {
        let capacity = sender.max_capacity();
        Self {
            sender,
            stopped,
            capacity,
            join_timeout,
        }
    }

    /// Submit a registration without waiting.
    ///
    /// # Errors
    ///
    /// - `BrokerError::Backpressure` if the registration queue is full
    /// - `BrokerError::ShuttingDown` if the controller stopped accepting
    pub fn register(&self, registration: Registration) -> Result<(), BrokerError> {
        self.sender
            .try_send(BrokerCommand::Register(registration))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BrokerError::Backpressure {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => BrokerError::ShuttingDown,
            })
    }

    /// Join a room and wait for its inbound sink.
    ///
    /// If no reply arrives within the join timeout, a matching Remove is
    /// submitted so a late admission does not leave a stale member.
    ///
    /// # Errors
    ///
    /// - `BrokerError::Backpressure` / `BrokerError::ShuttingDown` from `register`
    /// - `BrokerError::RoomUnavailable` if the room stopped before admitting
    /// - `BrokerError::JoinTimeout` if the reply took too long
    pub async fn join(
        &self,
        room: RoomName,
        id: ConnectionId,
        outbound: OutboundSink,
    ) -> Result<InboundSink, BrokerError> {
        let (tx, rx) = oneshot::channel();

        self.register(Registration::Add {
            room: room.clone(),
            id,
            outbound,
            reply: tx,
        })?;

        match timeout(self.join_timeout, rx).await {
            Ok(Ok(inbound)) => Ok(inbound),
            Ok(Err(_)) => Err(BrokerError::RoomUnavailable(room)),
            Err(_) => {
                self.leave(room.clone(), id);
                Err(BrokerError::JoinTimeout {
                    room,
                    timeout_ms: self.join_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Leave a room. Best-effort: failures are logged and never awaited.
    pub fn leave(&self, room: RoomName, id: ConnectionId) {
        match self.register(Registration::Remove {
            room: room.clone(),
            id,
        }) {
            Ok(()) => {}
            Err(BrokerError::ShuttingDown) => {
                debug!(room = %room, connection_id = %id, "Leave skipped, broker stopping");
            }
            Err(e) => {
                warn!(room = %room, connection_id = %id, error = %e, "Failed to submit leave");
            }
        }
    }

    /// List live rooms.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ChannelClosed` if the controller has stopped.
    pub async fn list_rooms(&self) -> Result<Vec<RoomInfo>, BrokerError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(BrokerCommand::ListRooms { respond_to: tx })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;

        rx.await.map_err(|_| BrokerError::ChannelClosed)
    }

    /// Member ids of a live room, sorted. `None` if the room is not live.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ChannelClosed` if the controller has stopped.
    pub async fn room_members(
        &self,
        room: RoomName,
    ) -> Result<Option<Vec<ConnectionId>>, BrokerError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(BrokerCommand::RoomMembers {
                room,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;

        // A room that stops while the query is queued drops the reply.
        Ok(rx.await.unwrap_or(None))
    }

    /// Returns true while registrations are being accepted.
    pub fn is_accepting(&self) -> bool {
        !self.sender.is_closed() && !self.stopped.is_cancelled()
    }

    /// Returns true once every room has terminated.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Waits until the broker has fully stopped.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::outbound_channel;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    fn create_test_handle(capacity: usize) -> (BrokerHandle, mpsc::Receiver<BrokerCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = BrokerHandle::new(tx, CancellationToken::new(), Duration::from_secs(5));
        (handle, rx)
    }

    fn lobby() -> RoomName {
        RoomName::from_path("/lobby").unwrap()
    }

    // ========================================================================
    // register
    // ========================================================================

    #[tokio::test]
    async fn test_register_backpressure() {
        let (handle, _rx) = create_test_handle(1);

        handle
            .register(Registration::Remove {
                room: lobby(),
                id: ConnectionId::next(),
            })
            .unwrap();

        let err = handle
            .register(Registration::Remove {
                room: lobby(),
                id: ConnectionId::next(),
            })
            .unwrap_err();
        assert_eq!(err, BrokerError::Backpressure { capacity: 1 });
    }

    #[tokio::test]
    async fn test_register_after_controller_gone() {
        let (handle, rx) = create_test_handle(4);
        drop(rx);

        let err = handle
            .register(Registration::Remove {
                room: lobby(),
                id: ConnectionId::next(),
            })
            .unwrap_err();
        assert_eq!(err, BrokerError::ShuttingDown);
        assert!(!handle.is_accepting());
    }

    // ========================================================================
    // join / leave
    // ========================================================================

    #[tokio::test]
    async fn test_join_receives_inbound_sink() {
        let (handle, mut rx) = create_test_handle(4);

        tokio::spawn(async move {
            if let Some(BrokerCommand::Register(Registration::Add { reply, .. })) = rx.recv().await
            {
                let (inbound, _keep) = mpsc::channel(1);
                let _ = reply.send(inbound);
            }
        });

        let (outbound, _out_rx) = outbound_channel(1);
        let result = handle.join(lobby(), ConnectionId::next(), outbound).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_join_room_unavailable() {
        let (handle, mut rx) = create_test_handle(4);

        tokio::spawn(async move {
            // Dropping the command closes the reply.
            let _ = rx.recv().await;
        });

        let (outbound, _out_rx) = outbound_channel(1);
        let err = handle
            .join(lobby(), ConnectionId::next(), outbound)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::RoomUnavailable(lobby()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_sends_remove() {
        let (handle, mut rx) = create_test_handle(4);
        let id = ConnectionId::next();

        let (outbound, _out_rx) = outbound_channel(1);
        let err = handle.join(lobby(), id, outbound).await.unwrap_err();
        assert_eq!(
            err,
            BrokerError::JoinTimeout {
                room: lobby(),
                timeout_ms: 5000
            }
        );

        assert!(matches!(
            rx.recv().await,
            Some(BrokerCommand::Register(Registration::Add { .. }))
        ));
        match rx.recv().await {
            Some(BrokerCommand::Register(Registration::Remove { room, id: removed })) => {
                assert_eq!(room, lobby());
                assert_eq!(removed, id);
            }
            other => panic!("expected Remove, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_is_best_effort() {
        let (handle, rx) = create_test_handle(1);
        drop(rx);

        // Must not panic or block.
        handle.leave(lobby(), ConnectionId::next());
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[tokio::test]
    async fn test_list_rooms_channel_closed() {
        let (handle, rx) = create_test_handle(1);
        drop(rx);

        assert_eq!(
            handle.list_rooms().await.unwrap_err(),
            BrokerError::ChannelClosed
        );
    }

    #[tokio::test]
    async fn test_stopped_flags() {
        let (tx, _rx) = mpsc::channel(1);
        let stopped = CancellationToken::new();
        let handle = BrokerHandle::new(tx, stopped.clone(), Duration::from_secs(1));

        assert!(handle.is_accepting());
        assert!(!handle.is_stopped());

        stopped.cancel();
        handle.stopped().await;
        assert!(handle.is_stopped());
        assert!(!handle.is_accepting());
    }
}
