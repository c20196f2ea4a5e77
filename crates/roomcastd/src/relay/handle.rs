//! Client interface for the relay actor.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use roomcast_core::{ConnectionId, Payload};

use super::commands::{RelayCommand, RelayError};
use crate::sink::OutboundSink;

/// How long `remove` waits for room in the relay queue.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle for interacting with the relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<RelayCommand>,
    stopped: CancellationToken,
    capacity: usize,
}

impl RelayHandle {
    pub fn new(sender: mpsc::Sender<RelayCommand>, stopped: CancellationToken) -> Self {
        let capacity = sender.max_capacity();
        Self {
            sender,
            stopped,
            capacity,
        }
    }

    /// Broadcast `payload` to every subscriber currently on `path`.
    ///
    /// Fire-and-forget: a full relay queue drops the frame with a warning.
    /// Subscribers that join later never see it.
    pub fn push(&self, payload: impl Into<Payload>, path: &str) {
        let payload = payload.into();
        let bytes = payload.len();
        match self.sender.try_send(RelayCommand::Push {
            path: path.to_string(),
            payload,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(path = %path, bytes, capacity = self.capacity, "Relay queue full, push dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(path = %path, bytes, "Relay stopped, push dropped");
            }
        }
    }

    /// Subscribe an outbound sink to `path`.
    ///
    /// # Errors
    ///
    /// - `RelayError::Backpressure` if the relay queue is full
    /// - `RelayError::ShuttingDown` if the relay has stopped
    pub fn add(
        &self,
        path: &str,
        id: ConnectionId,
        outbound: OutboundSink,
    ) -> Result<(), RelayError> {
        self.sender
            .try_send(RelayCommand::Add {
                path: path.to_string(),
                id,
                outbound,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RelayError::Backpressure {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => RelayError::ShuttingDown,
            })
    }

    /// Unsubscribe a connection. Waits briefly for queue space, then gives up.
    pub async fn remove(&self, path: &str, id: ConnectionId) {
        let command = RelayCommand::Remove {
            path: path.to_string(),
            id,
        };
        match timeout(REMOVE_TIMEOUT, self.sender.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(path = %path, connection_id = %id, "Relay stopped before remove"),
            Err(_) => warn!(path = %path, connection_id = %id, "Timed out submitting relay remove"),
        }
    }

    /// Current subscribers of `path`, sorted.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ChannelClosed` if the actor has stopped.
    pub async fn members(&self, path: &str) -> Result<Vec<ConnectionId>, RelayError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RelayCommand::Members {
                path: path.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;

        rx.await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Returns true once the relay has closed every sink.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Waits until the relay has fully stopped.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::outbound_channel;

    fn create_test_handle(capacity: usize) -> (RelayHandle, mpsc::Receiver<RelayCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (RelayHandle::new(tx, CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn test_push_enqueues() {
        let (handle, mut rx) = create_test_handle(4);
        handle.push(b"tick".to_vec(), "/feed");

        match rx.recv().await {
            Some(RelayCommand::Push { path, payload }) => {
                assert_eq!(path, "/feed");
                assert_eq!(payload, Payload::from(b"tick".to_vec()));
            }
            other => panic!("expected Push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_overflow_is_dropped() {
        let (handle, mut rx) = create_test_handle(1);
        handle.push("first", "/feed");
        handle.push("second", "/feed");

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_add_backpressure_and_shutdown() {
        let (handle, rx) = create_test_handle(1);

        let (sink, _out) = outbound_channel(1);
        handle.add("/feed", ConnectionId::next(), sink).unwrap();

        let (sink, _out) = outbound_channel(1);
        assert_eq!(
            handle.add("/feed", ConnectionId::next(), sink).unwrap_err(),
            RelayError::Backpressure { capacity: 1 }
        );

        drop(rx);
        let (sink, _out) = outbound_channel(1);
        assert_eq!(
            handle.add("/feed", ConnectionId::next(), sink).unwrap_err(),
            RelayError::ShuttingDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_gives_up_when_queue_stays_full() {
        let (handle, _rx) = create_test_handle(1);
        handle.push("filler", "/feed");

        // Returns after the timeout instead of blocking forever.
        handle.remove("/feed", ConnectionId::next()).await;
    }

    #[tokio::test]
    async fn test_members_channel_closed() {
        let (handle, rx) = create_test_handle(1);
        drop(rx);
        assert_eq!(
            handle.members("/feed").await.unwrap_err(),
            RelayError::ChannelClosed
        );
    }
}
