//! Bounded per-connection outbound queues.
//!
//! An [`OutboundSink`] is the only sender feeding one connection's write
//! loop. Whoever holds it (a room or the relay) closes it by value, so a
//! sink can be closed at most once and the write loop sees the end of its
//! queue exactly when the holder lets go.

use tokio::sync::mpsc;

use roomcast_core::Payload;

/// Why a payload could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The queue is at capacity; the consumer is not keeping up.
    Full,
    /// The connection's write loop has already gone away.
    Closed,
}

/// Sending half of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundSink {
    tx: mpsc::Sender<Payload>,
}

/// Creates an outbound queue of the given capacity.
///
/// The receiver belongs to the connection's write loop; the sink is handed
/// to whichever actor will feed it.
pub fn outbound_channel(capacity: usize) -> (OutboundSink, mpsc::Receiver<Payload>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSink { tx }, rx)
}

impl OutboundSink {
    /// Queues a payload without waiting.
    pub fn try_deliver(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Returns true once the write loop has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Closes the queue. The write loop drains what is already queued and
    /// then finishes.
    pub fn close(self) {
        drop(self.tx);
    }
}
