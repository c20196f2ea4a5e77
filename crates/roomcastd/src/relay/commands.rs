//! Relay actor commands, inbound streams, and errors.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use roomcast_core::{ConnectionId, Payload};

use crate::sink::OutboundSink;

/// Commands sent to the relay actor.
#[derive(Debug)]
pub enum RelayCommand {
    /// Subscribe a connection's outbound sink to `path`.
    Add {
        path: String,
        id: ConnectionId,
        outbound: OutboundSink,
    },

    /// Unsubscribe a connection. Unknown paths and ids are ignored.
    Remove { path: String, id: ConnectionId },

    /// Deliver `payload` to every current subscriber of `path`.
    Push { path: String, payload: Payload },

    /// Subscriber ids for `path`, sorted.
    Members {
        path: String,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },
}

/// Frames received from one inbound-capable relay connection.
///
/// `frames` ends when the client disconnects.
#[derive(Debug)]
pub struct InboundStream {
    pub connection_id: ConnectionId,
    pub path: String,
    pub frames: mpsc::Receiver<Payload>,
}

/// Errors returned by `RelayHandle`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The relay command queue is full.
    #[error("relay queue is full ({capacity} pending)")]
    Backpressure { capacity: usize },

    /// The relay actor has stopped.
    #[error("relay is shutting down")]
    ShuttingDown,

    /// A query could not be answered because the actor is gone.
    #[error("relay channel closed")]
    ChannelClosed,
}
