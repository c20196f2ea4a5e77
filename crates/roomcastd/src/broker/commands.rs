//! Broker commands, room commands, and errors.
//!
//! This module defines the message types flowing through the broker:
//! - `Registration`: join/leave events submitted by connections
//! - `BrokerCommand`: everything the controller's queue carries
//! - `RoomCommand`: what the controller forwards to a single room
//! - `BrokerError`: failures surfaced to callers of `BrokerHandle`

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use roomcast_core::{ConnectionId, Message, RoomName};

use crate::sink::OutboundSink;

/// Sender a member uses to submit messages into its room.
pub type InboundSink = mpsc::Sender<Message>;

// ============================================================================
// Registrations
// ============================================================================

/// A request to add a connection to, or remove it from, a room.
#[derive(Debug)]
pub enum Registration {
    /// Join `room`, creating it if needed.
    ///
    /// On success the room replies with its inbound sink. If the reply
    /// channel is dropped instead, the room stopped before it could admit
    /// the member and `outbound` has already been dropped with it.
    Add {
        room: RoomName,
        id: ConnectionId,
        outbound: OutboundSink,
        reply: oneshot::Sender<InboundSink>,
    },

    /// Leave `room`. Ignored if the room or member is already gone.
    Remove { room: RoomName, id: ConnectionId },
}

// ============================================================================
// Controller queue
// ============================================================================

/// Snapshot of one live room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub name: RoomName,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

/// Commands carried by the controller's bounded queue.
#[derive(Debug)]
pub enum BrokerCommand {
    Register(Registration),

    /// List rooms currently held by the controller.
    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomInfo>>,
    },

    /// Ask a room for its member ids. Replies `None` if the room is not live.
    RoomMembers {
        room: RoomName,
        respond_to: oneshot::Sender<Option<Vec<ConnectionId>>>,
    },
}

// ============================================================================
// Room commands
// ============================================================================

/// Commands forwarded from the controller to a room actor.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        id: ConnectionId,
        outbound: OutboundSink,
        reply: oneshot::Sender<InboundSink>,
    },
    Leave {
        id: ConnectionId,
    },
    Members {
        respond_to: oneshot::Sender<Option<Vec<ConnectionId>>>,
    },
}

/// Why a room actor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// An idle period elapsed with no members.
    Idle,
    /// Process shutdown.
    Shutdown,
    /// The actor panicked and was contained.
    Panicked,
}

/// Notice sent to the controller when a room actor ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomExit {
    pub name: RoomName,
    pub generation: u64,
    pub reason: ExitReason,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by `BrokerHandle`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The registration queue is full.
    #[error("registration queue is full ({capacity} pending)")]
    Backpressure { capacity: usize },

    /// The controller is no longer accepting registrations.
    #[error("broker is shutting down")]
    ShuttingDown,

    /// The target room stopped before admitting the member.
    #[error("room {0} is unavailable")]
    RoomUnavailable(RoomName),

    /// No reply arrived within the join timeout.
    #[error("timed out joining room {room} after {timeout_ms}ms")]
    JoinTimeout { room: RoomName, timeout_ms: u64 },

    /// A query could not be answered because the controller is gone.
    #[error("broker channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let room = RoomName::from_path("/lobby").unwrap();
        assert_eq!(
            BrokerError::RoomUnavailable(room.clone()).to_string(),
            "room /lobby is unavailable"
        );
        assert_eq!(
            BrokerError::JoinTimeout {
                room,
                timeout_ms: 5000
            }
            .to_string(),
            "timed out joining room /lobby after 5000ms"
        );
        assert!(BrokerError::Backpressure { capacity: 100 }
            .to_string()
            .contains("100"));
    }
}
