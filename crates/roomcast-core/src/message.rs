//! Messages carried between connections, rooms and the relay.

use crate::id::ConnectionId;

/// Text sent to a peer right before a clean close.
pub const GOODBYE: &str = "goodbye";

/// Opaque frame content.
///
/// Rooms carry text, the relay carries binary. Neither side inspects the
/// content beyond checking for emptiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns true for zero-length frames, which are never forwarded.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Binary(bytes) => bytes.is_empty(),
        }
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Consumes the payload and returns its raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// A payload plus the connection it came from.
///
/// `origin` lets a room skip the sender when fanning out. A message with
/// no origin goes to every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Payload,
    pub origin: Option<ConnectionId>,
}

impl Message {
    /// Creates a message sent by a member connection.
    pub fn from_member(origin: ConnectionId, payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            origin: Some(origin),
        }
    }

    /// Creates a message with no originating member.
    pub fn broadcast(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            origin: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_empty() {
        assert!(Payload::from("").is_empty());
        assert!(Payload::from(Vec::new()).is_empty());
        assert!(!Payload::from("hi").is_empty());
        assert!(!Payload::from(vec![0u8]).is_empty());
    }

    #[test]
    fn test_payload_into_bytes() {
        assert_eq!(Payload::from("hi").into_bytes(), b"hi".to_vec());
        assert_eq!(Payload::from(vec![1u8, 2]).into_bytes(), vec![1u8, 2]);
    }

    #[test]
    fn test_message_constructors() {
        let id = ConnectionId::next();
        let msg = Message::from_member(id, "hello");
        assert_eq!(msg.origin, Some(id));
        assert_eq!(msg.payload.len(), 5);

        let msg = Message::broadcast(vec![1u8, 2, 3]);
        assert!(msg.origin.is_none());
    }
}
