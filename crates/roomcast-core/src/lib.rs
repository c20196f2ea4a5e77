//! roomcast core - shared types for the room broker and relay
//!
//! This crate provides the domain types shared between the daemon
//! (roomcastd) and the command-line client (roomcast).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod role;
pub mod room;

// Re-exports for convenience
pub use config::{BrokerConfig, Config, ConfigError, RelayConfig, RelayEndpointConfig};
pub use error::{DomainError, DomainResult};
pub use id::ConnectionId;
pub use message::{Message, Payload, GOODBYE};
pub use role::ConnectionRole;
pub use room::RoomName;
