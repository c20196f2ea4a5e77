//! roomcastd - WebSocket room broker and multi-path relay
//!
//! This library exposes the daemon's building blocks so they can be
//! embedded and tested:
//!
//! - [`broker`]: controller and room actors (rooms keyed by URL path)
//! - [`relay`]: in-process `push(payload, path)` to relay subscribers
//! - [`server`]: axum router, health/push endpoints, connection pumps
//! - [`client`]: websocket dialer used by the CLI and tests
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()` outside tests.

pub mod broker;
pub mod client;
pub mod relay;
pub mod server;
pub mod sink;

pub use broker::{spawn_broker, BrokerError, BrokerHandle};
pub use client::{dial, ClientConnection, ClientError, ClientFraming, ClientMode};
pub use relay::{spawn_relay, InboundStream, RelayError, RelayHandle};
pub use server::{RoomcastServer, ServerError};
pub use sink::{outbound_channel, DeliveryError, OutboundSink};
