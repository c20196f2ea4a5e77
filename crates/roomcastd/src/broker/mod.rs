//! Room broker using the actor pattern.
//!
//! The broker groups connections into rooms keyed by URL path. A single
//! controller task owns the room map; each room is its own actor owning
//! its member set. Connections talk to the controller only through
//! registrations and to their room only through its inbound sink.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  Registration  ┌──────────────────┐  RoomCommand  ┌─────────────┐
//! │  Connection  │───────────────▶│ BrokerController │──────────────▶│  RoomActor  │
//! │     pump     │   (try_send)   │   RoomName →     │  (forwarded)  │  id → sink  │
//! └──────┬───────┘                │    RoomHandle    │◀──────────────└──────▲──────┘
//!        │                        └──────────────────┘   RoomExit           │
//!        │                     Message (inbound sink)                        │
//!        └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use roomcast_core::BrokerConfig;

mod commands;
mod controller;
mod handle;
mod room;

pub use commands::{
    BrokerCommand, BrokerError, ExitReason, InboundSink, Registration, RoomCommand, RoomExit,
    RoomInfo,
};
pub use controller::BrokerController;
pub use handle::BrokerHandle;
pub use room::{new_room, RoomActor, RoomHandle, RoomSettings, ROOM_COMMAND_BUFFER};

/// Spawn the broker controller and return a handle for interaction.
///
/// The controller stops when `shutdown` is cancelled (or every handle is
/// dropped). It then refuses queued joins, stops every room, waits for all
/// of them and finally fires the handle's `stopped` signal.
///
/// # Example
///
/// ```no_run
/// use roomcastd::broker::spawn_broker;
/// use roomcast_core::BrokerConfig;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let shutdown = CancellationToken::new();
///     let broker = spawn_broker(&BrokerConfig::default(), shutdown.clone());
///
///     shutdown.cancel();
///     broker.stopped().await;
/// }
/// ```
pub fn spawn_broker(config: &BrokerConfig, shutdown: CancellationToken) -> BrokerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.registration_capacity);
    let rooms_token = shutdown.child_token();
    let stopped = CancellationToken::new();

    let controller = BrokerController::new(
        cmd_rx,
        RoomSettings::from(config),
        shutdown,
        rooms_token.clone(),
        stopped.clone(),
    );

    let signal = stopped.clone();
    tokio::spawn(async move {
        if AssertUnwindSafe(controller.run())
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Broker controller panicked");
            rooms_token.cancel();
            signal.cancel();
        }
    });

    BrokerHandle::new(cmd_tx, stopped, config.join_timeout())
}
