//! Multi-path relay.
//!
//! The relay is the in-process way to push frames to websocket clients:
//! any task holding a `RelayHandle` can `push(payload, path)` and every
//! outbound-capable connection currently attached to that path receives
//! it. There is no history; late subscribers start from the next push.
//!
//! Connections attach in one of three roles (see `ConnectionRole`).
//! Inbound-capable connections hand their frames to the application as an
//! [`InboundStream`]; outbound-capable ones subscribe a sink here.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - A panicking actor is contained and still signals `stopped`

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use roomcast_core::RelayConfig;

mod actor;
mod commands;
mod handle;

pub use actor::RelayActor;
pub use commands::{InboundStream, RelayCommand, RelayError};
pub use handle::RelayHandle;

/// Spawn the relay actor and return a handle for interaction.
///
/// The actor stops when `shutdown` is cancelled, closing every subscriber
/// sink before the handle's `stopped` signal fires.
pub fn spawn_relay(config: &RelayConfig, shutdown: CancellationToken) -> RelayHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);
    let stopped = CancellationToken::new();

    let actor = RelayActor::new(cmd_rx, shutdown, stopped.clone());

    let signal = stopped.clone();
    tokio::spawn(async move {
        if AssertUnwindSafe(actor.run()).catch_unwind().await.is_err() {
            error!("Relay actor panicked");
            signal.cancel();
        }
    });

    RelayHandle::new(cmd_tx, stopped)
}
