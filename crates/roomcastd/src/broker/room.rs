//! Room actor - owns one room's member set and fans out messages.
//!
//! A room moves through three states:
//!
//! ```text
//! Active ──(idle with no members | shutdown)──▶ Draining ──▶ Terminated
//! ```
//!
//! While draining, the stop token is already cancelled so the controller's
//! forwarders give up, queued joins are refused by dropping their reply,
//! and every member sink is closed exactly once.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` outside tests
//! - Sends to members never block; a full sink evicts its member
//! - Reply channels whose receivers are gone are ignored

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roomcast_core::{BrokerConfig, ConnectionId, Message, RoomName};

use super::commands::{ExitReason, InboundSink, RoomCommand, RoomExit, RoomInfo};
use crate::sink::{DeliveryError, OutboundSink};

/// Capacity of each room's command queue.
pub const ROOM_COMMAND_BUFFER: usize = 32;

// ============================================================================
// Room Handle
// ============================================================================

/// Controller-side reference to a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub(crate) commands: mpsc::Sender<RoomCommand>,
    pub(crate) stopped: CancellationToken,
    pub(crate) info: RoomInfo,
}

impl RoomHandle {
    /// Returns true once the room has started draining or is gone.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled() || self.commands.is_closed()
    }

    pub fn generation(&self) -> u64 {
        self.info.generation
    }

    pub fn info(&self) -> &RoomInfo {
        &self.info
    }
}

// ============================================================================
// Room Settings
// ============================================================================

/// Per-room tunables taken from the broker configuration.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    pub idle_timeout: Duration,
    pub inbound_capacity: usize,
    pub echo_suppression: bool,
}

impl From<&BrokerConfig> for RoomSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            inbound_capacity: config.inbound_capacity,
            echo_suppression: config.echo_suppression,
        }
    }
}

// ============================================================================
// Room Actor
// ============================================================================

/// The room actor - single owner of a room's members.
pub struct RoomActor {
    name: RoomName,
    generation: u64,
    commands: mpsc::Receiver<RoomCommand>,

    /// Kept so the inbound queue stays open for the room's whole life;
    /// members receive clones of it.
    inbound_tx: InboundSink,
    inbound_rx: mpsc::Receiver<Message>,

    members: HashMap<ConnectionId, OutboundSink>,
    settings: RoomSettings,

    /// Cancelled by process shutdown.
    shutdown: CancellationToken,
    /// Cancelled by the room itself when it starts draining.
    stopped: CancellationToken,
}

/// Creates a room actor and the handle the controller keeps for it.
pub fn new_room(
    name: RoomName,
    generation: u64,
    settings: RoomSettings,
    shutdown: CancellationToken,
) -> (RoomActor, RoomHandle) {
    let (cmd_tx, cmd_rx) = mpsc::channel(ROOM_COMMAND_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity);
    let stopped = CancellationToken::new();

    let handle = RoomHandle {
        commands: cmd_tx,
        stopped: stopped.clone(),
        info: RoomInfo {
            name: name.clone(),
            generation,
            created_at: Utc::now(),
        },
    };

    let actor = RoomActor {
        name,
        generation,
        commands: cmd_rx,
        inbound_tx,
        inbound_rx,
        members: HashMap::new(),
        settings,
        shutdown,
        stopped,
    };

    (actor, handle)
}

impl RoomActor {
    /// Runs the room until it goes idle or the process shuts down.
    pub async fn run(mut self) -> RoomExit {
        info!(
            room = %self.name,
            generation = self.generation,
            "Room started"
        );

        let idle_timeout = self.settings.idle_timeout;
        let idle = time::sleep(idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break ExitReason::Shutdown,

                Some(command) = self.commands.recv() => {
                    if self.handle_command(command) {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }

                Some(message) = self.inbound_rx.recv() => {
                    self.fan_out(message);
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }

                () = &mut idle => {
                    self.prune_closed();
                    if self.members.is_empty() {
                        break ExitReason::Idle;
                    }
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
            }
        };

        self.drain(reason)
    }

    /// Applies one command. Returns true if it counts as activity.
    fn handle_command(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join {
                id,
                outbound,
                reply,
            } => {
                if reply.send(self.inbound_tx.clone()).is_err() {
                    // The joiner gave up waiting; its sink goes with this scope.
                    debug!(
                        room = %self.name,
                        connection_id = %id,
                        "Joiner went away before admission"
                    );
                    return true;
                }
                if let Some(previous) = self.members.insert(id, outbound) {
                    previous.close();
                }
                info!(
                    room = %self.name,
                    connection_id = %id,
                    members = self.members.len(),
                    "Member joined"
                );
                true
            }
            RoomCommand::Leave { id } => {
                match self.members.remove(&id) {
                    Some(sink) => {
                        sink.close();
                        info!(
                            room = %self.name,
                            connection_id = %id,
                            members = self.members.len(),
                            "Member left"
                        );
                    }
                    None => {
                        debug!(
                            room = %self.name,
                            connection_id = %id,
                            "Leave for unknown member ignored"
                        );
                    }
                }
                true
            }
            RoomCommand::Members { respond_to } => {
                let mut ids: Vec<ConnectionId> = self.members.keys().copied().collect();
                ids.sort();
                let _ = respond_to.send(Some(ids));
                false
            }
        }
    }

    /// Delivers a message to every member except (optionally) its origin.
    fn fan_out(&mut self, message: Message) {
        if message.payload.is_empty() {
            return;
        }

        let mut evicted = Vec::new();
        let mut gone = Vec::new();
        let mut delivered = 0usize;

        for (id, sink) in &self.members {
            if self.settings.echo_suppression && message.origin == Some(*id) {
                continue;
            }
            match sink.try_deliver(message.payload.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Full) => evicted.push(*id),
                Err(DeliveryError::Closed) => gone.push(*id),
            }
        }

        for id in evicted {
            if let Some(sink) = self.members.remove(&id) {
                sink.close();
                warn!(
                    room = %self.name,
                    connection_id = %id,
                    "Evicted slow consumer"
                );
            }
        }

        for id in gone {
            if let Some(sink) = self.members.remove(&id) {
                sink.close();
                debug!(
                    room = %self.name,
                    connection_id = %id,
                    "Dropped member with closed sink"
                );
            }
        }

        debug!(
            room = %self.name,
            bytes = message.payload.len(),
            delivered,
            "Relayed message"
        );
    }

    /// Removes members whose write loops have already finished.
    fn prune_closed(&mut self) {
        let name = &self.name;
        self.members.retain(|id, sink| {
            let open = !sink.is_closed();
            if !open {
                debug!(room = %name, connection_id = %id, "Pruned closed member");
            }
            open
        });
    }

    /// Stops admitting work, refuses queued joins and closes every sink.
    fn drain(mut self, reason: ExitReason) -> RoomExit {
        self.stopped.cancel();
        self.commands.close();

        let mut refused = 0usize;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RoomCommand::Join { id, .. } => {
                    refused += 1;
                    debug!(
                        room = %self.name,
                        connection_id = %id,
                        "Refused join to stopping room"
                    );
                }
                RoomCommand::Members { respond_to } => {
                    let _ = respond_to.send(None);
                }
                RoomCommand::Leave { .. } => {}
            }
        }

        let closed = self.members.len();
        for (_, sink) in self.members.drain() {
            sink.close();
        }

        info!(
            room = %self.name,
            generation = self.generation,
            reason = ?reason,
            members_closed = closed,
            joins_refused = refused,
            "Room stopped"
        );

        RoomExit {
            name: self.name,
            generation: self.generation,
            reason,
        }
    }
}

/// Time a room has existed, for logging.
pub(crate) fn age(created_at: DateTime<Utc>) -> chrono::Duration {
    Utc::now().signed_duration_since(created_at)
}
