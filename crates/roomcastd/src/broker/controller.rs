//! Broker controller - owns the room map and routes registrations.
//!
//! The controller is the only task that touches `RoomName → RoomHandle`.
//! It creates rooms lazily on the first join, forwards registrations to
//! them without ever blocking its own loop, and forgets rooms when they
//! report their exit.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` outside tests
//! - Each room runs under `catch_unwind`; a panicking room still reports
//!   its exit and still counts down the task tracker
//! - Replies to callers that went away are ignored

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use roomcast_core::RoomName;

use super::commands::{BrokerCommand, ExitReason, Registration, RoomCommand, RoomExit, RoomInfo};
use super::room::{age, new_room, RoomHandle, RoomSettings};

/// The broker controller.
pub struct BrokerController {
    receiver: mpsc::Receiver<BrokerCommand>,
    rooms: HashMap<RoomName, RoomHandle>,

    exits_tx: mpsc::UnboundedSender<RoomExit>,
    exits_rx: mpsc::UnboundedReceiver<RoomExit>,

    /// Counts every room task and every pending forward.
    tracker: TaskTracker,
    settings: RoomSettings,
    next_generation: u64,

    /// Process-wide shutdown signal.
    shutdown: CancellationToken,
    /// Parent of every room's shutdown token.
    rooms_token: CancellationToken,
    /// Cancelled once every room has terminated.
    stopped: CancellationToken,
}

impl BrokerController {
    pub fn new(
        receiver: mpsc::Receiver<BrokerCommand>,
        settings: RoomSettings,
        shutdown: CancellationToken,
        rooms_token: CancellationToken,
        stopped: CancellationToken,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            receiver,
            rooms: HashMap::new(),
            exits_tx,
            exits_rx,
            tracker: TaskTracker::new(),
            settings,
            next_generation: 0,
            shutdown,
            rooms_token,
            stopped,
        }
    }

    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            idle_timeout_ms = self.settings.idle_timeout.as_millis() as u64,
            echo_suppression = self.settings.echo_suppression,
            "Broker controller starting"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(exit) = self.exits_rx.recv() => self.handle_exit(exit),

                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All broker handles dropped");
                        break;
                    }
                },
            }
        }

        self.shut_down().await;
    }

    fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Register(Registration::Add {
                room,
                id,
                outbound,
                reply,
            }) => {
                debug!(room = %room, connection_id = %id, "Routing join");
                let handle = self.room_for(&room);
                self.forward(
                    handle,
                    RoomCommand::Join {
                        id,
                        outbound,
                        reply,
                    },
                );
            }
            BrokerCommand::Register(Registration::Remove { room, id }) => {
                match self.live_room(&room) {
                    Some(handle) => self.forward(handle, RoomCommand::Leave { id }),
                    None => {
                        debug!(
                            room = %room,
                            connection_id = %id,
                            "Remove for inactive room ignored"
                        );
                    }
                }
            }
            BrokerCommand::ListRooms { respond_to } => {
                let mut rooms: Vec<RoomInfo> = self
                    .rooms
                    .values()
                    .filter(|handle| !handle.is_stopped())
                    .map(|handle| handle.info().clone())
                    .collect();
                rooms.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = respond_to.send(rooms);
            }
            BrokerCommand::RoomMembers { room, respond_to } => match self.live_room(&room) {
                Some(handle) => self.forward(handle, RoomCommand::Members { respond_to }),
                None => {
                    let _ = respond_to.send(None);
                }
            },
        }
    }

    fn live_room(&self, name: &RoomName) -> Option<RoomHandle> {
        self.rooms
            .get(name)
            .filter(|handle| !handle.is_stopped())
            .cloned()
    }

    /// Returns the live room for `name`, creating one if needed.
    fn room_for(&mut self, name: &RoomName) -> RoomHandle {
        match self.live_room(name) {
            Some(handle) => handle,
            None => self.spawn_room(name.clone()),
        }
    }

    fn spawn_room(&mut self, name: RoomName) -> RoomHandle {
        self.next_generation += 1;
        let generation = self.next_generation;

        let (actor, handle) = new_room(
            name.clone(),
            generation,
            self.settings,
            self.rooms_token.child_token(),
        );

        let exits = self.exits_tx.clone();
        let stopped = handle.stopped.clone();
        let room = name.clone();
        self.tracker.spawn(async move {
            let exit = match AssertUnwindSafe(actor.run()).catch_unwind().await {
                Ok(exit) => exit,
                Err(_) => {
                    stopped.cancel();
                    error!(room = %room, generation, "Room actor panicked");
                    RoomExit {
                        name: room,
                        generation,
                        reason: ExitReason::Panicked,
                    }
                }
            };
            let _ = exits.send(exit);
        });

        if let Some(previous) = self.rooms.insert(name.clone(), handle.clone()) {
            debug!(
                room = %name,
                previous_generation = previous.generation(),
                "Replacing stopped room"
            );
        }
        info!(
            room = %name,
            generation,
            rooms = self.rooms.len(),
            "Room created"
        );

        handle
    }

    /// Hands a command to a room without blocking the controller.
    ///
    /// If the room's queue is full the send moves to a tracked task that
    /// gives up as soon as the room stops. A dropped command closes any
    /// reply channel it carries.
    fn forward(&self, room: RoomHandle, command: RoomCommand) {
        match room.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(room = %room.info().name, "Room closed before forward");
            }
            Err(mpsc::error::TrySendError::Full(command)) => {
                self.tracker.spawn(async move {
                    tokio::select! {
                        result = room.commands.send(command) => {
                            if result.is_err() {
                                debug!(room = %room.info().name, "Room closed during forward");
                            }
                        }
                        _ = room.stopped.cancelled() => {
                            debug!(room = %room.info().name, "Room stopped before forward");
                        }
                    }
                });
            }
        }
    }

    fn handle_exit(&mut self, exit: RoomExit) {
        let current = self
            .rooms
            .get(&exit.name)
            .is_some_and(|handle| handle.generation() == exit.generation);

        if !current {
            debug!(
                room = %exit.name,
                generation = exit.generation,
                "Stale room exit ignored"
            );
            return;
        }

        if let Some(handle) = self.rooms.remove(&exit.name) {
            info!(
                room = %exit.name,
                generation = exit.generation,
                reason = ?exit.reason,
                age_secs = age(handle.info().created_at).num_seconds(),
                rooms = self.rooms.len(),
                "Room cleaned up"
            );
        }
    }

    async fn shut_down(mut self) {
        info!(rooms = self.rooms.len(), "Broker shutting down");

        self.receiver.close();
        let mut refused = 0usize;
        while let Ok(command) = self.receiver.try_recv() {
            if let BrokerCommand::Register(Registration::Add { room, id, .. }) = command {
                refused += 1;
                debug!(room = %room, connection_id = %id, "Refused queued join");
            }
        }

        self.rooms_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let mut exits = 0usize;
        while self.exits_rx.try_recv().is_ok() {
            exits += 1;
        }
        self.rooms.clear();

        info!(
            joins_refused = refused,
            rooms_stopped = exits,
            "Broker stopped"
        );
        self.stopped.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::outbound_channel;
    use roomcast_core::ConnectionId;
    use tokio::sync::oneshot;
    use tokio::time::Duration;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    struct TestController {
        controller: BrokerController,
        shutdown: CancellationToken,
    }

    fn create_test_controller() -> TestController {
        let (_tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let settings = RoomSettings {
            idle_timeout: Duration::from_secs(10),
            inbound_capacity: 8,
            echo_suppression: true,
        };
        let controller = BrokerController::new(
            rx,
            settings,
            shutdown.clone(),
            shutdown.child_token(),
            CancellationToken::new(),
        );
        TestController {
            controller,
            shutdown,
        }
    }

    fn lobby() -> RoomName {
        RoomName::from_path("/lobby").unwrap()
    }

    // ========================================================================
    // Room map
    // ========================================================================

    #[tokio::test]
    async fn test_room_created_lazily_once() {
        let mut t = create_test_controller();

        let first = t.controller.room_for(&lobby());
        let second = t.controller.room_for(&lobby());

        assert_eq!(first.generation(), second.generation());
        assert_eq!(t.controller.rooms.len(), 1);
        t.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stopped_room_is_replaced() {
        let mut t = create_test_controller();

        let first = t.controller.room_for(&lobby());
        first.stopped.cancel();

        let second = t.controller.room_for(&lobby());
        assert!(second.generation() > first.generation());
        assert_eq!(t.controller.rooms.len(), 1);
        t.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stale_exit_does_not_remove_newer_room() {
        let mut t = create_test_controller();

        let first = t.controller.room_for(&lobby());
        first.stopped.cancel();
        let second = t.controller.room_for(&lobby());

        t.controller.handle_exit(RoomExit {
            name: lobby(),
            generation: first.generation(),
            reason: ExitReason::Idle,
        });
        assert!(t.controller.rooms.contains_key(&lobby()));

        t.controller.handle_exit(RoomExit {
            name: lobby(),
            generation: second.generation(),
            reason: ExitReason::Idle,
        });
        assert!(!t.controller.rooms.contains_key(&lobby()));
        t.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_remove_for_unknown_room_creates_nothing() {
        let mut t = create_test_controller();

        t.controller
            .handle_command(BrokerCommand::Register(Registration::Remove {
                room: lobby(),
                id: ConnectionId::next(),
            }));
        assert!(t.controller.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_add_routes_to_room() {
        let mut t = create_test_controller();
        let (outbound, _rx) = outbound_channel(4);
        let (reply, reply_rx) = oneshot::channel();

        t.controller
            .handle_command(BrokerCommand::Register(Registration::Add {
                room: lobby(),
                id: ConnectionId::next(),
                outbound,
                reply,
            }));

        assert!(reply_rx.await.is_ok());
        assert_eq!(t.controller.rooms.len(), 1);
        t.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_members_of_unknown_room() {
        let mut t = create_test_controller();
        let (tx, rx) = oneshot::channel();

        t.controller.handle_command(BrokerCommand::RoomMembers {
            room: lobby(),
            respond_to: tx,
        });
        assert_eq!(rx.await.unwrap(), None);
    }
}
