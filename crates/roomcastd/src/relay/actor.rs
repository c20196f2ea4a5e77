//! Relay actor - owns every path's subscriber set.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` outside tests
//! - Pushes never block on a subscriber; a full sink evicts it

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roomcast_core::{ConnectionId, Payload};

use super::commands::RelayCommand;
use crate::sink::{DeliveryError, OutboundSink};

type Subscribers = HashMap<ConnectionId, OutboundSink>;

/// The relay actor.
///
/// Owns `path → (ConnectionId → OutboundSink)`. Paths exist only while
/// they have at least one subscriber.
pub struct RelayActor {
    receiver: mpsc::Receiver<RelayCommand>,
    paths: HashMap<String, Subscribers>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl RelayActor {
    pub fn new(
        receiver: mpsc::Receiver<RelayCommand>,
        shutdown: CancellationToken,
        stopped: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            paths: HashMap::new(),
            shutdown,
            stopped,
        }
    }

    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Relay actor starting");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        self.receiver.close();
        let mut discarded = 0usize;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }

        let mut closed = 0usize;
        for (_, subscribers) in self.paths.drain() {
            for (_, sink) in subscribers {
                sink.close();
                closed += 1;
            }
        }

        info!(
            subscribers_closed = closed,
            commands_discarded = discarded,
            "Relay stopped"
        );
        self.stopped.cancel();
    }

    fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Add { path, id, outbound } => {
                let subscribers = self.paths.entry(path.clone()).or_default();
                if let Some(previous) = subscribers.insert(id, outbound) {
                    previous.close();
                }
                info!(
                    path = %path,
                    connection_id = %id,
                    subscribers = subscribers.len(),
                    "Relay subscriber added"
                );
            }
            RelayCommand::Remove { path, id } => self.remove(&path, id),
            RelayCommand::Push { path, payload } => self.push(&path, payload),
            RelayCommand::Members { path, respond_to } => {
                let mut ids: Vec<ConnectionId> = self
                    .paths
                    .get(&path)
                    .map(|subscribers| subscribers.keys().copied().collect())
                    .unwrap_or_default();
                ids.sort();
                let _ = respond_to.send(ids);
            }
        }
    }

    fn remove(&mut self, path: &str, id: ConnectionId) {
        let Some(subscribers) = self.paths.get_mut(path) else {
            debug!(path = %path, connection_id = %id, "Remove for unknown path ignored");
            return;
        };

        if let Some(sink) = subscribers.remove(&id) {
            sink.close();
            info!(
                path = %path,
                connection_id = %id,
                subscribers = subscribers.len(),
                "Relay subscriber removed"
            );
        }

        if subscribers.is_empty() {
            self.paths.remove(path);
            debug!(path = %path, "Relay path emptied");
        }
    }

    fn push(&mut self, path: &str, payload: Payload) {
        if payload.is_empty() {
            return;
        }

        let Some(subscribers) = self.paths.get_mut(path) else {
            debug!(path = %path, bytes = payload.len(), "Push with no subscribers dropped");
            return;
        };

        let mut evicted = Vec::new();
        let mut gone = Vec::new();
        for (id, sink) in subscribers.iter() {
            match sink.try_deliver(payload.clone()) {
                Ok(()) => {}
                Err(DeliveryError::Full) => evicted.push(*id),
                Err(DeliveryError::Closed) => gone.push(*id),
            }
        }

        for id in evicted {
            if let Some(sink) = subscribers.remove(&id) {
                sink.close();
                warn!(path = %path, connection_id = %id, "Evicted slow relay subscriber");
            }
        }
        for id in gone {
            if let Some(sink) = subscribers.remove(&id) {
                sink.close();
                debug!(path = %path, connection_id = %id, "Dropped relay subscriber with closed sink");
            }
        }

        debug!(
            path = %path,
            bytes = payload.len(),
            subscribers = subscribers.len(),
            "Pushed frame"
        );

        if subscribers.is_empty() {
            self.paths.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::outbound_channel;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    fn create_test_actor() -> RelayActor {
        let (_tx, rx) = mpsc::channel(8);
        RelayActor::new(rx, CancellationToken::new(), CancellationToken::new())
    }

    fn add(
        actor: &mut RelayActor,
        path: &str,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<Payload>) {
        let id = ConnectionId::next();
        let (outbound, rx) = outbound_channel(capacity);
        actor.handle_command(RelayCommand::Add {
            path: path.to_string(),
            id,
            outbound,
        });
        (id, rx)
    }

    fn push(actor: &mut RelayActor, path: &str, bytes: &[u8]) {
        actor.handle_command(RelayCommand::Push {
            path: path.to_string(),
            payload: Payload::from(bytes.to_vec()),
        });
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[test]
    fn test_push_reaches_all_subscribers_of_path() {
        let mut actor = create_test_actor();
        let (_a, mut rx_a) = add(&mut actor, "/feed", 4);
        let (_b, mut rx_b) = add(&mut actor, "/feed", 4);
        let (_c, mut rx_c) = add(&mut actor, "/other", 4);

        push(&mut actor, "/feed", b"tick");

        assert_eq!(rx_a.try_recv().unwrap(), Payload::from(b"tick".to_vec()));
        assert_eq!(rx_b.try_recv().unwrap(), Payload::from(b"tick".to_vec()));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_push_without_subscribers_is_dropped() {
        let mut actor = create_test_actor();
        push(&mut actor, "/feed", b"early");

        let (_a, mut rx_a) = add(&mut actor, "/feed", 4);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_empty_path_removed() {
        let mut actor = create_test_actor();
        let (a, mut rx_a) = add(&mut actor, "/feed", 4);
        assert!(actor.paths.contains_key("/feed"));

        actor.handle_command(RelayCommand::Remove {
            path: "/feed".to_string(),
            id: a,
        });
        assert!(!actor.paths.contains_key("/feed"));
        assert!(matches!(
            rx_a.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_slow_subscriber_evicted() {
        let mut actor = create_test_actor();
        let (fast, mut rx_fast) = add(&mut actor, "/feed", 4);
        let (slow, mut rx_slow) = add(&mut actor, "/feed", 1);

        push(&mut actor, "/feed", b"one");
        push(&mut actor, "/feed", b"two");

        let members = &actor.paths["/feed"];
        assert!(members.contains_key(&fast));
        assert!(!members.contains_key(&slow));

        assert!(rx_fast.try_recv().is_ok());
        assert!(rx_fast.try_recv().is_ok());
        assert_eq!(rx_slow.try_recv().unwrap(), Payload::from(b"one".to_vec()));
        assert!(matches!(
            rx_slow.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut actor = create_test_actor();
        actor.handle_command(RelayCommand::Remove {
            path: "/nowhere".to_string(),
            id: ConnectionId::next(),
        });
        assert!(actor.paths.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_sinks() {
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();
        let actor = RelayActor::new(rx, shutdown.clone(), stopped.clone());

        let (outbound, mut out_rx) = outbound_channel(4);
        tx.send(RelayCommand::Add {
            path: "/feed".to_string(),
            id: ConnectionId::next(),
            outbound,
        })
        .await
        .unwrap();

        let task = tokio::spawn(actor.run());
        // Let the Add land before stopping.
        let (members_tx, members_rx) = tokio::sync::oneshot::channel();
        tx.send(RelayCommand::Members {
            path: "/feed".to_string(),
            respond_to: members_tx,
        })
        .await
        .unwrap();
        assert_eq!(members_rx.await.unwrap().len(), 1);

        shutdown.cancel();
        task.await.unwrap();

        assert!(stopped.is_cancelled());
        assert_eq!(out_rx.recv().await, None);
    }
}
