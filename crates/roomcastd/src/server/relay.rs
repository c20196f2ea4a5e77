//! Relay endpoint connections and inbound stream consumers.

use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use roomcast_core::{ConnectionId, ConnectionRole, Payload};

use super::pump::{read_frames, write_frames, Farewell, FrameKind, WRITE_TIMEOUT};
use crate::relay::{InboundStream, RelayHandle};
use crate::sink::outbound_channel;

/// How long a new inbound connection waits for the application to accept
/// its stream before giving up.
pub const STREAM_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Static description of one relay endpoint, shared by its connections.
#[derive(Clone)]
pub struct RelayEndpoint {
    pub path: String,
    pub role: ConnectionRole,
    pub relay: RelayHandle,
    /// Where inbound streams are handed over; `None` for outbound endpoints.
    pub streams: Option<mpsc::Sender<InboundStream>>,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
}

/// One websocket attached to a relay endpoint.
pub struct RelayConnection {
    id: ConnectionId,
    endpoint: RelayEndpoint,
}

impl RelayConnection {
    pub fn new(id: ConnectionId, endpoint: RelayEndpoint) -> Self {
        Self { id, endpoint }
    }

    /// Pumps frames according to the endpoint's role until either side ends.
    pub async fn run(self, socket: WebSocket) {
        let Self { id, endpoint } = self;
        let path = endpoint.path.as_str();

        info!(connection_id = %id, path = %path, role = %endpoint.role, "Relay client connected");

        let (sink, mut stream) = socket.split();
        let closing = CancellationToken::new();

        let outbound = if endpoint.role.sends() {
            let (outbound, rx) = outbound_channel(endpoint.outbound_capacity);
            match endpoint.relay.add(path, id, outbound) {
                Ok(()) => Some(rx),
                Err(e) => {
                    warn!(connection_id = %id, path = %path, error = %e, "Relay subscription refused");
                    closing.cancel();
                    None
                }
            }
        } else {
            None
        };
        let subscribed = outbound.is_some();

        let frames = if endpoint.role.receives() && !closing.is_cancelled() {
            let frames = hand_off_stream(id, &endpoint).await;
            if frames.is_none() {
                closing.cancel();
            }
            frames
        } else {
            None
        };

        let mut writer = tokio::spawn(write_frames(
            sink,
            outbound,
            closing.clone(),
            FrameKind::Binary,
            Farewell::CloseOnly,
        ));

        let read_end = read_frames(&mut stream, &closing, |payload| {
            let frames = frames.clone();
            async move {
                match frames {
                    Some(frames) => frames.send(payload).await.is_ok(),
                    // Outbound-only: reads exist just to notice the disconnect.
                    None => true,
                }
            }
        })
        .await;

        closing.cancel();
        drop(frames);
        if subscribed {
            endpoint.relay.remove(path, id).await;
        }

        match timeout(WRITE_TIMEOUT, &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                debug!(connection_id = %id, error = %e, "Relay writer ended with error");
            }
            Ok(Err(e)) if e.is_panic() => {
                error!(connection_id = %id, "Relay writer task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                writer.abort();
                warn!(connection_id = %id, "Relay writer did not finish in time, aborted");
            }
        }

        match read_end {
            Ok(end) => {
                info!(connection_id = %id, path = %path, reason = ?end, "Relay client disconnected")
            }
            Err(e) => {
                info!(connection_id = %id, path = %path, error = %e, "Relay client disconnected")
            }
        }
    }
}

/// Offers a new inbound stream to the application.
async fn hand_off_stream(
    id: ConnectionId,
    endpoint: &RelayEndpoint,
) -> Option<mpsc::Sender<Payload>> {
    let Some(streams) = &endpoint.streams else {
        warn!(connection_id = %id, path = %endpoint.path, "No consumer for inbound relay frames");
        return None;
    };

    let (tx, rx) = mpsc::channel(endpoint.inbound_capacity);
    let stream = InboundStream {
        connection_id: id,
        path: endpoint.path.clone(),
        frames: rx,
    };

    match timeout(STREAM_HANDOFF_TIMEOUT, streams.send(stream)).await {
        Ok(Ok(())) => Some(tx),
        Ok(Err(_)) => {
            warn!(connection_id = %id, path = %endpoint.path, "Inbound stream consumer is gone");
            None
        }
        Err(_) => {
            warn!(connection_id = %id, path = %endpoint.path, "Timed out handing off inbound stream");
            None
        }
    }
}

/// Consumes inbound streams for an endpoint the application did not claim.
///
/// Frames are pushed to `forward_to` on the relay when set, otherwise
/// logged and discarded. Ends when the stream sender is dropped.
pub fn spawn_stream_consumer(
    mut streams: mpsc::Receiver<InboundStream>,
    forward_to: Option<String>,
    relay: RelayHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(stream) = streams.recv().await {
            tokio::spawn(drain_stream(stream, forward_to.clone(), relay.clone()));
        }
    })
}

async fn drain_stream(mut stream: InboundStream, forward_to: Option<String>, relay: RelayHandle) {
    let mut count = 0u64;
    while let Some(payload) = stream.frames.recv().await {
        count += 1;
        match &forward_to {
            Some(target) => relay.push(payload, target),
            None => debug!(
                connection_id = %stream.connection_id,
                path = %stream.path,
                bytes = payload.len(),
                "Inbound frame discarded"
            ),
        }
    }
    debug!(
        connection_id = %stream.connection_id,
        path = %stream.path,
        frames = count,
        "Inbound stream ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::spawn_relay;
    use roomcast_core::RelayConfig;

    #[tokio::test]
    async fn test_stream_consumer_forwards_to_relay() {
        let shutdown = CancellationToken::new();
        let relay = spawn_relay(&RelayConfig::default(), shutdown.clone());

        let (sub, mut sub_rx) = outbound_channel(8);
        let sub_id = ConnectionId::next();
        relay.add("/out", sub_id, sub).unwrap();
        assert_eq!(relay.members("/out").await.unwrap(), vec![sub_id]);

        let (streams_tx, streams_rx) = mpsc::channel(1);
        let consumer = spawn_stream_consumer(streams_rx, Some("/out".to_string()), relay.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        streams_tx
            .send(InboundStream {
                connection_id: ConnectionId::next(),
                path: "/in".to_string(),
                frames: frames_rx,
            })
            .await
            .unwrap();
        frames_tx
            .send(Payload::from(b"fwd".to_vec()))
            .await
            .unwrap();

        assert_eq!(sub_rx.recv().await, Some(Payload::from(b"fwd".to_vec())));

        drop(streams_tx);
        consumer.await.unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_hand_off_without_consumer() {
        let shutdown = CancellationToken::new();
        let endpoint = RelayEndpoint {
            path: "/in".to_string(),
            role: ConnectionRole::Inbound,
            relay: spawn_relay(&RelayConfig::default(), shutdown.clone()),
            streams: None,
            outbound_capacity: 4,
            inbound_capacity: 4,
        };
        assert!(hand_off_stream(ConnectionId::next(), &endpoint)
            .await
            .is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_hand_off_delivers_stream() {
        let shutdown = CancellationToken::new();
        let (streams_tx, mut streams_rx) = mpsc::channel(1);
        let endpoint = RelayEndpoint {
            path: "/in".to_string(),
            role: ConnectionRole::Duplex,
            relay: spawn_relay(&RelayConfig::default(), shutdown.clone()),
            streams: Some(streams_tx),
            outbound_capacity: 4,
            inbound_capacity: 4,
        };

        let id = ConnectionId::next();
        let frames = hand_off_stream(id, &endpoint).await.unwrap();
        let mut stream = streams_rx.recv().await.unwrap();
        assert_eq!(stream.connection_id, id);
        assert_eq!(stream.path, "/in");

        frames.send(Payload::from("x")).await.unwrap();
        drop(frames);
        assert_eq!(stream.frames.recv().await, Some(Payload::from("x")));
        assert_eq!(stream.frames.recv().await, None);
        shutdown.cancel();
    }
}
