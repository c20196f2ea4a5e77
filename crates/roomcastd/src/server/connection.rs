//! Room member connections.
//!
//! A `MemberConnection` is created only after its room has admitted it, so
//! by the time the websocket is live it already holds the room's inbound
//! sink and the receiving end of its own outbound queue.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - I/O failures end the connection; they are logged, never propagated

use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use roomcast_core::{ConnectionId, Message, Payload, RoomName};

use super::pump::{read_frames, write_frames, Farewell, FrameKind, WRITE_TIMEOUT};
use crate::broker::{BrokerHandle, InboundSink};

/// One websocket attached to a room.
pub struct MemberConnection {
    id: ConnectionId,
    room: RoomName,
    inbound: InboundSink,
    outbound: mpsc::Receiver<Payload>,
    broker: BrokerHandle,
}

impl MemberConnection {
    pub fn new(
        id: ConnectionId,
        room: RoomName,
        inbound: InboundSink,
        outbound: mpsc::Receiver<Payload>,
        broker: BrokerHandle,
    ) -> Self {
        Self {
            id,
            room,
            inbound,
            outbound,
            broker,
        }
    }

    /// Pumps frames between the socket and the room until either side ends.
    pub async fn run(self, socket: WebSocket) {
        let Self {
            id,
            room,
            inbound,
            outbound,
            broker,
        } = self;

        info!(connection_id = %id, room = %room, "Member connected");

        let (sink, mut stream) = socket.split();
        let closing = CancellationToken::new();

        let mut writer = tokio::spawn(write_frames(
            sink,
            Some(outbound),
            closing.clone(),
            FrameKind::Text,
            Farewell::TextAndClose,
        ));

        let read_end = read_frames(&mut stream, &closing, |payload| {
            let inbound = inbound.clone();
            async move {
                debug!(connection_id = %id, bytes = payload.len(), "Frame received");
                inbound
                    .send(Message::from_member(id, payload))
                    .await
                    .is_ok()
            }
        })
        .await;

        broker.leave(room.clone(), id);
        closing.cancel();

        match timeout(WRITE_TIMEOUT, &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                debug!(connection_id = %id, error = %e, "Writer ended with error");
            }
            Ok(Err(e)) if e.is_panic() => {
                error!(connection_id = %id, "Writer task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                writer.abort();
                warn!(connection_id = %id, "Writer did not finish in time, aborted");
            }
        }

        match read_end {
            Ok(end) => {
                info!(connection_id = %id, room = %room, reason = ?end, "Member disconnected")
            }
            Err(e) => info!(connection_id = %id, room = %room, error = %e, "Member disconnected"),
        }
    }
}
