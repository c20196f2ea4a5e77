//! WebSocket client dialer.
//!
//! Connects to a roomcast endpoint and exposes the connection as plain
//! channels. The mode is seen from the client: `Receive` only reads,
//! `Send` only writes, `Duplex` does both. A `Receive` client pairs with an
//! outbound relay endpoint, a `Send` client with an inbound one, and rooms
//! take `Duplex`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - Connection failures are returned from `dial`; later I/O errors end
//!   the connection and are logged

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roomcast_core::{Payload, GOODBYE};

/// Buffer of frames received but not yet consumed.
pub const CLIENT_INBOUND_BUFFER: usize = 100;

/// Direction of traffic, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Receive,
    Send,
    Duplex,
}

impl ClientMode {
    fn receives(&self) -> bool {
        matches!(self, Self::Receive | Self::Duplex)
    }
}

/// How outgoing payloads are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFraming {
    /// Payloads keep their own kind.
    AsIs,
    /// Everything is sent as binary.
    Binary,
}

/// Errors that can occur while dialing.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {url}: {error}")]
    Connect { url: String, error: String },
}

/// A live client connection.
pub struct ClientConnection {
    /// Frames received from the server. Ends when the connection closes.
    /// Always empty for `ClientMode::Send`.
    pub inbound: mpsc::Receiver<Payload>,
    /// Cancels the connection; a close frame is sent on the way out.
    pub cancel: CancellationToken,
    /// Completes once the connection has fully ended.
    pub task: JoinHandle<()>,
}

/// Dials `url` in the given mode.
///
/// `outbound` is required for `Send` and `Duplex` and ignored for
/// `Receive`. When it closes, the client says goodbye and disconnects.
///
/// # Errors
///
/// Returns `ClientError::Connect` if the websocket handshake fails.
pub async fn dial(
    url: &str,
    mode: ClientMode,
    framing: ClientFraming,
    outbound: Option<mpsc::Receiver<Payload>>,
) -> Result<ClientConnection, ClientError> {
    let (socket, _response) =
        tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connect {
                url: url.to_string(),
                error: e.to_string(),
            })?;

    info!(url = %url, mode = ?mode, "Connected");

    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(CLIENT_INBOUND_BUFFER);
    let cancel = CancellationToken::new();
    let outbound = if mode == ClientMode::Receive {
        None
    } else {
        outbound
    };

    let closing = cancel.clone();
    let writer_closing = cancel.clone();
    let writer = async move {
        let mut outbound = outbound;
        loop {
            let next = tokio::select! {
                _ = writer_closing.cancelled() => None,
                payload = recv_or_pending(&mut outbound) => payload,
            };
            let Some(payload) = next else { break };
            let frame = match (framing, payload) {
                (ClientFraming::AsIs, Payload::Text(text)) => WsMessage::Text(text.into()),
                (_, payload) => WsMessage::Binary(payload.into_bytes().into()),
            };
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "Client write failed");
                writer_closing.cancel();
                return;
            }
        }
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: GOODBYE.into(),
            })))
            .await;
        let _ = sink.close().await;
    };

    let receives = mode.receives();
    let reader = async move {
        loop {
            let next = tokio::select! {
                _ = closing.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(WsMessage::Text(text))) if receives => {
                    if inbound_tx
                        .send(Payload::Text(text.as_str().to_owned()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) if receives => {
                    if inbound_tx
                        .send(Payload::Binary(bytes.to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(frame = ?frame, "Server closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Client read failed");
                    break;
                }
                None => break,
            }
        }
        closing.cancel();
    };

    let task = tokio::spawn(async move {
        tokio::join!(writer, reader);
        debug!("Client connection ended");
    });

    Ok(ClientConnection {
        inbound: inbound_rx,
        cancel,
        task,
    })
}

async fn recv_or_pending(outbound: &mut Option<mpsc::Receiver<Payload>>) -> Option<Payload> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_receives() {
        assert!(ClientMode::Receive.receives());
        assert!(ClientMode::Duplex.receives());
        assert!(!ClientMode::Send.receives());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Port 1 on localhost is essentially never listening.
        let result = dial(
            "ws://127.0.0.1:1/lobby",
            ClientMode::Duplex,
            ClientFraming::AsIs,
            None,
        )
        .await;
        match result {
            Err(ClientError::Connect { url, .. }) => assert_eq!(url, "ws://127.0.0.1:1/lobby"),
            Ok(_) => panic!("expected connection failure"),
        }
    }
}
