//! Read and write loops shared by room and relay connections.
//!
//! Each websocket is split in two. The write half is owned by exactly one
//! write loop, which is therefore the only place a close frame is sent.
//! Both loops watch a per-connection `closing` token; either side ending
//! cancels it so the other side follows.

use std::fmt;
use std::future::Future;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use roomcast_core::{Payload, GOODBYE};

/// Maximum time for a single frame write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How payloads are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// What the write loop sends before closing the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Farewell {
    /// A `goodbye` text frame, then a normal-closure close frame.
    TextAndClose,
    /// Only the close frame.
    CloseOnly,
}

/// Why a read loop ended without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The peer sent a close frame.
    PeerClosed,
    /// The underlying stream ended.
    StreamEnded,
    /// The connection's `closing` token fired.
    Cancelled,
    /// Whoever consumes this connection's frames went away.
    SinkClosed,
}

/// Errors that end a connection's loops.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Write timeout")]
    WriteTimeout,
}

/// Encodes a payload as a websocket frame.
pub fn to_frame(payload: Payload, kind: FrameKind) -> WsMessage {
    match (kind, payload) {
        (FrameKind::Text, Payload::Text(text)) => WsMessage::Text(text.into()),
        (FrameKind::Text, Payload::Binary(bytes)) => {
            WsMessage::Text(String::from_utf8_lossy(&bytes).into_owned().into())
        }
        (FrameKind::Binary, payload) => WsMessage::Binary(payload.into_bytes().into()),
    }
}

/// Decodes a data frame. Control frames yield `None`.
pub fn from_frame(frame: &WsMessage) -> Option<Payload> {
    match frame {
        WsMessage::Text(text) => Some(Payload::Text(text.as_str().to_owned())),
        WsMessage::Binary(bytes) => Some(Payload::Binary(bytes.to_vec())),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) => None,
    }
}

/// Reads frames until the peer leaves, `closing` fires, or `forward`
/// reports its consumer is gone.
///
/// Empty frames are skipped. `forward` returns `false` when the frame
/// could not be handed on.
pub async fn read_frames<R, E, F, Fut>(
    stream: &mut R,
    closing: &CancellationToken,
    mut forward: F,
) -> Result<ReadEnd, ConnectionError>
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
    F: FnMut(Payload) -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        let next = tokio::select! {
            _ = closing.cancelled() => return Ok(ReadEnd::Cancelled),
            next = stream.next() => next,
        };

        let frame = match next {
            None => return Ok(ReadEnd::StreamEnded),
            Some(Err(e)) => return Err(ConnectionError::Read(e.to_string())),
            Some(Ok(frame)) => frame,
        };

        if matches!(frame, WsMessage::Close(_)) {
            return Ok(ReadEnd::PeerClosed);
        }

        let Some(payload) = from_frame(&frame) else {
            continue;
        };
        if payload.is_empty() {
            continue;
        }

        let delivered = tokio::select! {
            _ = closing.cancelled() => return Ok(ReadEnd::Cancelled),
            delivered = forward(payload) => delivered,
        };
        if !delivered {
            return Ok(ReadEnd::SinkClosed);
        }
    }
}

/// Writes queued payloads until the queue closes or `closing` fires, then
/// says goodbye and closes the socket.
///
/// With no queue the loop only waits for `closing`. A failed or timed-out
/// write cancels `closing` and skips the farewell.
pub async fn write_frames<W>(
    mut sink: W,
    mut outbound: Option<mpsc::Receiver<Payload>>,
    closing: CancellationToken,
    kind: FrameKind,
    farewell: Farewell,
) -> Result<(), ConnectionError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    loop {
        let next = tokio::select! {
            _ = closing.cancelled() => None,
            payload = recv_or_pending(&mut outbound) => payload,
        };
        let Some(payload) = next else {
            break;
        };

        if let Err(e) = send_frame(&mut sink, to_frame(payload, kind)).await {
            closing.cancel();
            return Err(e);
        }
    }

    let result = say_goodbye(&mut sink, farewell).await;
    closing.cancel();
    result
}

async fn say_goodbye<W>(sink: &mut W, farewell: Farewell) -> Result<(), ConnectionError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    if farewell == Farewell::TextAndClose {
        send_frame(sink, WsMessage::Text(Utf8Bytes::from_static(GOODBYE))).await?;
    }
    send_frame(
        sink,
        WsMessage::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(GOODBYE),
        })),
    )
    .await?;

    match timeout(WRITE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Write(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

async fn send_frame<W>(sink: &mut W, frame: WsMessage) -> Result<(), ConnectionError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    match timeout(WRITE_TIMEOUT, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Write(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
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
    use futures::channel::mpsc as fmpsc;
    use futures::stream;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    fn text(s: &str) -> WsMessage {
        WsMessage::Text(s.to_string().into())
    }

    fn frames(items: Vec<WsMessage>) -> impl Stream<Item = Result<WsMessage, String>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    fn is_goodbye_close(frame: &WsMessage) -> bool {
        match frame {
            WsMessage::Close(Some(close)) => {
                close.code == close_code::NORMAL && close.reason.as_str() == GOODBYE
            }
            _ => false,
        }
    }

    // ========================================================================
    // Framing
    // ========================================================================

    #[test]
    fn test_to_frame_text() {
        match to_frame(Payload::from("hi"), FrameKind::Text) {
            WsMessage::Text(t) => assert_eq!(t.as_str(), "hi"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_to_frame_binary() {
        match to_frame(Payload::from("hi"), FrameKind::Binary) {
            WsMessage::Binary(b) => assert_eq!(b.as_ref(), b"hi"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_from_frame_skips_control() {
        assert_eq!(from_frame(&text("x")), Some(Payload::from("x")));
        assert_eq!(from_frame(&WsMessage::Ping(Vec::new().into())), None);
        assert_eq!(from_frame(&WsMessage::Close(None)), None);
    }

    // ========================================================================
    // Read loop
    // ========================================================================

    #[tokio::test]
    async fn test_read_forwards_until_close() {
        let closing = CancellationToken::new();
        let mut input = frames(vec![
            text("a"),
            text(""),
            text("b"),
            WsMessage::Close(None),
            text("c"),
        ]);

        let mut seen = Vec::new();
        let end = read_frames(&mut input, &closing, |payload| {
            seen.push(payload);
            async { true }
        })
        .await;

        assert_eq!(end, Ok(ReadEnd::PeerClosed));
        assert_eq!(seen, vec![Payload::from("a"), Payload::from("b")]);
    }

    #[tokio::test]
    async fn test_read_stream_end() {
        let closing = CancellationToken::new();
        let mut input = frames(vec![text("a")]);
        let end = read_frames(&mut input, &closing, |_| async { true }).await;
        assert_eq!(end, Ok(ReadEnd::StreamEnded));
    }

    #[tokio::test]
    async fn test_read_error() {
        let closing = CancellationToken::new();
        let mut input = stream::iter(vec![Err::<WsMessage, _>("reset".to_string())]);
        let end = read_frames(&mut input, &closing, |_| async { true }).await;
        assert_eq!(end, Err(ConnectionError::Read("reset".to_string())));
    }

    #[tokio::test]
    async fn test_read_sink_closed() {
        let closing = CancellationToken::new();
        let mut input = frames(vec![text("a"), text("b")]);
        let end = read_frames(&mut input, &closing, |_| async { false }).await;
        assert_eq!(end, Ok(ReadEnd::SinkClosed));
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let closing = CancellationToken::new();
        closing.cancel();
        let mut input = stream::pending::<Result<WsMessage, String>>();
        let end = read_frames(&mut input, &closing, |_| async { true }).await;
        assert_eq!(end, Ok(ReadEnd::Cancelled));
    }

    // ========================================================================
    // Write loop
    // ========================================================================

    #[tokio::test]
    async fn test_write_drains_then_says_goodbye() {
        let (sink, mut written) = fmpsc::unbounded::<WsMessage>();
        let (tx, rx) = mpsc::channel(4);
        let closing = CancellationToken::new();

        tx.send(Payload::from("one")).await.unwrap();
        tx.send(Payload::from("two")).await.unwrap();
        drop(tx);

        let result = write_frames(
            sink,
            Some(rx),
            closing.clone(),
            FrameKind::Text,
            Farewell::TextAndClose,
        )
        .await;
        assert!(result.is_ok());
        assert!(closing.is_cancelled());

        let frames: Vec<WsMessage> = written.by_ref().collect().await;
        assert_eq!(frames.len(), 4);
        assert_eq!(from_frame(&frames[0]), Some(Payload::from("one")));
        assert_eq!(from_frame(&frames[1]), Some(Payload::from("two")));
        assert_eq!(from_frame(&frames[2]), Some(Payload::from(GOODBYE)));
        assert!(is_goodbye_close(&frames[3]));
    }

    #[tokio::test]
    async fn test_write_close_only_on_cancel() {
        let (sink, written) = fmpsc::unbounded::<WsMessage>();
        let closing = CancellationToken::new();
        closing.cancel();

        let result =
            write_frames(sink, None, closing, FrameKind::Binary, Farewell::CloseOnly).await;
        assert!(result.is_ok());

        let frames: Vec<WsMessage> = written.collect().await;
        assert_eq!(frames.len(), 1);
        assert!(is_goodbye_close(&frames[0]));
    }

    #[tokio::test]
    async fn test_write_error_cancels_closing() {
        let (sink, written) = fmpsc::unbounded::<WsMessage>();
        drop(written);
        let (tx, rx) = mpsc::channel(1);
        tx.send(Payload::from("lost")).await.unwrap();
        let closing = CancellationToken::new();

        let result = write_frames(
            sink,
            Some(rx),
            closing.clone(),
            FrameKind::Text,
            Farewell::TextAndClose,
        )
        .await;
        assert!(matches!(result, Err(ConnectionError::Write(_))));
        assert!(closing.is_cancelled());
    }
}
