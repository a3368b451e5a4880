//! Wire capability over a raw duplex stream.
//!
//! A [`Wire`] is the write half of a session: one call, one physical frame.
//! The production implementation wraps an axum WebSocket sink; tests use an
//! in-process [`PipeWire`].

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session is closed.
    #[error("connection closed")]
    Closed,

    /// The pump pool's ready queue is full; the enqueue was not accepted.
    #[error("write pump back-pressure")]
    Backpressure,

    /// The underlying socket failed.
    #[error("websocket error: {0}")]
    Ws(String),
}

/// Write-side capability of a duplex session.
///
/// Frames handed to [`Wire::send`] are complete physical frames; batching
/// happens above this trait.
#[async_trait]
pub trait Wire: Send {
    /// Write one physical frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Send a transport-level liveness probe.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Shut the write half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// [`Wire`] over the sink half of an axum WebSocket.
pub struct WsWire {
    sink: SplitSink<WebSocket, Message>,
}

impl WsWire {
    #[must_use]
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Wire for WsWire {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        // Frames are serialized JSON, so they are valid UTF-8 by
        // construction.
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::Ws(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }
}

/// Events observed on the receiving end of a [`PipeWire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    /// A physical frame.
    Frame(Bytes),
    /// A liveness probe.
    Ping,
    /// The wire was closed.
    Closed,
}

/// In-process [`Wire`] over a tokio channel.
///
/// Used by tests and in-process delivery benchmarks: whatever the client
/// would have written to the socket shows up as [`PipeEvent`]s on the
/// paired receiver.
pub struct PipeWire {
    tx: mpsc::UnboundedSender<PipeEvent>,
}

/// Create a connected [`PipeWire`] and its observation channel.
#[must_use]
pub fn pipe() -> (PipeWire, mpsc::UnboundedReceiver<PipeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeWire { tx }, rx)
}

#[async_trait]
impl Wire for PipeWire {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(PipeEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.tx
            .send(PipeEvent::Ping)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The receiver may already be gone; closing is best-effort.
        let _ = self.tx.send(PipeEvent::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_wire_events() {
        let (mut wire, mut rx) = pipe();

        wire.send(Bytes::from_static(b"[1]")).await.unwrap();
        wire.ping().await.unwrap();
        wire.close().await.unwrap();

        assert_eq!(rx.recv().await, Some(PipeEvent::Frame(Bytes::from_static(b"[1]"))));
        assert_eq!(rx.recv().await, Some(PipeEvent::Ping));
        assert_eq!(rx.recv().await, Some(PipeEvent::Closed));
    }

    #[tokio::test]
    async fn test_pipe_wire_send_after_receiver_dropped() {
        let (mut wire, rx) = pipe();
        drop(rx);

        assert!(matches!(
            wire.send(Bytes::from_static(b"[]")).await,
            Err(TransportError::Closed)
        ));
        // close stays infallible
        wire.close().await.unwrap();
    }
}
