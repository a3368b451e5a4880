//! One live duplex session and its outbound batching queue.
//!
//! A [`Client`] never writes to the socket from the enqueue path (except
//! for immediate sends): batched frames accumulate in the queue and the
//! first frame after a flush signals the pump pool, which performs the
//! actual write on a worker.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use surge_protocol::{ConnectionId, UserId};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::wire::{TransportError, Wire};

/// Handshake-scoped session state.
///
/// Replaces an untyped per-connection context store with named fields: the
/// id assigned at accept time and the one-shot login signal consumed by the
/// first `login` command.
struct SessionState {
    id: ConnectionId,
    login_tx: Option<oneshot::Sender<UserId>>,
}

/// One live duplex session.
pub struct Client {
    wire: tokio::sync::Mutex<Box<dyn Wire>>,
    writeq: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
    ready: mpsc::Sender<ClientHandle>,
    session: Mutex<SessionState>,
}

impl Client {
    /// The connection id assigned at accept time, or 0 while unassigned.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.session.lock().id
    }

    pub fn set_id(&self, id: ConnectionId) {
        self.session.lock().id = id;
    }

    /// Install the one-shot login signal.
    pub fn arm_login(&self, tx: oneshot::Sender<UserId>) {
        self.session.lock().login_tx = Some(tx);
    }

    /// Consume the login signal. Returns `None` when login has already
    /// happened (a duplicate login attempt).
    #[must_use]
    pub fn take_login(&self) -> Option<oneshot::Sender<UserId>> {
        self.session.lock().login_tx.take()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush the batched queue as one physical frame.
    ///
    /// Invoked by pump workers. The queue swap happens under the wire lock
    /// so successive flushes of the same session keep enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the session is closed
    /// (no-op), or the wire error when the write fails.
    pub async fn flush(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut wire = self.wire.lock().await;
        let frames = std::mem::take(&mut *self.writeq.lock());
        if frames.is_empty() {
            return Ok(());
        }

        let size = 1 + frames.iter().map(|f| f.len() + 1).sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(b'[');
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                buf.put_u8(b',');
            }
            buf.extend_from_slice(frame);
        }
        buf.put_u8(b']');

        wire.send(buf.freeze()).await
    }

    /// Send a transport-level liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is closed or the wire fails.
    pub async fn ping(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.wire.lock().await.ping().await
    }

    /// Close the session. Idempotent: only the first call shuts the wire
    /// down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut wire = self.wire.lock().await;
        if let Err(e) = wire.close().await {
            debug!(error = %e, "wire close failed");
        }
    }

    async fn send_now(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.wire.lock().await.send(frame).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Shared handle to a [`Client`] with pointer identity.
///
/// Identity (not session content) is what the registry indexes key by, so
/// equality and hashing go through the allocation address.
#[derive(Clone, Debug)]
pub struct ClientHandle(Arc<Client>);

impl ClientHandle {
    /// Create a client over the given wire, wired to a pump pool's ready
    /// queue.
    #[must_use]
    pub fn new(wire: Box<dyn Wire>, ready: mpsc::Sender<ClientHandle>) -> Self {
        Self(Arc::new(Client {
            wire: tokio::sync::Mutex::new(wire),
            writeq: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            ready,
            session: Mutex::new(SessionState {
                id: 0,
                login_tx: None,
            }),
        }))
    }

    /// Enqueue one pre-serialized logical frame.
    ///
    /// With `immed` the frame bypasses batching and is written right away
    /// as a single-element array. Otherwise it joins the batch queue; the
    /// first frame after a flush signals the pump pool.
    ///
    /// # Errors
    ///
    /// [`TransportError::Backpressure`] when the pump's ready queue is
    /// full, [`TransportError::Closed`] when the session or pool is gone.
    pub async fn enqueue(&self, frame: Bytes, immed: bool) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        if immed {
            let mut buf = BytesMut::with_capacity(frame.len() + 2);
            buf.put_u8(b'[');
            buf.extend_from_slice(&frame);
            buf.put_u8(b']');
            return self.send_now(buf.freeze()).await;
        }

        let first = {
            let mut q = self.0.writeq.lock();
            q.push(frame);
            q.len() == 1
        };
        if first {
            self.0.ready.try_send(self.clone()).map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Backpressure,
                TrySendError::Closed(_) => TransportError::Closed,
            })?;
        }
        Ok(())
    }
}

impl Deref for ClientHandle {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.0
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ClientHandle {}

impl Hash for ClientHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Deliver a pre-serialized frame to one session or many.
///
/// Fan-out code is agnostic to cardinality: a single [`ClientHandle`] and a
/// [`ClientGroup`] satisfy the same contract. Delivery failures are logged,
/// never propagated; a broken recipient must not fail the send path.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, frame: Bytes, immed: bool);
}

#[async_trait]
impl Deliver for ClientHandle {
    async fn deliver(&self, frame: Bytes, immed: bool) {
        if let Err(e) = self.enqueue(frame, immed).await {
            debug!(id = self.id(), error = %e, "dropping undeliverable frame");
        }
    }
}

/// A resolved set of sessions addressed as one recipient.
#[derive(Clone, Debug, Default)]
pub struct ClientGroup {
    members: Vec<ClientHandle>,
}

impl ClientGroup {
    #[must_use]
    pub fn new(members: Vec<ClientHandle>) -> Self {
        Self { members }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn members(&self) -> &[ClientHandle] {
        &self.members
    }

    /// The same group minus one member (used to exclude a broadcast's
    /// sender).
    #[must_use]
    pub fn without(&self, excluded: &ClientHandle) -> ClientGroup {
        ClientGroup {
            members: self
                .members
                .iter()
                .filter(|m| *m != excluded)
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl Deliver for ClientGroup {
    async fn deliver(&self, frame: Bytes, immed: bool) {
        for member in &self.members {
            if let Err(e) = member.enqueue(frame.clone(), immed).await {
                debug!(id = member.id(), error = %e, "dropping undeliverable frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{pipe, PipeEvent};

    fn new_client(capacity: usize) -> (ClientHandle, mpsc::UnboundedReceiver<PipeEvent>, mpsc::Receiver<ClientHandle>) {
        let (wire, events) = pipe();
        let (ready_tx, ready_rx) = mpsc::channel(capacity);
        (ClientHandle::new(Box::new(wire), ready_tx), events, ready_rx)
    }

    #[tokio::test]
    async fn test_batched_frames_flush_in_order() {
        let (cli, mut events, mut ready) = new_client(8);

        cli.enqueue(Bytes::from_static(b"\"f1\""), false).await.unwrap();
        cli.enqueue(Bytes::from_static(b"\"f2\""), false).await.unwrap();
        cli.enqueue(Bytes::from_static(b"\"f3\""), false).await.unwrap();

        // only the empty->nonempty transition signals the pump
        assert!(ready.try_recv().is_ok());
        assert!(ready.try_recv().is_err());

        cli.flush().await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(PipeEvent::Frame(Bytes::from_static(b"[\"f1\",\"f2\",\"f3\"]")))
        );
    }

    #[tokio::test]
    async fn test_immediate_send_bypasses_batch() {
        let (cli, mut events, _ready) = new_client(8);

        cli.enqueue(Bytes::from_static(b"\"f1\""), false).await.unwrap();
        cli.enqueue(Bytes::from_static(b"\"f2\""), false).await.unwrap();
        cli.enqueue(Bytes::from_static(b"\"now\""), true).await.unwrap();

        // the immediate frame is on the wire before the batch is flushed
        assert_eq!(
            events.recv().await,
            Some(PipeEvent::Frame(Bytes::from_static(b"[\"now\"]")))
        );

        cli.flush().await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(PipeEvent::Frame(Bytes::from_static(b"[\"f1\",\"f2\"]")))
        );
    }

    #[tokio::test]
    async fn test_flush_without_frames_is_noop() {
        let (cli, mut events, _ready) = new_client(8);

        cli.flush().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (cli, mut events, _ready) = new_client(8);

        cli.close().await;
        cli.close().await;

        assert_eq!(events.recv().await, Some(PipeEvent::Closed));
        assert!(events.try_recv().is_err());
        assert!(cli.is_closed());
    }

    #[tokio::test]
    async fn test_flush_after_close_reports_closed() {
        let (cli, _events, _ready) = new_client(8);

        cli.enqueue(Bytes::from_static(b"\"f1\""), false).await.unwrap();
        cli.close().await;

        assert!(matches!(cli.flush().await, Err(TransportError::Closed)));
        assert!(matches!(
            cli.enqueue(Bytes::from_static(b"\"f2\""), false).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_full_ready_queue_surfaces_backpressure() {
        let (wire_a, _events_a) = pipe();
        let (wire_b, _events_b) = pipe();
        let (ready_tx, _ready_rx) = mpsc::channel(1);
        let a = ClientHandle::new(Box::new(wire_a), ready_tx.clone());
        let b = ClientHandle::new(Box::new(wire_b), ready_tx);

        a.enqueue(Bytes::from_static(b"1"), false).await.unwrap();
        assert!(matches!(
            b.enqueue(Bytes::from_static(b"2"), false).await,
            Err(TransportError::Backpressure)
        ));
    }

    #[tokio::test]
    async fn test_group_delivery_and_exclusion() {
        let (a, mut events_a, _ra) = new_client(8);
        let (b, mut events_b, _rb) = new_client(8);

        let group = ClientGroup::new(vec![a.clone(), b.clone()]);
        assert_eq!(group.len(), 2);

        let trimmed = group.without(&a);
        assert_eq!(trimmed.len(), 1);

        trimmed.deliver(Bytes::from_static(b"\"x\""), true).await;
        assert_eq!(
            events_b.recv().await,
            Some(PipeEvent::Frame(Bytes::from_static(b"[\"x\"]")))
        );
        assert!(events_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_login_signal_consumed_once() {
        let (cli, _events, _ready) = new_client(8);
        let (tx, mut rx) = oneshot::channel();

        cli.arm_login(tx);
        let first = cli.take_login();
        assert!(first.is_some());
        assert!(cli.take_login().is_none());

        first.unwrap().send(42).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 42);
    }
}
