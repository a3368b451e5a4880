//! Fixed-size write pump pool.
//!
//! Workers share one bounded ready queue. A client appears on the queue at
//! most once per batch cycle (the empty->nonempty enqueue transition), so a
//! deep queue bounds memory, not fairness.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::ClientHandle;
use crate::wire::TransportError;

/// The shared write-side worker pool.
pub struct PumpPool {
    ready_tx: mpsc::Sender<ClientHandle>,
    workers: Vec<JoinHandle<()>>,
}

impl PumpPool {
    /// Start `workers` pump loops over a ready queue of the given capacity.
    #[must_use]
    pub fn start(workers: usize, capacity: usize) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(capacity.max(1));
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));

        let workers = (0..workers.max(1))
            .map(|n| tokio::spawn(write_pump(n, Arc::clone(&ready_rx))))
            .collect();

        Self { ready_tx, workers }
    }

    /// A sender for the ready queue, handed to every new client.
    #[must_use]
    pub fn ready_sender(&self) -> mpsc::Sender<ClientHandle> {
        self.ready_tx.clone()
    }

    /// Stop the workers.
    ///
    /// Completes once every outstanding ready sender (one per live client)
    /// has been dropped and the queue drained.
    pub async fn shutdown(self) {
        drop(self.ready_tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn write_pump(worker: usize, ready: Arc<tokio::sync::Mutex<mpsc::Receiver<ClientHandle>>>) {
    loop {
        let next = { ready.lock().await.recv().await };
        let Some(cli) = next else { break };

        match cli.flush().await {
            Ok(()) => trace!(worker, id = cli.id(), "flushed"),
            Err(TransportError::Closed) => {
                trace!(worker, id = cli.id(), "skipping closed connection");
            }
            Err(e) => {
                warn!(worker, id = cli.id(), error = %e, "flush failed, closing connection");
                cli.close().await;
            }
        }
    }
    debug!(worker, "write pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{pipe, PipeEvent};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pump_flushes_ready_clients() {
        let pool = PumpPool::start(2, 64);

        let (wire, mut events) = pipe();
        let cli = ClientHandle::new(Box::new(wire), pool.ready_sender());

        cli.enqueue(Bytes::from_static(b"\"a\""), false).await.unwrap();
        cli.enqueue(Bytes::from_static(b"\"b\""), false).await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(PipeEvent::Frame(Bytes::from_static(b"[\"a\",\"b\"]")))
        );
    }

    #[tokio::test]
    async fn test_pump_survives_closed_client() {
        let pool = PumpPool::start(1, 64);

        let (wire_a, _events_a) = pipe();
        let a = ClientHandle::new(Box::new(wire_a), pool.ready_sender());
        a.enqueue(Bytes::from_static(b"\"x\""), false).await.unwrap();
        a.close().await;

        // the worker must skip the closed client and keep serving others
        let (wire_b, mut events_b) = pipe();
        let b = ClientHandle::new(Box::new(wire_b), pool.ready_sender());
        b.enqueue(Bytes::from_static(b"\"y\""), false).await.unwrap();

        assert_eq!(
            events_b.recv().await,
            Some(PipeEvent::Frame(Bytes::from_static(b"[\"y\"]")))
        );
    }
}
