//! Lease-backed presence distribution.
//!
//! Each server process publishes directory entries of the form
//! `<key>/<node> = <node>` under a renewable lease in an external
//! consistent key-value store, so other nodes can resolve which node owns a
//! connection, user, or channel membership. The store itself is an external
//! collaborator behind the [`LeaseStore`] capability; a process-local
//! [`MemoryLeaseStore`] backs tests and single-node runs.
//!
//! A single coordinating task owns the key → lease registry exclusively
//! and serializes every store mutation; register/unregister requests reach
//! it through a bounded queue. Store failures are logged and the loop
//! continues: a lease that silently expires just stops being discoverable,
//! which is the intended fail-open behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use surge_protocol::{ConnectionId, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Directory namespace for connection ids.
pub const CONNECTION_NS: &str = "/ids";
/// Directory namespace for user ids.
pub const USER_NS: &str = "/uids";
/// Directory namespace for channel names.
pub const CHANNEL_NS: &str = "/chans";

/// Directory key for a connection id.
#[must_use]
pub fn connection_key(id: ConnectionId) -> String {
    format!("{CONNECTION_NS}/{id}")
}

/// Directory key for a user id.
#[must_use]
pub fn user_key(uid: UserId) -> String {
    format!("{USER_NS}/{uid}")
}

/// Directory key for a channel name.
#[must_use]
pub fn channel_key(name: &str) -> String {
    format!("{CHANNEL_NS}/{name}")
}

/// Handle to a TTL-bound registration in the external store.
pub type LeaseId = i64;

/// External-store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease not found")]
    LeaseNotFound,

    #[error("store operation timed out")]
    Timeout,
}

/// Capability of the external consistent key-value store.
///
/// Exactly the four operations the distributor needs: put-with-lease,
/// keep-alive, revoke, and prefix-scan.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Acquire a fresh lease with the given TTL.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Write `key = value` bound to the lease.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), StoreError>;

    /// Re-assert the lease, pushing its expiry out by its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Drop the lease and every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Every live `(key, value)` pair under the prefix.
    async fn prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

/// Distributor construction errors.
#[derive(Debug, Error)]
pub enum DistributeError {
    /// A TTL at or below the refresh period would let entries expire
    /// between keep-alive ticks under normal operation.
    #[error("lease ttl {ttl:?} must exceed the refresh period {refresh:?}")]
    TtlTooSmall { ttl: Duration, refresh: Duration },
}

/// Distributor configuration.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// This node's identity, written as both key suffix and value.
    pub node: String,
    /// Lease TTL. Must exceed `refresh`.
    pub ttl: Duration,
    /// Keep-alive tick period.
    pub refresh: Duration,
    /// Per-call timeout for every store operation.
    pub op_timeout: Duration,
    /// Capacity of the register/unregister queue.
    pub queue_capacity: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            node: "surge-node".to_string(),
            ttl: Duration::from_secs(30),
            refresh: Duration::from_secs(10),
            op_timeout: Duration::from_millis(200),
            queue_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Register(String),
    Unregister(String),
}

/// Cheap cloneable handle feeding the coordinating loop.
///
/// Both operations are asynchronous and non-blocking: a full queue drops
/// the request with a warning rather than stalling a connection task.
#[derive(Clone)]
pub struct DistributorHandle {
    tx: mpsc::Sender<Op>,
}

impl DistributorHandle {
    pub(crate) fn new(tx: mpsc::Sender<Op>) -> Self {
        Self { tx }
    }

    /// Submit a directory key for lease-backed registration.
    pub fn register(&self, key: String) {
        if self.tx.try_send(Op::Register(key)).is_err() {
            warn!("presence queue full, dropping registration");
        }
    }

    /// Submit a directory key for revocation.
    pub fn unregister(&self, key: String) {
        if self.tx.try_send(Op::Unregister(key)).is_err() {
            warn!("presence queue full, dropping revocation");
        }
    }
}

/// The running presence-distribution task.
pub struct Distributor {
    handle: DistributorHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Distributor {
    /// Spawn the coordinating loop over the given store.
    ///
    /// # Errors
    ///
    /// Rejects a TTL that does not exceed the refresh period.
    pub fn spawn(
        store: Arc<dyn LeaseStore>,
        config: DistributorConfig,
    ) -> Result<Self, DistributeError> {
        if config.ttl <= config.refresh {
            return Err(DistributeError::TtlTooSmall {
                ttl: config.ttl,
                refresh: config.refresh,
            });
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(store, config, rx, stop_rx));

        Ok(Self {
            handle: DistributorHandle::new(tx),
            stop,
            task,
        })
    }

    /// A handle for submitting register/unregister requests.
    #[must_use]
    pub fn handle(&self) -> DistributorHandle {
        self.handle.clone()
    }

    /// Stop the coordinating loop. Held leases are left to expire by TTL.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

async fn run(
    store: Arc<dyn LeaseStore>,
    config: DistributorConfig,
    mut ops: mpsc::Receiver<Op>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut registry: HashMap<String, LeaseId> = HashMap::new();
    let mut tick = tokio::time::interval(config.refresh);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("presence distributor stopping");
                return;
            }
            op = ops.recv() => match op {
                Some(Op::Register(key)) => {
                    register_key(store.as_ref(), &config, &mut registry, key).await;
                }
                Some(Op::Unregister(key)) => {
                    unregister_key(store.as_ref(), &config, &mut registry, &key).await;
                }
                None => {
                    debug!("presence distributor queue closed, stopping");
                    return;
                }
            },
            _ = tick.tick() => {
                refresh_leases(store.as_ref(), &config, &registry).await;
            }
        }
    }
}

async fn register_key(
    store: &dyn LeaseStore,
    config: &DistributorConfig,
    registry: &mut HashMap<String, LeaseId>,
    key: String,
) {
    let lease = match with_timeout(config.op_timeout, store.grant(config.ttl)).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(key = %key, error = %e, "lease grant failed");
            return;
        }
    };

    let entry = format!("{}/{}", key, config.node);
    registry.insert(key.clone(), lease);

    match with_timeout(config.op_timeout, store.put(&entry, &config.node, lease)).await {
        Ok(()) => trace!(key = %key, lease, "presence registered"),
        Err(e) => warn!(key = %key, error = %e, "presence publish failed"),
    }
}

async fn unregister_key(
    store: &dyn LeaseStore,
    config: &DistributorConfig,
    registry: &mut HashMap<String, LeaseId>,
    key: &str,
) {
    let Some(lease) = registry.remove(key) else {
        return;
    };

    match with_timeout(config.op_timeout, store.revoke(lease)).await {
        Ok(()) => trace!(key = %key, lease, "presence revoked"),
        Err(e) => warn!(key = %key, error = %e, "presence revoke failed"),
    }
}

async fn refresh_leases(
    store: &dyn LeaseStore,
    config: &DistributorConfig,
    registry: &HashMap<String, LeaseId>,
) {
    for (key, lease) in registry {
        if let Err(e) = with_timeout(config.op_timeout, store.keep_alive(*lease)).await {
            warn!(key = %key, error = %e, "lease keep-alive failed");
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

/// Resolve which nodes hold the given directory keys.
///
/// Fans one prefix query per key out concurrently, each under its own
/// timeout so one slow call cannot stall the batch. Failed lookups are
/// logged and skipped. Returns node identity → full directory key.
pub async fn resolve_nodes(
    store: &dyn LeaseStore,
    keys: &[String],
    per_key_timeout: Duration,
) -> HashMap<String, String> {
    let lookups = keys.iter().map(|key| async move {
        match with_timeout(per_key_timeout, store.prefix(key)).await {
            Ok(kvs) => kvs,
            Err(e) => {
                warn!(key = %key, error = %e, "presence lookup failed");
                Vec::new()
            }
        }
    });

    let mut nodes = HashMap::new();
    for (key, value) in join_all(lookups).await.into_iter().flatten() {
        nodes.insert(value, key);
    }
    nodes
}

struct LeaseEntry {
    ttl: Duration,
    expires_at: Instant,
    keys: HashMap<String, String>,
}

struct MemoryInner {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseEntry>,
}

/// In-process [`LeaseStore`] with real TTL expiry.
///
/// Backs tests and single-node runs; a deployment pointing several nodes at
/// a shared directory substitutes a client for its consistent store here.
pub struct MemoryLeaseStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                next_lease: 0,
                leases: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.leases.insert(
            lease,
            LeaseEntry {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashMap::new(),
            },
        );
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.leases.get_mut(&lease).ok_or(StoreError::LeaseNotFound)?;
        entry.keys.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.leases.get_mut(&lease).ok_or(StoreError::LeaseNotFound)?;
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.inner
            .lock()
            .leases
            .remove(&lease)
            .map(|_| ())
            .ok_or(StoreError::LeaseNotFound)
    }

    async fn prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for entry in inner.leases.values() {
            if entry.expires_at <= now {
                continue;
            }
            for (key, value) in &entry.keys {
                if key.starts_with(prefix) {
                    out.push((key.clone(), value.clone()));
                }
            }
        }
        Ok(out)
    }
}
