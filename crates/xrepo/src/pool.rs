//! Shared backend connections keyed by workspace.
//!
//! Each [`WorkspaceKey`] has at most one connection. The first acquirer of a
//! key spawns its creation as a separate task; every concurrent acquirer
//! awaits the same shared result, so the handshake runs once no matter how
//! many sessions ask. An acquirer that gives up (its future is dropped) does
//! not abort the creation.
//!
//! A [`Lease`] keeps the connection counted as in use until it is dropped.
//! Connections with no leases that stay idle past the configured timeout are
//! retired by [`ConnectionPool::reap_idle`]. A connection that has died is
//! retired as soon as an acquire notices it or a call through a lease fails
//! fatally. An acquire for a key being retired waits for the old connection
//! to shut down before starting a new one.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendRegistry};
use crate::uri::WorkspaceKey;

/// Default time an unleased connection is kept before it is retired.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Failures to obtain a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No backend could be started for the workspace.
    #[error("no backend available for {key}: {reason}")]
    BackendUnavailable {
        /// The workspace that was requested.
        key: String,
        /// Why it could not be served.
        reason: String,
    },

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    Closed,
}

impl PoolError {
    fn unavailable(key: &WorkspaceKey, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

type Connection = Arc<dyn BackendConnection>;
type Creation = Shared<BoxFuture<'static, Result<Connection, PoolError>>>;
type Retirement = Shared<BoxFuture<'static, ()>>;

struct Slot {
    id: u64,
    creation: Creation,
    leases: usize,
    last_used: Instant,
}

struct Inner {
    registry: BackendRegistry,
    idle_timeout: Duration,
    slots: Mutex<HashMap<WorkspaceKey, Slot>>,
    retiring: Mutex<HashMap<WorkspaceKey, Retirement>>,
    next_slot: AtomicU64,
    handshakes: AtomicUsize,
    closed: AtomicBool,
}

impl Inner {
    fn release(&self, key: &WorkspaceKey, id: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key).filter(|slot| slot.id == id) {
            slot.leases = slot.leases.saturating_sub(1);
            slot.last_used = Instant::now();
        }
    }

    fn forget(&self, key: &WorkspaceKey, id: u64) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.id == id) {
            slots.remove(key);
        }
    }

    /// Retire the ready connection in slot `id` of `key`, if still present.
    fn evict(self: &Arc<Self>, key: &WorkspaceKey, id: u64) {
        let mut slots = self.slots.lock();
        let connection = match slots.get(key).filter(|slot| slot.id == id) {
            Some(slot) => match slot.creation.peek() {
                Some(Ok(connection)) => Arc::clone(connection),
                _ => return,
            },
            None => return,
        };
        slots.remove(key);
        warn!(workspace = %key, "Retiring dead backend connection");
        // Held across `retire` so the shutdown task cannot remove the entry
        // before it is inserted.
        let mut retiring = self.retiring.lock();
        let done = self.retire(key.clone(), connection);
        retiring.insert(key.clone(), done);
    }

    fn retire(self: &Arc<Self>, key: WorkspaceKey, connection: Connection) -> Retirement {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            connection.shutdown().await;
            inner.retiring.lock().remove(&key);
        });
        async move {
            let _ = task.await;
        }
        .boxed()
        .shared()
    }
}

/// Remove and return the connection for `key` if it is ready but dead.
fn take_dead(slots: &mut HashMap<WorkspaceKey, Slot>, key: &WorkspaceKey) -> Option<Connection> {
    let connection = match slots.get(key)?.creation.peek() {
        Some(Ok(connection)) if !connection.is_alive() => Arc::clone(connection),
        _ => return None,
    };
    slots.remove(key);
    Some(connection)
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections created or being created.
    pub live: usize,
    /// Connections shutting down.
    pub retiring: usize,
    /// Outstanding leases across all connections.
    pub leased: usize,
    /// Backend starts attempted since the pool was created.
    pub handshakes: usize,
}

/// Connection pool shared by all sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("registry", &self.inner.registry)
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// A pool starting connections from `registry`.
    #[must_use]
    pub fn new(registry: BackendRegistry, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                idle_timeout,
                slots: Mutex::new(HashMap::new()),
                retiring: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(0),
                handshakes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lease the connection for `key`, starting it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::BackendUnavailable`] when the key's mode has no
    /// backend or the backend fails to start, and [`PoolError::Closed`] after
    /// [`shutdown_all`](Self::shutdown_all).
    pub async fn acquire(&self, key: &WorkspaceKey) -> Result<Lease, PoolError> {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }

            let claim = {
                let mut slots = self.inner.slots.lock();
                let mut retiring = self.inner.retiring.lock();
                if let Some(done) = retiring.get(key).cloned() {
                    Err(done)
                } else if let Some(dead) = take_dead(&mut slots, key) {
                    warn!(workspace = %key, "Replacing dead backend connection");
                    let done = self.inner.retire(key.clone(), dead);
                    retiring.insert(key.clone(), done.clone());
                    Err(done)
                } else if let Some(slot) = slots.get_mut(key) {
                    slot.leases += 1;
                    Ok((slot.id, slot.creation.clone()))
                } else {
                    let id = self.inner.next_slot.fetch_add(1, Ordering::SeqCst);
                    let creation = self.spawn_creation(key, id);
                    slots.insert(
                        key.clone(),
                        Slot {
                            id,
                            creation: creation.clone(),
                            leases: 1,
                            last_used: Instant::now(),
                        },
                    );
                    Ok((id, creation))
                }
            };

            let (id, creation) = match claim {
                Ok(claim) => claim,
                Err(done) => {
                    debug!(workspace = %key, "Waiting for retiring connection");
                    done.await;
                    continue;
                }
            };

            // Counted from here on, even if this future is dropped while
            // the creation is still running.
            let guard = LeaseGuard {
                inner: Arc::clone(&self.inner),
                key: key.clone(),
                id,
            };
            let connection = creation.await?;
            return Ok(Lease { connection, guard });
        }
    }

    fn spawn_creation(&self, key: &WorkspaceKey, id: u64) -> Creation {
        let Some(backend) = self.inner.registry.get(&key.mode) else {
            let err = PoolError::unavailable(key, format!("no backend for mode {:?}", key.mode));
            warn!(workspace = %key, "No backend registered for mode");
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            // First polled after the caller has inserted the slot.
            return async move {
                inner.forget(&key, id);
                Err(err)
            }
            .boxed()
            .shared();
        };

        self.inner.handshakes.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task: JoinHandle<Result<Connection, PoolError>> = tokio::spawn(async move {
            debug!(workspace = %task_key, "Starting backend connection");
            match backend.start(&task_key).await {
                Ok(connection) => {
                    info!(workspace = %task_key, "Backend connection ready");
                    Ok(connection)
                }
                Err(e) => {
                    warn!(workspace = %task_key, error = %e, "Backend failed to start");
                    inner.forget(&task_key, id);
                    Err(PoolError::unavailable(&task_key, e.to_string()))
                }
            }
        });

        let key = key.clone();
        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    inner.forget(&key, id);
                    Err(PoolError::unavailable(&key, format!("backend start aborted: {e}")))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Retire every ready connection that has no leases and has been idle
    /// for at least the idle timeout. Returns the number retired once their
    /// shutdowns have finished.
    pub async fn reap_idle(&self) -> usize {
        // A creation whose acquirers all gave up is never polled again, so
        // its result would stay invisible to `peek`.
        let abandoned: Vec<Creation> = self
            .inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.leases == 0 && slot.creation.peek().is_none())
            .map(|slot| slot.creation.clone())
            .collect();
        for creation in abandoned {
            let _ = creation.now_or_never();
        }

        let now = Instant::now();
        let mut retirements = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            let mut retiring = self.inner.retiring.lock();
            let idle: Vec<WorkspaceKey> = slots
                .iter()
                .filter(|(_, slot)| {
                    slot.leases == 0
                        && now.duration_since(slot.last_used) >= self.inner.idle_timeout
                        && matches!(slot.creation.peek(), Some(Ok(_)))
                })
                .map(|(key, _)| key.clone())
                .collect();

            for key in idle {
                let Some(slot) = slots.remove(&key) else {
                    continue;
                };
                let Some(Ok(connection)) = slot.creation.peek().cloned() else {
                    continue;
                };
                info!(workspace = %key, "Retiring idle connection");
                let done = self.inner.retire(key.clone(), connection);
                retiring.insert(key, done.clone());
                retirements.push(done);
            }
        }

        let count = retirements.len();
        futures::future::join_all(retirements).await;
        if count > 0 {
            debug!(count, "Retired idle connections");
        }
        count
    }

    /// Run [`reap_idle`](Self::reap_idle) every `interval` until the
    /// returned task is aborted.
    #[must_use]
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                pool.reap_idle().await;
            }
        })
    }

    /// Shut down every connection and refuse further acquires.
    pub async fn shutdown_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let slots: Vec<(WorkspaceKey, Slot)> = self.inner.slots.lock().drain().collect();
        let retiring: Vec<Retirement> = self.inner.retiring.lock().values().cloned().collect();

        let mut shutdowns = Vec::new();
        for (key, slot) in slots {
            if slot.leases > 0 {
                debug!(workspace = %key, leases = slot.leases, "Shutting down leased connection");
            }
            if let Some(Ok(connection)) = slot.creation.peek().cloned() {
                shutdowns.push(async move { connection.shutdown().await });
            }
        }
        let count = shutdowns.len();
        futures::future::join_all(shutdowns).await;
        futures::future::join_all(retiring).await;
        info!(count, "Connection pool shut down");
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        PoolStats {
            live: slots.len(),
            retiring: self.inner.retiring.lock().len(),
            leased: slots.values().map(|slot| slot.leases).sum(),
            handshakes: self.inner.handshakes.load(Ordering::SeqCst),
        }
    }
}

struct LeaseGuard {
    inner: Arc<Inner>,
    key: WorkspaceKey,
    id: u64,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.id);
    }
}

/// Use of a pooled connection; released on drop.
pub struct Lease {
    connection: Connection,
    guard: LeaseGuard,
}

impl Lease {
    /// The workspace this lease is for.
    #[must_use]
    pub fn key(&self) -> &WorkspaceKey {
        &self.guard.key
    }

    /// Forward a call to the connection. A fatal failure retires the
    /// connection so the next acquire for this key starts a fresh one.
    ///
    /// # Errors
    ///
    /// Returns the connection's error unchanged.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> crate::backend::Result<Value> {
        let result = self.connection.call(method, params, cancel).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                debug!(workspace = %self.guard.key, error = %e, "Backend call failed fatally");
                self.guard.inner.evict(&self.guard.key, self.guard.id);
            }
        }
        result
    }
}

impl Deref for Lease {
    type Target = dyn BackendConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("key", self.key()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AnalysisBackend, BackendError};
    use crate::uri::RepoUri;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Quiet {
        shutdowns: AtomicUsize,
        dead: AtomicBool,
    }

    #[async_trait]
    impl BackendConnection for Quiet {
        async fn call(
            &self,
            _method: &str,
            _params: Value,
            _cancel: &CancellationToken,
        ) -> crate::backend::Result<Value> {
            Ok(Value::Null)
        }

        async fn read_file(&self, path: &str) -> crate::backend::Result<String> {
            Err(BackendError::InvalidPath(path.to_string()))
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
    }

    struct Counting {
        starts: AtomicUsize,
        fail: bool,
        last: Mutex<Option<Arc<Quiet>>>,
    }

    #[async_trait]
    impl AnalysisBackend for Counting {
        fn mode(&self) -> &str {
            "go"
        }

        async fn start(&self, _key: &WorkspaceKey) -> crate::backend::Result<Connection> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                Err(BackendError::InitializeFailed("boom".to_string()))
            } else {
                let connection = Arc::new(Quiet::default());
                *self.last.lock() = Some(Arc::clone(&connection));
                Ok(connection)
            }
        }
    }

    fn pool(fail: bool) -> (ConnectionPool, Arc<Counting>) {
        let backend = Arc::new(Counting {
            starts: AtomicUsize::new(0),
            fail,
            last: Mutex::new(None),
        });
        let registry = BackendRegistry::new().with(backend.clone());
        (ConnectionPool::new(registry, Duration::from_secs(60)), backend)
    }

    fn key(mode: &str) -> WorkspaceKey {
        WorkspaceKey::new(mode, &RepoUri::git("github.com/gorilla/mux", None))
    }

    #[tokio::test]
    async fn lease_drop_releases_the_connection() {
        let (pool, _) = pool(false);
        let lease = pool.acquire(&key("go")).await.unwrap();
        assert_eq!(lease.key(), &key("go"));
        assert_eq!(pool.stats().leased, 1);

        drop(lease);
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test]
    async fn unknown_mode_is_unavailable_and_not_kept() {
        let (pool, backend) = pool(false);
        let err = pool.acquire(&key("cobol")).await.unwrap_err();

        assert!(matches!(err, PoolError::BackendUnavailable { .. }));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn failed_start_is_retried_by_the_next_acquire() {
        let (pool, backend) = pool(true);
        assert!(pool.acquire(&key("go")).await.is_err());
        assert_eq!(pool.stats().live, 0);
        assert!(pool.acquire(&key("go")).await.is_err());
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_reaped_after_timeout() {
        let (pool, backend) = pool(false);
        drop(pool.acquire(&key("go")).await.unwrap());

        assert_eq!(pool.reap_idle().await, 0, "not idle long enough");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.reap_idle().await, 1);
        assert_eq!(pool.stats().live, 0);

        drop(pool.acquire(&key("go")).await.unwrap());
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_connections_are_never_reaped() {
        let (pool, _) = pool(false);
        let lease = pool.acquire(&key("go")).await.unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(pool.reap_idle().await, 0);
        drop(lease);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced_on_next_acquire() {
        let (pool, backend) = pool(false);
        drop(pool.acquire(&key("go")).await.unwrap());
        let first = backend.last.lock().clone().unwrap();
        first.dead.store(true, Ordering::SeqCst);

        let lease = pool.acquire(&key("go")).await.unwrap();

        assert!(lease.is_alive());
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().retiring, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_creation_is_reaped_once_idle() {
        let (pool, backend) = pool(false);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), pool.acquire(&key("go"))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(pool.reap_idle().await, 1);
        assert_eq!(pool.stats().live, 0);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_all_closes_the_pool() {
        let (pool, _) = pool(false);
        drop(pool.acquire(&key("go")).await.unwrap());

        pool.shutdown_all().await;
        assert_eq!(pool.stats().live, 0);
        assert_eq!(
            pool.acquire(&key("go")).await.unwrap_err(),
            PoolError::Closed
        );
    }
}
