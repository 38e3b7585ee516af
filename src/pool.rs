//! Connection pool keyed by logical transaction identity.
//!
//! A root transaction binds one backend connection under its transaction id; nested
//! sessions presenting the same id get the same connection back with the reference
//! count bumped. The number of bound root transactions is capped, and a released
//! connection lingers idle so it can be reused before it is reclaimed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Connection, Connector, Transaction};
use crate::config::{TransactionConfig, TxOptions};
use crate::context::CallContext;
use crate::error::{Error, Result};

type SharedConnection = Arc<tokio::sync::Mutex<Box<dyn Connection>>>;

/// Pool limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_tx_connections: usize,
    pub idle_timeout: Duration,
    pub connection_reuse: bool,
}

impl From<&TransactionConfig> for PoolConfig {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            max_tx_connections: config.max_tx_connections,
            idle_timeout: config.idle_timeout,
            connection_reuse: config.connection_reuse,
        }
    }
}

struct PoolEntry {
    conn: SharedConnection,
    ref_count: usize,
    bound_at: Instant,
    last_released_at: Option<Instant>,
    uses: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    /// Slots reserved by acquisitions that are connecting or pinging.
    pending: usize,
    /// Root bindings in progress, cancelled once the binding settles.
    binding: HashMap<String, CancellationToken>,
    closed: bool,
}

impl PoolState {
    fn bound(&self) -> usize {
        self.entries.values().filter(|e| e.ref_count > 0).count()
    }
}

/// A connection handed out for one transaction id.
///
/// Holding the handle does not keep the binding alive; only
/// [`ConnectionPool::release`] decrements the reference count.
#[derive(Clone)]
pub struct PooledConnection {
    transaction_id: String,
    conn: SharedConnection,
    ref_count: usize,
}

impl PooledConnection {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Reference count right after this acquisition.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub async fn begin(&self, options: &TxOptions) -> Result<Box<dyn Transaction>> {
        self.conn.lock().await.begin(options).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.conn.lock().await.ping().await
    }

    /// Whether two handles refer to the same physical connection.
    pub fn same_connection(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("transaction_id", &self.transaction_id)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

/// Introspection record for one pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub transaction_id: String,
    pub ref_count: usize,
    pub bound_for: Duration,
    /// How long the entry has been idle, if it is idle.
    pub idle_for: Option<Duration>,
    pub uses: u64,
}

/// Pool counters and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub bound_transactions: usize,
    pub idle_connections: usize,
    pub pending: usize,
    pub max_tx_connections: usize,
    pub idle_timeout: Duration,
    pub connection_reuse: bool,
    pub opened: u64,
    pub reused: u64,
    pub reclaimed: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    reused: AtomicU64,
    reclaimed: AtomicU64,
    rejected: AtomicU64,
}

/// Frees a reserved slot and wakes acquirers waiting on the same id, whether
/// the binding succeeded, failed or was abandoned midway.
struct Reservation<'a> {
    state: &'a Mutex<PoolState>,
    transaction_id: &'a str,
    settled: CancellationToken,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            state.pending -= 1;
            state.binding.remove(self.transaction_id);
        }
        self.settled.cancel();
    }
}

/// Transaction-scoped connection pool.
///
/// The map lock is held only while touching entries; connecting, pinging and
/// closing happen outside it.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Hands out the connection bound to `transaction_id`, binding one if needed.
    ///
    /// An existing binding is shared and its reference count incremented. A new
    /// binding reuses an idle connection when reuse is enabled and it answers a
    /// ping, and opens a fresh connection otherwise. Nested levels never create
    /// bindings. Concurrent acquisitions of an id whose binding is still being
    /// opened wait for it and then share it.
    ///
    /// # Errors
    ///
    /// - [`Error::Capacity`] when `max_tx_connections` transactions are already bound.
    ///   This is a backpressure signal; do not retry in a tight loop.
    /// - [`Error::UnknownTransaction`] for a nested level whose root is not bound.
    /// - [`Error::PoolClosed`], the context's cancellation error, or a connect error.
    pub async fn acquire(
        &self,
        ctx: &CallContext,
        transaction_id: &str,
        nest_level: u32,
    ) -> Result<PooledConnection> {
        ctx.check()?;

        let (idle, settled) = loop {
            let in_progress = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                let active = state.bound() + state.pending;
                let max = self.config.max_tx_connections;
                if let Some(entry) = state.entries.get_mut(transaction_id) {
                    if entry.ref_count == 0 && active >= max {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::Capacity { active, max });
                    }
                    entry.ref_count += 1;
                    entry.uses += 1;
                    entry.last_released_at = None;
                    debug!(transaction_id, nest_level, ref_count = entry.ref_count, "connection shared");
                    return Ok(PooledConnection {
                        transaction_id: transaction_id.to_string(),
                        conn: Arc::clone(&entry.conn),
                        ref_count: entry.ref_count,
                    });
                }
                match state.binding.get(transaction_id).cloned() {
                    Some(settled) => settled,
                    None => {
                        if nest_level > 0 {
                            return Err(Error::UnknownTransaction(transaction_id.to_string()));
                        }
                        if active >= max {
                            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                            return Err(Error::Capacity { active, max });
                        }
                        state.pending += 1;
                        let settled = CancellationToken::new();
                        state
                            .binding
                            .insert(transaction_id.to_string(), settled.clone());

                        let idle = if self.config.connection_reuse {
                            take_warmest_idle(&mut state.entries)
                        } else {
                            None
                        };
                        break (idle, settled);
                    }
                }
            };

            debug!(transaction_id, nest_level, "waiting for binding in progress");
            tokio::select! {
                err = ctx.done() => return Err(err),
                _ = in_progress.cancelled() => {}
            }
        };
        let reservation = Reservation {
            state: &self.state,
            transaction_id,
            settled,
        };

        let mut conn = None;
        if let Some((old_id, idle)) = idle {
            let alive = idle.lock().await.ping().await;
            match alive {
                Ok(()) => {
                    debug!(transaction_id, previous = %old_id, "idle connection rebound");
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    conn = Some(idle);
                }
                Err(e) => {
                    warn!(previous = %old_id, error = %e, "idle connection failed ping, closing");
                    close_shared(idle).await;
                    self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let conn = match conn {
            Some(conn) => conn,
            None => {
                let opened = self.connector.connect().await?;
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                Arc::new(tokio::sync::Mutex::new(opened))
            }
        };

        let mut state = self.state.lock();
        state.entries.insert(
            transaction_id.to_string(),
            PoolEntry {
                conn: Arc::clone(&conn),
                ref_count: 1,
                bound_at: Instant::now(),
                last_released_at: None,
                uses: 1,
            },
        );
        drop(state);
        drop(reservation);
        debug!(transaction_id, "connection bound");

        Ok(PooledConnection {
            transaction_id: transaction_id.to_string(),
            conn,
            ref_count: 1,
        })
    }

    /// Drops one reference to the binding for `transaction_id`.
    ///
    /// At zero the entry stays in the pool, marked idle, until reused or reclaimed
    /// by [`cleanup_idle_connections`](Self::cleanup_idle_connections). Once the pool
    /// is closed, an entry reaching zero is closed right away.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownTransaction`] if nothing is bound to the id.
    pub async fn release(&self, transaction_id: &str) -> Result<()> {
        if let Some(conn) = self.unbind(transaction_id, false)? {
            close_shared(conn).await;
        }
        Ok(())
    }

    /// Like [`release`](Self::release), but a connection reaching zero references is
    /// closed instead of kept idle. Used when its state can no longer be trusted,
    /// e.g. after a failed rollback.
    pub async fn release_and_discard(&self, transaction_id: &str) -> Result<()> {
        if let Some(conn) = self.unbind(transaction_id, true)? {
            close_shared(conn).await;
        }
        Ok(())
    }

    /// Synchronous discard for teardown paths that cannot await. A connection
    /// reaching zero references is dropped without a graceful close.
    pub(crate) fn release_detached(&self, transaction_id: &str) {
        match self.unbind(transaction_id, true) {
            Ok(Some(_conn)) => debug!(transaction_id, "abandoned connection dropped"),
            Ok(None) => {}
            Err(e) => warn!(transaction_id, error = %e, "detached release failed"),
        }
    }

    fn unbind(&self, transaction_id: &str, discard: bool) -> Result<Option<SharedConnection>> {
        let mut state = self.state.lock();
        let closed = state.closed;
        let entry = match state.entries.get_mut(transaction_id) {
            Some(entry) if entry.ref_count > 0 => entry,
            _ => return Err(Error::UnknownTransaction(transaction_id.to_string())),
        };
        entry.ref_count -= 1;
        debug!(transaction_id, ref_count = entry.ref_count, "connection released");
        if entry.ref_count > 0 {
            return Ok(None);
        }
        entry.last_released_at = Some(Instant::now());
        if closed || discard {
            Ok(state.entries.remove(transaction_id).map(|e| e.conn))
        } else {
            Ok(None)
        }
    }

    /// Closes and removes idle entries whose idle time exceeds the timeout.
    ///
    /// Entries with a non-zero reference count are never touched. The context is
    /// checked before each close, so a cancelled sweep stops early and leaves the
    /// rest for the next one. Returns the number of connections reclaimed.
    ///
    /// # Errors
    ///
    /// The context's cancellation error, if it fires before the sweep finishes.
    pub async fn cleanup_idle_connections(&self, ctx: &CallContext) -> Result<usize> {
        let now = Instant::now();
        let candidates: Vec<String> = self
            .state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut count = 0;
        for id in candidates {
            if let Err(e) = ctx.check() {
                self.record_reclaimed(count);
                return Err(e);
            }
            // Re-checked under the lock: the entry may have been rebound meanwhile.
            let conn = {
                let mut state = self.state.lock();
                match state.entries.get(&id) {
                    Some(e) if self.is_expired(e, now) => state.entries.remove(&id).map(|e| e.conn),
                    _ => None,
                }
            };
            if let Some(conn) = conn {
                debug!(transaction_id = %id, "reclaiming idle connection");
                close_shared(conn).await;
                count += 1;
            }
        }
        self.record_reclaimed(count);
        Ok(count)
    }

    fn is_expired(&self, entry: &PoolEntry, now: Instant) -> bool {
        entry.ref_count == 0
            && entry
                .last_released_at
                .is_some_and(|at| now.duration_since(at) > self.config.idle_timeout)
    }

    fn record_reclaimed(&self, count: usize) {
        if count > 0 {
            self.counters
                .reclaimed
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(reclaimed = count, "idle connections reclaimed");
        }
    }

    /// Runs [`cleanup_idle_connections`](Self::cleanup_idle_connections) every
    /// `interval` until `cancel` fires.
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = CallContext::new().with_cancellation(cancel.clone());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.cleanup_idle_connections(&ctx).await {
                            debug!(error = %e, "idle sweep interrupted");
                        }
                    }
                }
            }
            debug!("idle reaper stopped");
        })
    }

    /// Refuses further acquisitions and closes every idle connection. Bound
    /// connections are closed as their last reference is released.
    pub async fn close(&self) {
        let idle: Vec<SharedConnection> = {
            let mut state = self.state.lock();
            state.closed = true;
            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.entries.remove(id).map(|e| e.conn))
                .collect()
        };
        for conn in idle {
            close_shared(conn).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Every entry, bound or idle.
    pub fn active_connections(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut infos: Vec<ConnectionInfo> = state
            .entries
            .iter()
            .map(|(id, e)| ConnectionInfo {
                transaction_id: id.clone(),
                ref_count: e.ref_count,
                bound_for: now.duration_since(e.bound_at),
                idle_for: e.last_released_at.map(|at| now.duration_since(at)),
                uses: e.uses,
            })
            .collect();
        infos.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        infos
    }

    /// Reference count for a transaction id, if bound or idle.
    pub fn ref_count(&self, transaction_id: &str) -> Option<usize> {
        self.state
            .lock()
            .entries
            .get(transaction_id)
            .map(|e| e.ref_count)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let bound = state.bound();
        PoolStats {
            total_connections: state.entries.len(),
            bound_transactions: bound,
            idle_connections: state.entries.len() - bound,
            pending: state.pending,
            max_tx_connections: self.config.max_tx_connections,
            idle_timeout: self.config.idle_timeout,
            connection_reuse: self.config.connection_reuse,
            opened: self.counters.opened.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Removes the most recently released idle entry, if any.
fn take_warmest_idle(entries: &mut HashMap<String, PoolEntry>) -> Option<(String, SharedConnection)> {
    let id = entries
        .iter()
        .filter(|(_, e)| e.ref_count == 0)
        .max_by_key(|(_, e)| e.last_released_at)
        .map(|(id, _)| id.clone())?;
    entries.remove(&id).map(|e| (id, e.conn))
}

async fn close_shared(conn: SharedConnection) {
    match Arc::try_unwrap(conn) {
        Ok(conn) => {
            if let Err(e) = conn.into_inner().close().await {
                warn!(error = %e, "failed to close connection");
            }
        }
        // A leftover handle still points at it; dropping the last one drops the connection.
        Err(_) => debug!("connection still referenced, dropping instead of closing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{FailPoint, MemoryConnector};

    fn pool(backend: &MemoryConnector, max: usize, idle: Duration) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(backend.clone()),
            PoolConfig {
                max_tx_connections: max,
                idle_timeout: idle,
                connection_reuse: false,
            },
        )
    }

    #[tokio::test]
    async fn test_same_transaction_shares_one_connection() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();

        let root = pool.acquire(&ctx, "tx-a", 0).await.unwrap();
        let nested = pool.acquire(&ctx, "tx-a", 1).await.unwrap();
        assert!(root.same_connection(&nested));
        assert_eq!(nested.ref_count(), 2);
        assert_eq!(backend.stats().connects, 1);

        pool.release("tx-a").await.unwrap();
        pool.release("tx-a").await.unwrap();
        assert_eq!(pool.ref_count("tx-a"), Some(0));
        assert!(matches!(
            pool.release("tx-a").await,
            Err(Error::UnknownTransaction(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_binding_of_one_id_opens_one_connection() {
        let backend = MemoryConnector::new();
        backend.set_connect_delay(Duration::from_millis(5));
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();

        let (first, second) = tokio::join!(
            pool.acquire(&ctx, "tx-x", 0),
            pool.acquire(&ctx, "tx-x", 0)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.same_connection(&second));
        assert_eq!(backend.stats().connects, 1);
        assert_eq!(pool.ref_count("tx-x"), Some(2));
        assert_eq!(pool.stats().pending, 0);

        pool.release("tx-x").await.unwrap();
        pool.release("tx-x").await.unwrap();
        assert_eq!(pool.ref_count("tx-x"), Some(0));
    }

    #[tokio::test]
    async fn test_waiter_binds_after_failed_connect() {
        let backend = MemoryConnector::new();
        backend.set_connect_delay(Duration::from_millis(5));
        backend.fail_times(FailPoint::Connect, 1, "08001", "refused");
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();

        let (first, second) = tokio::join!(
            pool.acquire(&ctx, "tx-x", 0),
            pool.acquire(&ctx, "tx-x", 0)
        );
        assert!(first.is_err());
        assert_eq!(second.unwrap().ref_count(), 1);
        assert_eq!(backend.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_waiter_honors_its_own_cancellation() {
        let backend = MemoryConnector::new();
        backend.set_connect_delay(Duration::from_millis(50));
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();
        let impatient = CallContext::new().with_timeout(Duration::from_millis(5));

        let (first, second) = tokio::join!(
            pool.acquire(&ctx, "tx-x", 0),
            pool.acquire(&impatient, "tx-x", 0)
        );
        assert_eq!(first.unwrap().ref_count(), 1);
        assert!(matches!(second, Err(Error::DeadlineExceeded)));
        assert_eq!(pool.ref_count("tx-x"), Some(1));
    }

    #[tokio::test]
    async fn test_capacity_is_enforced_and_recovers_after_release() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.acquire(&ctx, "tx-2", 0).await.unwrap();
        let err = pool.acquire(&ctx, "tx-3", 0).await.unwrap_err();
        assert!(matches!(err, Error::Capacity { active: 2, max: 2 }));
        assert_eq!(pool.stats().rejected, 1);

        pool.release("tx-1").await.unwrap();
        pool.acquire(&ctx, "tx-3", 0).await.unwrap();
        assert_eq!(pool.stats().bound_transactions, 2);
    }

    #[tokio::test]
    async fn test_idle_cleanup_reclaims_only_released_entries() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 4, Duration::from_millis(1));
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-idle", 0).await.unwrap();
        pool.acquire(&ctx, "tx-busy", 0).await.unwrap();
        pool.release("tx-idle").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        assert_eq!(pool.cleanup_idle_connections(&ctx).await.unwrap(), 1);
        let ids: Vec<String> = pool
            .active_connections()
            .into_iter()
            .map(|c| c.transaction_id)
            .collect();
        assert_eq!(ids, vec!["tx-busy"]);
        assert_eq!(backend.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_cancelled_cleanup_stops_before_closing() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 4, Duration::from_millis(1));
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.release("tx-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        let cancelled = CallContext::new();
        cancelled.cancel();
        assert!(matches!(
            pool.cleanup_idle_connections(&cancelled).await,
            Err(Error::Cancelled)
        ));
        assert_eq!(backend.stats().closes, 0);
        assert_eq!(pool.cleanup_idle_connections(&ctx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nested_level_requires_existing_binding() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let err = pool
            .acquire(&CallContext::new(), "missing", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTransaction(_)));
        assert_eq!(backend.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_idle_connection_is_rebound_when_reuse_enabled() {
        let backend = MemoryConnector::new();
        let pool = ConnectionPool::new(
            Arc::new(backend.clone()),
            PoolConfig {
                max_tx_connections: 1,
                idle_timeout: Duration::from_secs(60),
                connection_reuse: true,
            },
        );
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.release("tx-1").await.unwrap();
        pool.acquire(&ctx, "tx-2", 0).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(backend.stats().pings, 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let backend = MemoryConnector::new();
        let pool = ConnectionPool::new(
            Arc::new(backend.clone()),
            PoolConfig {
                max_tx_connections: 1,
                idle_timeout: Duration::from_secs(60),
                connection_reuse: true,
            },
        );
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.release("tx-1").await.unwrap();
        backend.fail_times(FailPoint::Ping, 1, "08006", "server gone");
        pool.acquire(&ctx, "tx-2", 0).await.unwrap();

        assert_eq!(backend.stats().connects, 2);
        assert_eq!(backend.stats().closes, 1);
        assert_eq!(pool.stats().reused, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_frees_reservation() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 1, Duration::from_secs(60));
        backend.fail_times(FailPoint::Connect, 1, "08001", "refused");
        let ctx = CallContext::new();

        assert!(pool.acquire(&ctx, "tx-1", 0).await.is_err());
        assert_eq!(pool.stats().pending, 0);
        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_new_work_and_closes_on_last_release() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.close().await;
        assert!(matches!(
            pool.acquire(&ctx, "tx-2", 0).await,
            Err(Error::PoolClosed)
        ));
        assert_eq!(backend.stats().closes, 0);
        pool.release("tx-1").await.unwrap();
        assert_eq!(backend.stats().closes, 1);
        assert!(pool.active_connections().is_empty());
    }

    #[tokio::test]
    async fn test_discard_closes_instead_of_idling() {
        let backend = MemoryConnector::new();
        let pool = pool(&backend, 2, Duration::from_secs(60));
        let ctx = CallContext::new();

        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.acquire(&ctx, "tx-1", 1).await.unwrap();
        pool.release_detached("tx-1");
        assert_eq!(pool.ref_count("tx-1"), Some(1));
        pool.release_and_discard("tx-1").await.unwrap();
        assert_eq!(pool.ref_count("tx-1"), None);
        assert_eq!(backend.stats().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_runs_until_cancelled() {
        let backend = MemoryConnector::new();
        let pool = Arc::new(pool(&backend, 2, Duration::from_millis(5)));
        let ctx = CallContext::new();
        pool.acquire(&ctx, "tx-1", 0).await.unwrap();
        pool.release("tx-1").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = pool.spawn_idle_reaper(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(pool.active_connections().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
