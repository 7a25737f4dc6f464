//! Per-server connection pool: bounded size, fair leasing under contention,
//! lifecycle caps, and atomic statistics.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, Dialer};
use crate::error::Error;
use crate::stats::{PoolStats, PoolStatsSnapshot};

/// Knobs for one [`Pool`]; one set per server address.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub max_size: usize,
    pub dial_timeout: Duration,
    /// `None` means unbounded.
    pub max_conn_lifetime: Option<Duration>,
    pub max_conn_idle_time: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_size: 10,
            dial_timeout: Duration::from_secs(1),
            max_conn_lifetime: None,
            max_conn_idle_time: None,
        }
    }
}

struct PoolState {
    size: usize,
    closed: bool,
}

struct PoolInner {
    dialer: Arc<dyn Dialer>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Idle connections. A plain `Mutex<VecDeque<_>>` rather than a bounded
    /// channel: the lock is only ever held for the instant it takes to
    /// push/pop, never across a suspension, so a concurrent
    /// `acquire_all_idle`/`reap_idle` drain never contends with a parked
    /// acquirer the way holding a channel receiver across `recv().await`
    /// would.
    idle: Mutex<VecDeque<Connection>>,
    /// Signalled once per `release`/`close`; a waiting acquirer re-checks
    /// the idle queue and the create path on every wake rather than
    /// assuming the wake it received corresponds to a connection it can
    /// take, so a spurious or redundant notification is harmless.
    notify: Notify,
    /// Cancelled by `close()`, raced against `notify.notified()` in waiting
    /// acquirers so every blocked waiter wakes, not just whichever one
    /// happens to be notified next.
    closed_token: CancellationToken,
    stats: PoolStats,
}

/// Owns up to `max_size` connections to one server. Cheap to clone; clones
/// share the same underlying pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(dialer: Arc<dyn Dialer>, options: PoolOptions) -> Self {
        assert!(options.max_size >= 1, "pool max_size must be at least 1");
        Pool {
            inner: Arc::new(PoolInner {
                dialer,
                options,
                state: Mutex::new(PoolState { size: 0, closed: false }),
                idle: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed_token: CancellationToken::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Leases a connection, dialing a new one if under capacity or waiting
    /// for a release if at capacity. `ctx` is an optional cancellation
    /// token; an already-cancelled token fails immediately without creating
    /// a connection or touching pool size.
    ///
    /// The whole attempt — idle take, create-if-under-capacity, wait — is
    /// one retry loop rather than three separate code paths: destroying a
    /// stale idle connection (found either on the fast path or after being
    /// woken from a wait) frees a pool slot, so the next thing to try is
    /// always "can I create now", not "go back to sleep".
    pub async fn acquire(&self, ctx: Option<&CancellationToken>) -> Result<PooledConnection, Error> {
        self.inner.stats.record_acquire();
        if let Some(token) = ctx {
            if token.is_cancelled() {
                self.inner.stats.record_acquire_error();
                return Err(Error::Acquire("context already cancelled".to_string()));
            }
        }

        let mut wait_start: Option<Instant> = None;

        loop {
            if let Some(conn) = self.take_fresh_idle().await {
                if let Some(start) = wait_start {
                    self.inner.stats.record_acquire_wait(start.elapsed().as_nanos() as u64);
                }
                self.inner.stats.record_idle_to_active();
                return Ok(self.wrap(conn));
            }

            let should_create = {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    self.inner.stats.record_acquire_error();
                    return Err(Error::PoolClosed);
                }
                if state.size < self.inner.options.max_size {
                    state.size += 1;
                    true
                } else {
                    false
                }
            };

            if should_create {
                return match self.dial().await {
                    Ok(conn) => {
                        self.inner.stats.record_created();
                        self.inner.stats.record_new_active();
                        if let Some(start) = wait_start {
                            self.inner.stats.record_acquire_wait(start.elapsed().as_nanos() as u64);
                        }
                        Ok(self.wrap(conn))
                    }
                    Err(e) => {
                        let mut state = self.inner.state.lock().await;
                        state.size -= 1;
                        drop(state);
                        self.inner.stats.record_acquire_error();
                        Err(e)
                    }
                };
            }

            if wait_start.is_none() {
                wait_start = Some(Instant::now());
            }
            tokio::select! {
                biased;
                _ = self.inner.closed_token.cancelled() => {
                    self.inner.stats.record_acquire_error();
                    return Err(Error::PoolClosed);
                }
                _ = cancelled_or_pending(ctx) => {
                    self.inner.stats.record_acquire_error();
                    return Err(Error::Acquire("context cancelled while waiting".to_string()));
                }
                _ = self.inner.notify.notified() => {
                    // Wake and loop back around: re-check idle, then
                    // create-if-under-capacity, before waiting again.
                }
            }
        }
    }

    /// Pops connections off the idle queue until it finds one that isn't
    /// stale, destroying every stale one it passes over. Never suspends
    /// longer than it takes to touch the idle lock and, for a stale
    /// connection, the pool-size lock.
    async fn take_fresh_idle(&self) -> Option<Connection> {
        loop {
            let conn = {
                let mut idle = self.inner.idle.lock().await;
                idle.pop_front()
            }?;
            if self.is_stale(&conn) {
                self.finalize_stale(conn).await;
                continue;
            }
            return Some(conn);
        }
    }

    /// Drains every currently idle connection, handed back as active
    /// handles. Never blocks; used by background health sweeps. A parked
    /// `acquire` never holds the idle lock across its wait (it only takes
    /// it for the instant a pop or push takes), so this never contends with
    /// a waiter the way sharing a channel receiver across `recv().await`
    /// would. See [`Pool::reap_idle`].
    pub async fn acquire_all_idle(&self) -> Vec<PooledConnection> {
        let drained: Vec<Connection> = {
            let mut idle = self.inner.idle.lock().await;
            idle.drain(..).collect()
        };
        drained
            .into_iter()
            .map(|conn| {
                self.inner.stats.record_idle_to_active();
                self.wrap(conn)
            })
            .collect()
    }

    /// Caller-driven health sweep: pulls every idle connection, destroys
    /// those that have exceeded `max_conn_lifetime`/`max_conn_idle_time`,
    /// and releases the rest back unused (`HealthCheckInterval` names the
    /// cadence; this crate doesn't own a scheduler loop to drive it — see
    /// DESIGN.md).
    pub async fn reap_idle(&self) {
        for handle in self.acquire_all_idle().await {
            let stale = handle.conn.as_ref().map(|c| self.is_stale(c)).unwrap_or(false);
            if stale {
                handle.destroy().await;
            } else {
                handle.release_unused().await;
            }
        }
    }

    /// Closes the pool: further acquires fail, idle connections are
    /// closed, and every blocked waiter wakes with a closed error.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.closed_token.cancel();

        let drained: Vec<Connection> = {
            let mut idle = self.inner.idle.lock().await;
            idle.drain(..).collect()
        };
        for conn in drained {
            drop(conn);
            let mut state = self.inner.state.lock().await;
            state.size = state.size.saturating_sub(1);
            drop(state);
            self.inner.stats.record_idle_destroyed();
            self.inner.stats.record_destroyed();
        }
    }

    fn is_stale(&self, conn: &Connection) -> bool {
        if let Some(max_lifetime) = self.inner.options.max_conn_lifetime {
            if conn.created_at().elapsed() >= max_lifetime {
                return true;
            }
        }
        if let Some(max_idle) = self.inner.options.max_conn_idle_time {
            if conn.last_used_at().elapsed() >= max_idle {
                return true;
            }
        }
        false
    }

    async fn dial(&self) -> Result<Connection, Error> {
        match tokio::time::timeout(self.inner.options.dial_timeout, Connection::dial(self.inner.dialer.as_ref()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Acquire(format!(
                "dial timed out after {:?}",
                self.inner.options.dial_timeout
            ))),
        }
    }

    fn wrap(&self, conn: Connection) -> PooledConnection {
        PooledConnection { conn: Some(conn), pool: self.clone() }
    }

    /// An idle connection found stale during an acquire scan: it was never
    /// handed out as active, so only the idle-side counters move.
    async fn finalize_stale(&self, conn: Connection) {
        drop(conn);
        let mut state = self.inner.state.lock().await;
        state.size = state.size.saturating_sub(1);
        drop(state);
        self.inner.stats.record_idle_destroyed();
        self.inner.stats.record_destroyed();
    }

    async fn release(&self, mut conn: Connection, update_last_used: bool) {
        if conn.is_poisoned() {
            self.destroy_active(conn).await;
            return;
        }
        let closed = self.inner.state.lock().await.closed;
        if closed {
            self.destroy_active(conn).await;
            return;
        }
        if update_last_used {
            conn.touch();
        }
        {
            let mut idle = self.inner.idle.lock().await;
            idle.push_back(conn);
        }
        self.inner.stats.record_active_to_idle();
        self.inner.notify.notify_one();
    }

    async fn destroy_active(&self, conn: Connection) {
        drop(conn);
        let mut state = self.inner.state.lock().await;
        state.size = state.size.saturating_sub(1);
        drop(state);
        self.inner.stats.record_active_destroyed();
        self.inner.stats.record_destroyed();
    }
}

/// Races a context's cancellation against a permanently-pending future when
/// no context was supplied, so the `tokio::select!` arm is always well
/// typed whether or not the caller passed one.
async fn cancelled_or_pending(ctx: Option<&CancellationToken>) {
    match ctx {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// RAII capability proving exclusive hold on a pooled connection. Exactly
/// one of [`PooledConnection::release`], [`PooledConnection::release_unused`],
/// or [`PooledConnection::destroy`] should be called; dropping without one
/// is a safety net that releases the connection back to idle, not a
/// substitute for calling one explicitly.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl PooledConnection {
    /// Returns the connection to idle and updates its last-used timestamp.
    pub async fn release(mut self) {
        let conn = self.conn.take().expect("connection taken");
        self.pool.release(conn, true).await;
    }

    /// Returns the connection to idle without updating last-used; used by
    /// passive health probes that touched the connection without serving a
    /// caller's request.
    pub async fn release_unused(mut self) {
        let conn = self.conn.take().expect("connection taken");
        self.pool.release(conn, false).await;
    }

    /// Closes the connection and decrements the pool's size.
    pub async fn destroy(mut self) {
        let conn = self.conn.take().expect("connection taken");
        self.pool.destroy_active(conn).await;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn, true).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BoxedStream;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DuplexDialer {
        attempts: AtomicUsize,
        fail_first_n: usize,
    }

    impl Dialer for DuplexDialer {
        fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = n < self.fail_first_n;
            Box::pin(async move {
                if fail {
                    return Err(Error::Io(std::sync::Arc::new(std::io::Error::from(
                        std::io::ErrorKind::ConnectionRefused,
                    ))));
                }
                let (client, _server) = tokio::io::duplex(4096);
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    fn dialer(fail_first_n: usize) -> Arc<dyn Dialer> {
        Arc::new(DuplexDialer { attempts: AtomicUsize::new(0), fail_first_n })
    }

    #[tokio::test]
    async fn acquire_creates_up_to_max_size_then_waits() {
        let pool = Pool::new(dialer(0), PoolOptions { max_size: 2, ..Default::default() });
        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        assert_eq!(pool.stats().total_conns, 2);
        assert_eq!(pool.stats().active_conns, 2);

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        a.release().await;
        let c = waiter.await.unwrap().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.acquire_count, 3);
        assert_eq!(stats.acquire_wait_count, 1);
        assert!(stats.acquire_wait_time_ns > 0);

        b.release().await;
        c.release().await;
    }

    #[tokio::test]
    async fn stale_idle_connection_is_destroyed_and_acquire_dials_fresh() {
        let pool = Pool::new(
            dialer(0),
            PoolOptions { max_size: 1, max_conn_idle_time: Some(Duration::from_millis(5)), ..Default::default() },
        );
        let a = pool.acquire(None).await.unwrap();
        a.release().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let b = pool.acquire(None).await.unwrap();
        assert_eq!(pool.stats().destroyed_conns, 1);
        assert_eq!(pool.stats().created_conns, 2);
        b.release().await;
    }

    #[tokio::test]
    async fn acquire_with_already_cancelled_token_fails_without_creating() {
        let pool = Pool::new(dialer(0), PoolOptions { max_size: 2, ..Default::default() });
        let token = CancellationToken::new();
        token.cancel();
        let result = pool.acquire(Some(&token)).await;
        assert!(matches!(result, Err(Error::Acquire(_))));
        assert_eq!(pool.stats().total_conns, 0);
    }

    #[tokio::test]
    async fn closing_pool_wakes_every_blocked_waiter() {
        let pool = Pool::new(dialer(0), PoolOptions { max_size: 1, ..Default::default() });
        let held = pool.acquire(None).await.unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire(None).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await;

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(Error::PoolClosed)));
        }
        held.release().await;
    }

    #[tokio::test]
    async fn dial_failure_rolls_back_size_and_surfaces_error() {
        let pool = Pool::new(dialer(1), PoolOptions { max_size: 1, ..Default::default() });
        let result = pool.acquire(None).await;
        assert!(result.is_err());
        assert_eq!(pool.stats().total_conns, 0);
        assert_eq!(pool.stats().acquire_errors, 1);

        let result = pool.acquire(None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn parked_waiter_dials_fresh_after_the_released_connection_turns_stale() {
        let pool = Pool::new(
            dialer(0),
            PoolOptions { max_size: 1, max_conn_lifetime: Some(Duration::from_millis(15)), ..Default::default() },
        );
        let held = pool.acquire(None).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(None).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        // Outlive max_conn_lifetime, then release: `release` doesn't check
        // staleness itself, so the waiter is the one that discovers the
        // connection it was just notified about is over-age.
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("parked waiter must dial a fresh connection instead of hanging after destroying a stale one")
            .unwrap();
        let fresh = result.unwrap();
        assert_eq!(pool.stats().destroyed_conns, 1);
        assert_eq!(pool.stats().created_conns, 2);
        fresh.release().await;
    }

    #[tokio::test]
    async fn acquire_all_idle_does_not_block_behind_a_parked_waiter() {
        let pool = Pool::new(dialer(0), PoolOptions { max_size: 1, ..Default::default() });
        let held = pool.acquire(None).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        let drained = tokio::time::timeout(Duration::from_millis(200), pool.acquire_all_idle())
            .await
            .expect("acquire_all_idle must not block behind a parked acquirer");
        assert!(drained.is_empty());

        held.release().await;
        waiter.await.unwrap().unwrap().release().await;
    }

    #[tokio::test]
    async fn acquire_all_idle_drains_without_blocking() {
        let pool = Pool::new(dialer(0), PoolOptions { max_size: 2, ..Default::default() });
        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        a.release().await;
        b.release().await;

        let drained = pool.acquire_all_idle().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.stats().idle_conns, 0);
        assert_eq!(pool.stats().active_conns, 2);
        for handle in drained {
            handle.release().await;
        }
    }
}
