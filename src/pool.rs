//! A bounded pool of long lived backend connections.
//!
//! Connections are either *idle*, parked in a stack, or *leased* to exactly one session. The two
//! sets are guarded by independent locks. Nothing holds both locks at once except
//! [`Pool::close`], which takes them in leased → idle order. The connection count and the closed
//! flag are atomics so status reads never wait on a lock.
//!
//! Reuse is LIFO: the most recently released connection is the warmest one and is handed out
//! first. Eviction is FIFO: the idle reaper only ever looks at the front of the stack, where the
//! connection released longest ago sits.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dial::{BackendStream, Dialer};

// Upper bound on a graceful shutdown of a backend socket (TLS close_notify, FIN).
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("connection pool is exhausted")]
    PoolExhausted,
    #[error("connection pool is already closed")]
    AlreadyClosed,
    #[error("connection is not leased from this pool")]
    NotLeased,
    #[error("failed to dial backend: {0}")]
    Dial(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Point in time view of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub total: usize,
}

struct Conn {
    id: u64,
    stream: BackendStream,
    created_at: Instant,
    last_used: Instant,
}

/// A backend connection leased to a single session.
///
/// Hand it back with [`Pool::release`] when it is still usable, or with [`Pool::remove`] when its
/// protocol state is unknown. Dropping it without doing either behaves like `remove`, except that
/// the socket is closed abruptly.
pub struct PooledConnection {
    pool: Weak<Inner>,
    conn: Option<Conn>,
    closed: CancellationToken,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn().id
    }

    pub fn stream(&mut self) -> &mut BackendStream {
        &mut self.conn.as_mut().expect("connection exists").stream
    }

    /// When the connection was last released to the pool. Not refreshed while leased.
    pub fn last_used(&self) -> Instant {
        self.conn().last_used
    }

    /// Cancelled when the pool closes. Anyone blocked on the stream must stop and drop the lease.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    fn conn(&self) -> &Conn {
        // Only `release`, `remove` and `drop` take the connection, and all of them consume `self`.
        self.conn.as_ref().expect("connection exists")
    }

    fn is_from(&self, inner: &Arc<Inner>) -> bool {
        Weak::ptr_eq(&self.pool, &Arc::downgrade(inner))
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(|conn| conn.id))
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if let Some(inner) = self.pool.upgrade() {
            if inner.forget(conn.id) {
                warn!(id = conn.id, "leased connection dropped without being returned");
            }
        }
    }
}

struct Inner {
    config: Config,
    dialer: Dialer,
    idle: Mutex<VecDeque<Conn>>,
    // Connection id -> lease start.
    leased: Mutex<HashMap<u64, Instant>>,
    total: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
    // Signalled whenever a connection or a slot becomes available.
    available: Notify,
    shutdown: CancellationToken,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claims a slot for a connection about to be dialed.
    fn reserve(&self) -> bool {
        let max = self.config.max_pool_size;
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }

    async fn dial(&self) -> Result<Conn, Error> {
        let stream = self.dialer.dial().await.map_err(Error::Dial)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        debug!(id, address = %self.config.address, "dialed backend connection");

        Ok(Conn {
            id,
            stream,
            created_at: now,
            last_used: now,
        })
    }

    fn pop_idle(&self) -> Option<Conn> {
        self.idle.lock().unwrap().pop_back()
    }

    /// Parks a connection on top of the idle stack. Hands it back if the pool has closed.
    fn push_idle(&self, conn: Conn) -> Result<(), Conn> {
        {
            let mut idle = self.idle.lock().unwrap();
            if self.is_closed() {
                return Err(conn);
            }
            idle.push_back(conn);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Moves a connection that is in neither set into the leased set.
    fn lease(self: &Arc<Self>, conn: Conn) -> Result<PooledConnection, Conn> {
        {
            let mut leased = self.leased.lock().unwrap();
            if self.is_closed() {
                return Err(conn);
            }
            leased.insert(conn.id, Instant::now());
        }

        Ok(PooledConnection {
            pool: Arc::downgrade(self),
            conn: Some(conn),
            closed: self.shutdown.child_token(),
        })
    }

    /// Drops a connection from the leased set and frees its slot. Returns false if it was not
    /// leased, which is the case for every lease once the pool has closed.
    fn forget(&self, id: u64) -> bool {
        let removed = self.leased.lock().unwrap().remove(&id).is_some();
        if removed {
            self.release_slot();
        }
        removed
    }

    /// Pops every connection at the front of the idle stack that has been idle too long.
    fn remove_expired(&self) -> Vec<Conn> {
        let idle_timeout = self.config.idle_timeout;
        if idle_timeout.is_zero() {
            return Vec::new();
        }

        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock().unwrap();
            while idle
                .front()
                .is_some_and(|conn| conn.last_used.elapsed() > idle_timeout)
            {
                expired.extend(idle.pop_front());
            }
        }

        for _ in &expired {
            self.release_slot();
        }
        expired
    }
}

/// Connection pool handle. Cloning it is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    /// Creates an empty pool and starts its idle reaper. Must be called within a tokio runtime.
    pub fn new(config: Config, dialer: Dialer) -> Result<Pool, Error> {
        config.validate()?;

        let idle_check_interval = config.idle_check_interval;
        let inner = Arc::new(Inner {
            idle: Mutex::new(VecDeque::with_capacity(config.max_pool_size)),
            leased: Mutex::new(HashMap::with_capacity(config.max_pool_size)),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            available: Notify::new(),
            shutdown: CancellationToken::new(),
            config,
            dialer,
        });

        tokio::spawn(reap_idle_connections(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            idle_check_interval,
        ));

        Ok(Pool { inner })
    }

    /// Creates the pool and eagerly dials `initial_pool_size` connections.
    pub async fn connect(config: Config, dialer: Dialer) -> Result<Pool, Error> {
        let pool = Pool::new(config, dialer)?;
        pool.warm_up().await?;
        Ok(pool)
    }

    /// Dials `initial_pool_size` connections into the idle set.
    ///
    /// Stops at the first dial failure and returns it; connections created before the failure
    /// stay in the pool and remain usable.
    pub async fn warm_up(&self) -> Result<usize, Error> {
        let mut created = 0;

        for _ in 0..self.inner.config.initial_pool_size {
            if !self.inner.reserve() {
                break;
            }

            let conn = match self.inner.dial().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.inner.release_slot();
                    warn!(created, "pool warm-up failed: {}", e);
                    return Err(e);
                }
            };

            if let Err(conn) = self.inner.push_idle(conn) {
                self.inner.release_slot();
                close_stream(conn.stream).await;
                return Err(Error::PoolClosed);
            }
            created += 1;
        }

        info!(created, address = %self.inner.config.address, "connection pool warmed up");
        Ok(created)
    }

    /// Leases a connection, waiting up to the configured pool timeout for one to become available
    /// when the pool is at capacity.
    pub async fn acquire(&self) -> Result<PooledConnection, Error> {
        let deadline = Instant::now() + self.inner.config.wait_timeout();

        loop {
            // Register interest before checking, so a release in between is not missed.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire().await {
                Err(Error::PoolExhausted) => {}
                result => return result,
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                debug!("timed out waiting for a backend connection");
                return Err(Error::PoolExhausted);
            }
        }
    }

    /// Leases a connection without waiting: reuses the most recently released idle connection,
    /// dials a new one if below capacity, and fails with [`Error::PoolExhausted`] otherwise.
    pub async fn try_acquire(&self) -> Result<PooledConnection, Error> {
        if self.inner.is_closed() {
            return Err(Error::PoolClosed);
        }

        let conn = match self.inner.pop_idle() {
            Some(conn) => conn,
            None => {
                if !self.inner.reserve() {
                    return Err(Error::PoolExhausted);
                }
                match self.inner.dial().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.inner.release_slot();
                        return Err(e);
                    }
                }
            }
        };

        match self.inner.lease(conn) {
            Ok(leased) => {
                debug!(id = leased.id(), "leased backend connection");
                Ok(leased)
            }
            Err(conn) => {
                self.inner.release_slot();
                close_stream(conn.stream).await;
                Err(Error::PoolClosed)
            }
        }
    }

    /// Returns a leased connection to the idle set and refreshes its last use time.
    pub fn release(&self, mut leased: PooledConnection) -> Result<(), Error> {
        if !leased.is_from(&self.inner) {
            return Err(Error::NotLeased);
        }
        let mut conn = match leased.conn.take() {
            Some(conn) => conn,
            None => return Err(Error::NotLeased),
        };

        let leased_at = self.inner.leased.lock().unwrap().remove(&conn.id);
        let leased_at = match leased_at {
            Some(leased_at) => leased_at,
            None if self.inner.is_closed() => return Err(Error::PoolClosed),
            None => return Err(Error::NotLeased),
        };

        let id = conn.id;
        conn.last_used = Instant::now();
        if self.inner.push_idle(conn).is_err() {
            self.inner.release_slot();
            return Err(Error::PoolClosed);
        }

        debug!(id, leased_for = ?leased_at.elapsed(), "released backend connection");
        Ok(())
    }

    /// Closes a leased connection and frees its slot. Used when the connection's protocol state
    /// can no longer be trusted.
    pub async fn remove(&self, mut leased: PooledConnection) -> Result<(), Error> {
        if !leased.is_from(&self.inner) {
            return Err(Error::NotLeased);
        }
        let conn = match leased.conn.take() {
            Some(conn) => conn,
            None => return Err(Error::NotLeased),
        };

        let was_leased = self.inner.forget(conn.id);
        debug!(id = conn.id, age = ?conn.created_at.elapsed(), "removing backend connection");
        close_stream(conn.stream).await;

        match was_leased {
            true => Ok(()),
            false if self.inner.is_closed() => Err(Error::PoolClosed),
            false => Err(Error::NotLeased),
        }
    }

    /// Closes every connection and stops the reaper. Leased connections are signalled through
    /// [`PooledConnection::closed`] and are closed by their holders.
    pub async fn close(&self) -> Result<(), Error> {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyClosed);
        }

        self.inner.shutdown.cancel();

        let (leased, idle) = {
            let mut leased = self.inner.leased.lock().unwrap();
            let mut idle = self.inner.idle.lock().unwrap();
            (std::mem::take(&mut *leased), std::mem::take(&mut *idle))
        };

        self.inner
            .total
            .fetch_sub(leased.len() + idle.len(), Ordering::SeqCst);
        self.inner.available.notify_waiters();

        info!(
            idle = idle.len(),
            leased = leased.len(),
            "closing connection pool"
        );

        for conn in idle {
            close_stream(conn.stream).await;
        }

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of open connections, idle and leased, including ones being dialed.
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().unwrap().len();
        let leased = self.inner.leased.lock().unwrap().len();

        PoolStats {
            idle,
            leased,
            total: self.total(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

async fn close_stream(mut stream: BackendStream) {
    match time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("error shutting down backend connection: {}", e),
        Err(_) => debug!("timed out shutting down backend connection"),
    }
}

/// Periodically closes idle connections that outlived the idle timeout. Leased connections are
/// never touched. Exits once the pool is closed or dropped.
async fn reap_idle_connections(pool: Weak<Inner>, shutdown: CancellationToken, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let expired = match pool.upgrade() {
            Some(inner) => inner.remove_expired(),
            None => break,
        };

        for conn in expired {
            debug!(id = conn.id, idle_for = ?conn.last_used.elapsed(), "evicting idle connection");
            close_stream(conn.stream).await;
        }
    }

    debug!("idle reaper stopped");
}
