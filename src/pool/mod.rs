//! 连接池
//!
//! A bounded set of [`Connection`]s for one named target. Borrowing hands out a
//! [`PooledConnection`] lease that returns the connection on drop, so every successful
//! [`Pool::acquire`] is matched by exactly one release on every exit path.
//!
//! Sizing: a semaphore with `max_connections` permits bounds how many leases exist;
//! the idle list and the active count live behind one mutex that is never held across
//! an `.await`, so `idle + active <= max_connections` holds at every instant.

pub mod connection;

pub use connection::{Connection, ConnectionState, ReconnectPolicy};

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::DbError;
use crate::models::db_config::PoolConfig;
use crate::udbc::Driver;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub idle: usize,
    pub active: usize,
    pub max: usize,
}

#[derive(Default)]
struct Slots {
    idle: VecDeque<Connection>,
    active: usize,
}

struct PoolInner {
    name: String,
    config: Arc<PoolConfig>,
    driver: Arc<dyn Driver>,
    policy: ReconnectPolicy,
    permits: Arc<Semaphore>,
    slots: Mutex<Slots>,
    closed: AtomicBool,
}

/// 数据库连接池
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Pool {
    pub async fn new(
        name: &str,
        config: PoolConfig,
        driver: Arc<dyn Driver>,
    ) -> Result<Self, DbError> {
        Self::with_policy(name, config, driver, ReconnectPolicy::default()).await
    }

    /// Creates the pool and eagerly opens `min_connections` connections.
    ///
    /// Fatal failures abort construction. Connectivity failures only leave the pool
    /// with fewer warm connections; later acquisitions connect on demand.
    pub async fn with_policy(
        name: &str,
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        policy: ReconnectPolicy,
    ) -> Result<Self, DbError> {
        config.validate()?;
        let max = config.pool.max_connections;
        let inner = Arc::new(PoolInner {
            name: name.to_string(),
            config: Arc::new(config),
            driver,
            policy,
            permits: Arc::new(Semaphore::new(max)),
            slots: Mutex::new(Slots::default()),
            closed: AtomicBool::new(false),
        });

        for _ in 0..inner.config.pool.min_connections {
            match inner.open().await {
                Ok(conn) => inner.lock().idle.push_back(conn),
                Err(e) if e.is_retryable() => {
                    warn!(pool = %inner.name, error = %e, "could not pre-open connection");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(every) = inner.config.pool.heartbeat() {
            tokio::spawn(heartbeat(Arc::downgrade(&inner), every));
        }

        let pool = Self { inner };
        info!(pool = %pool.name(), state = ?pool.state(), "mongodb pool created");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PoolState {
        let slots = self.inner.lock();
        PoolState {
            idle: slots.idle.len(),
            active: slots.active,
            max: self.inner.config.pool.max_connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same pool instance.
    pub fn same_pool(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrows a connection, waiting up to `wait_timeout` for one to become available.
    ///
    /// Idle connections are probed before they are handed out; one that fails the probe
    /// is discarded and acquisition continues with the next idle connection or a new one.
    pub async fn acquire(&self) -> Result<PooledConnection, DbError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(DbError::Connectivity(format!("pool `{}` is closed", inner.name)));
        }
        let wait = inner.config.pool.wait_timeout();
        let permit = match tokio::time::timeout(wait, inner.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(DbError::Connectivity(format!("pool `{}` is closed", inner.name)));
            }
            Err(_) => {
                return Err(DbError::PoolExhausted(format!(
                    "no connection available in pool `{}` within {:?} (max_connections = {})",
                    inner.name, wait, inner.config.pool.max_connections
                )));
            }
        };

        let (slot, mut candidate) = Slot::reserve(inner);
        loop {
            let Some(mut conn) = candidate.take() else {
                let conn = inner.open().await?;
                return Ok(slot.lease(conn, permit));
            };
            if inner.expired(&conn) {
                debug!(pool = %inner.name, id = conn.id(), "closing expired idle connection");
                conn.close();
            } else {
                match conn.check().await {
                    Ok(true) => return Ok(slot.lease(conn, permit)),
                    Ok(false) => conn.close(),
                    Err(e) if e.is_retryable() => {
                        warn!(pool = %inner.name, id = conn.id(), error = %e, "discarding dead connection");
                        conn.close();
                    }
                    Err(e) => {
                        conn.close();
                        return Err(e);
                    }
                }
            }
            candidate = inner.lock().idle.pop_back();
        }
    }

    /// Probes idle connections once: expired ones are closed, dead ones discarded.
    pub async fn sweep_idle(&self) {
        self.inner.sweep_idle().await
    }

    /// Closes every idle connection and refuses further acquisitions. Leases still out
    /// are closed when they come back.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let drained: Vec<Connection> = self.inner.lock().idle.drain(..).collect();
        for mut conn in drained {
            conn.close();
        }
        info!(pool = %self.inner.name, "mongodb pool closed");
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self) -> Result<Connection, DbError> {
        Connection::connect(&self.name, self.driver.clone(), self.config.clone(), self.policy).await
    }

    fn expired(&self, conn: &Connection) -> bool {
        let max_idle = self.config.pool.max_idle_time();
        !max_idle.is_zero() && conn.idle_for() > max_idle
    }

    fn release(&self, mut conn: Connection) {
        conn.touch();
        let mut retired = Vec::new();
        {
            let mut slots = self.lock();
            slots.active = slots.active.saturating_sub(1);
            if conn.is_closed() || self.closed.load(Ordering::Acquire) {
                retired.push(conn);
            } else {
                conn.set_state(ConnectionState::Idle);
                slots.idle.push_back(conn);
            }
            while slots.idle.front().is_some_and(|c| self.expired(c)) {
                retired.extend(slots.idle.pop_front());
            }
        }
        for mut conn in retired {
            conn.close();
        }
    }

    /// Puts probed connections back without refreshing their idle clock. The idle list
    /// stays ordered oldest first.
    fn restore(&self, conns: Vec<Connection>, taken: usize) {
        let mut retired = Vec::new();
        {
            let mut slots = self.lock();
            slots.active = slots.active.saturating_sub(taken);
            for conn in conns {
                if conn.is_closed() || self.closed.load(Ordering::Acquire) || self.expired(&conn) {
                    retired.push(conn);
                    continue;
                }
                let at = slots
                    .idle
                    .iter()
                    .position(|c| c.last_used_at() > conn.last_used_at())
                    .unwrap_or(slots.idle.len());
                slots.idle.insert(at, conn);
            }
        }
        for mut conn in retired {
            conn.close();
        }
    }

    /// Probes every idle connection once: expired ones are closed, dead ones discarded.
    async fn sweep_idle(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(mut batch) = Probe::take(self) else {
            return;
        };
        for conn in batch.conns.iter_mut() {
            if self.expired(conn) {
                debug!(pool = %self.name, id = conn.id(), "closing expired idle connection");
                conn.close();
                continue;
            }
            match conn.check().await {
                Ok(true) => {}
                Ok(false) => conn.close(),
                Err(e) => {
                    warn!(pool = %self.name, id = conn.id(), error = %e, "idle connection failed heartbeat");
                    conn.close();
                }
            }
        }
    }
}

/// Idle connections taken out for a heartbeat probe. Each one holds a permit and counts
/// as active while out, so the size bound holds. Dropping the batch puts them back.
struct Probe {
    pool: Arc<PoolInner>,
    conns: Vec<Connection>,
    taken: usize,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl Probe {
    fn take(pool: &Arc<PoolInner>) -> Option<Self> {
        let wanted = pool.lock().idle.len();
        let mut permits = Vec::with_capacity(wanted);
        while permits.len() < wanted {
            match pool.permits.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        let conns: Vec<Connection> = {
            let mut slots = pool.lock();
            let n = permits.len().min(slots.idle.len());
            slots.active += n;
            slots.idle.drain(..n).collect()
        };
        if conns.is_empty() {
            return None;
        }
        permits.truncate(conns.len());
        Some(Self {
            pool: pool.clone(),
            taken: conns.len(),
            conns,
            _permits: permits,
        })
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.pool.restore(std::mem::take(&mut self.conns), self.taken);
    }
}

async fn heartbeat(pool: Weak<PoolInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        inner.sweep_idle().await;
    }
}

/// An active-count reservation. Dropping it unreleased gives the slot back.
struct Slot {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Slot {
    /// Counts one more active connection and, in the same critical section, takes the
    /// most recently used idle connection if there is one.
    fn reserve(pool: &Arc<PoolInner>) -> (Self, Option<Connection>) {
        let candidate = {
            let mut slots = pool.lock();
            slots.active += 1;
            slots.idle.pop_back()
        };
        let slot = Self {
            pool: pool.clone(),
            armed: true,
        };
        (slot, candidate)
    }

    fn lease(mut self, mut conn: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
        self.armed = false;
        conn.set_state(ConnectionState::Borrowed);
        conn.touch();
        PooledConnection {
            conn: Some(conn),
            pool: self.pool.clone(),
            _permit: permit,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.pool.lock();
            slots.active = slots.active.saturating_sub(1);
        }
    }
}

/// A borrowed connection. Goes back to its pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Returns the connection to the pool now rather than at end of scope.
    pub fn release(self) {}

    /// Closes the connection instead of returning it for reuse, e.g. after a timed-out call.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close();
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
