//! Task-scoped connection binding.
//!
//! [`bind`] leases one connection for the whole of a future and publishes it in a
//! task-local map, so that every collection operation awaited inside that future reuses
//! it instead of borrowing again. The lease is released when the future completes or is
//! dropped. Outside a binding, [`resolve`] borrows a fresh connection that the caller
//! releases when it drops the returned [`ConnectionRef`]. A connection object is never
//! remembered past the point where it went back to its pool.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task_local;

use crate::error::DbError;
use crate::pool::{Connection, Pool, PooledConnection};

#[derive(Clone)]
struct Binding {
    pool: Pool,
    lease: Arc<Mutex<PooledConnection>>,
}

#[derive(Clone, Default)]
struct Bindings {
    by_pool: HashMap<String, Binding>,
}

impl Bindings {
    fn find(&self, pool: &Pool) -> Option<Arc<Mutex<PooledConnection>>> {
        self.by_pool
            .get(pool.name())
            .filter(|b| b.pool.same_pool(pool))
            .map(|b| b.lease.clone())
    }
}

task_local! {
    /// 当前任务绑定的连接
    static BINDINGS: Bindings;
}

/// Runs `fut` with one connection of `pool` bound to the current task.
///
/// Nested calls for a pool that is already bound reuse the outer lease.
pub async fn bind<F>(pool: &Pool, fut: F) -> Result<F::Output, DbError>
where
    F: Future,
{
    let current = BINDINGS.try_with(|b| b.clone()).unwrap_or_default();
    if current.find(pool).is_some() {
        return Ok(fut.await);
    }
    let lease = pool.acquire().await?;
    let mut bindings = current;
    bindings.by_pool.insert(
        pool.name().to_string(),
        Binding {
            pool: pool.clone(),
            lease: Arc::new(Mutex::new(lease)),
        },
    );
    Ok(BINDINGS.scope(bindings, fut).await)
}

/// Whether the current task holds a bound connection for `pool`.
pub fn is_bound(pool: &Pool) -> bool {
    BINDINGS
        .try_with(|b| b.find(pool).is_some())
        .unwrap_or(false)
}

/// The connection an operation should use: the task's bound one, or a fresh lease.
pub async fn resolve(pool: &Pool) -> Result<ConnectionRef, DbError> {
    let bound = BINDINGS.try_with(|b| b.find(pool)).ok().flatten();
    match bound {
        Some(lease) => Ok(ConnectionRef::Bound(lease.lock_owned().await)),
        None => Ok(ConnectionRef::Leased(pool.acquire().await?)),
    }
}

/// A connection in use by one operation. Dropping it ends the operation's use:
/// a fresh lease goes back to the pool, a bound one stays with its task.
pub enum ConnectionRef {
    Bound(OwnedMutexGuard<PooledConnection>),
    Leased(PooledConnection),
}

impl ConnectionRef {
    pub fn is_bound(&self) -> bool {
        matches!(self, ConnectionRef::Bound(_))
    }
}

impl Deref for ConnectionRef {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            ConnectionRef::Bound(guard) => &***guard,
            ConnectionRef::Leased(lease) => &**lease,
        }
    }
}
