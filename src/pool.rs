//! A bounded pool of connections to a single directory endpoint.
//!
//! Borrowed connections come back to the pool when the [`PooledConnection`] is dropped or
//! handed to [`Pool::release`]. Returning never fails the caller: anything that goes wrong on
//! the way back is logged and the connection is thrown away.
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::{PoolConfig, WhenExhausted};
use crate::connection::ConnectionFactory;
use crate::error::{PoolError, Result};
use crate::ha::LeaseTable;
use crate::types::{next_pool_id, ConnectionId, PoolStatus};

/// The acquire/release/destroy contract shared by the single-endpoint and the
/// multi-node pool.
#[async_trait]
pub trait ConnectionSource<F: ConnectionFactory>: Send + Sync {
    async fn acquire(&self) -> Result<PooledConnection<F>>;

    /// Hands a connection back. Fails only if it was not borrowed from here.
    fn release(&self, conn: PooledConnection<F>) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    fn status(&self) -> PoolStatus;

    fn name(&self) -> &str;
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

impl<C> Idle<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            since: Instant::now(),
        }
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    id: u64,
    name: String,
    factory: Arc<F>,
    config: PoolConfig,
    idle: Mutex<VecDeque<Idle<F::Connection>>>,
    // one permit per connection that may be lent out at the same time
    permits: Arc<Semaphore>,
    // idle + lent out + being opened
    live: AtomicU32,
    in_use: AtomicU32,
    next_seq: AtomicU64,
    closed: AtomicBool,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

/// A pool of connections to one endpoint.
///
/// Cloning is cheap, clones share the same connections.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Builds the pool and opens `min_idle` connections. Failing to open them is logged,
    /// not fatal: the evictor and later borrows keep trying.
    pub async fn new(name: impl Into<String>, factory: Arc<F>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            id: next_pool_id(),
            name: name.into(),
            factory,
            permits: Arc::new(Semaphore::new(config.max_total as usize)),
            config,
            idle: Mutex::new(VecDeque::new()),
            live: AtomicU32::new(0),
            in_use: AtomicU32::new(0),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            evictor: Mutex::new(None),
        });

        inner.replenish().await;

        if let Some(every) = inner.config.time_between_eviction_runs {
            let handle = spawn_evictor(&inner, every);
            *inner.evictor.lock() = Some(handle);
        }

        info!(
            "{} pool ready: {} (min idle {}, max {})",
            inner.name,
            inner.factory.endpoint(),
            inner.config.min_idle,
            inner.config.max_total
        );

        Ok(Self { inner })
    }

    /// Borrows a connection, waiting at most the configured `max_wait` when the pool is
    /// exhausted and set to block.
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        self.acquire_timeout(self.inner.config.max_wait).await
    }

    /// Like [`Pool::acquire`] with an explicit wait.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<PooledConnection<F>> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(inner.closed_error());
        }

        let permit = match inner.config.when_exhausted {
            WhenExhausted::Block => {
                match time::timeout(wait, inner.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(inner.closed_error()),
                    Err(_) => return Err(inner.exhausted(wait)),
                }
            }
            WhenExhausted::Fail => match inner.permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::Closed) => return Err(inner.closed_error()),
                Err(TryAcquireError::NoPermits) => return Err(inner.exhausted(Duration::ZERO)),
            },
            WhenExhausted::Grow => match inner.permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::Closed) => return Err(inner.closed_error()),
                Err(TryAcquireError::NoPermits) => {
                    debug!(
                        "{} pool exhausted, opening a connection beyond the maximum of {}",
                        inner.name, inner.config.max_total
                    );
                    None
                }
            },
        };

        let conn = inner.checkout().await?;
        Ok(PooledConnection::new(inner.clone(), conn, permit))
    }

    /// Returns a connection. Connections borrowed from another pool are still sent home, but
    /// the call reports the mix-up.
    pub fn release(&self, conn: PooledConnection<F>) -> Result<()> {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            let id = conn.id;
            error!("{} pool asked to release connection {id} it never lent out", self.inner.name);
            drop(conn);
            return Err(PoolError::UnknownConnectionReleased(id));
        }
        drop(conn);
        Ok(())
    }

    /// Closes every idle connection and refuses further borrows. Connections still lent out
    /// are closed as they come back.
    pub async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        inner.permits.close();
        if let Some(evictor) = inner.evictor.lock().take() {
            evictor.abort();
        }

        let drained: Vec<_> = inner.idle.lock().drain(..).collect();
        let count = drained.len();
        let mut first_err = None;
        for idle in drained {
            inner.live.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = inner.factory.close(idle.conn).await {
                warn!("{} pool: error closing connection: {e}", inner.name);
                first_err.get_or_insert(e);
            }
        }

        info!(
            "{} pool destroyed, closed {count} idle connections, {} still lent out",
            inner.name,
            inner.in_use.load(Ordering::SeqCst)
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifies this pool instance; a rebuilt pool gets a new one.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Runs one eviction pass now instead of waiting for the evictor.
    pub async fn evict(&self) {
        self.inner.evict().await;
    }
}

#[async_trait]
impl<F: ConnectionFactory> ConnectionSource<F> for Pool<F> {
    async fn acquire(&self) -> Result<PooledConnection<F>> {
        Pool::acquire(self).await
    }

    fn release(&self, conn: PooledConnection<F>) -> Result<()> {
        Pool::release(self, conn)
    }

    async fn destroy(&self) -> Result<()> {
        Pool::destroy(self).await
    }

    fn status(&self) -> PoolStatus {
        Pool::status(self)
    }

    fn name(&self) -> &str {
        Pool::name(self)
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            pool: self.name.clone(),
        }
    }

    fn exhausted(&self, waited: Duration) -> PoolError {
        PoolError::PoolExhausted {
            pool: self.name.clone(),
            endpoint: self.factory.endpoint().to_string(),
            waited,
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            idle: self.idle.lock().len() as u32,
            in_use: self.in_use.load(Ordering::SeqCst),
            max: self.config.max_total,
        }
    }

    /// Reserves room for one more connection if the pool is below its maximum.
    fn try_reserve(&self) -> bool {
        let max = self.config.max_total;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Finds a usable connection: the most recently returned idle one that passes
    /// validation, or a new one.
    async fn checkout(&self) -> Result<F::Connection> {
        loop {
            let candidate = self.idle.lock().pop_back();
            let Some(Idle { mut conn, .. }) = candidate else {
                break;
            };

            if !self.config.test_on_borrow {
                return Ok(conn);
            }

            match self.factory.validate(&mut conn).await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    warn!("{} pool: idle connection failed validation, discarding: {e}", self.name);
                    self.discard(conn).await;
                }
            }
        }

        self.open().await
    }

    async fn open(&self) -> Result<F::Connection> {
        self.live.fetch_add(1, Ordering::SeqCst);

        let opened = async {
            let mut conn = self.factory.connect().await.map_err(|e| e.in_pool(&self.name))?;
            if self.config.test_on_borrow {
                self.factory.validate(&mut conn).await?;
            }
            Ok(conn)
        }
        .await;

        if let Err(ref e) = opened {
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!("{} pool: cannot open connection: {e}", self.name);
        }

        opened
    }

    async fn discard(&self, conn: F::Connection) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = self.factory.close(conn).await {
            warn!("{} pool: error closing discarded connection: {e}", self.name);
        }
    }

    /// The way back from a [`PooledConnection`]. Runs inside `Drop`, so nothing here may
    /// block or fail.
    fn give_back(&self, mut conn: F::Connection, permit: Option<OwnedSemaphorePermit>) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);

        let reason = if self.is_closed() {
            Some("pool is closed")
        } else if permit.is_none() {
            Some("overflow connection")
        } else if self.live.load(Ordering::SeqCst) > self.config.max_total {
            Some("pool is above its maximum")
        } else if self.factory.is_closed(&mut conn) {
            warn!("{} pool: returned connection is closed, discarding it", self.name);
            Some("connection closed")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!("{} pool: dropping returned connection ({reason})", self.name);
                self.live.fetch_sub(1, Ordering::SeqCst);
                self.close_detached(conn);
            }
            None => self.idle.lock().push_back(Idle::new(conn)),
        }

        // only now, so a waiter woken by the permit finds the connection idle
        drop(permit);
    }

    fn close_detached(&self, conn: F::Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let factory = self.factory.clone();
                let name = self.name.clone();
                handle.spawn(async move {
                    if let Err(e) = factory.close(conn).await {
                        warn!("{name} pool: error closing returned connection: {e}");
                    }
                });
            }
            Err(_) => drop(conn),
        }
    }

    /// Opens connections until `min_idle` are idle or the pool is full.
    async fn replenish(&self) {
        while !self.is_closed() {
            let idle = self.idle.lock().len() as u32;
            if idle >= self.config.min_idle || !self.try_reserve() {
                break;
            }
            match self.factory.connect().await {
                Ok(conn) => self.idle.lock().push_back(Idle::new(conn)),
                Err(e) => {
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    warn!("{} pool: cannot open idle connection: {e}", self.name);
                    break;
                }
            }
        }
    }

    /// One eviction pass. Looks at the connections idle when the pass starts, one at a time,
    /// so the others stay available to borrowers meanwhile.
    async fn evict(&self) {
        let mut evicted = 0;
        let pending = self.idle.lock().len();

        for _ in 0..pending {
            let entry = self.idle.lock().pop_front();
            let Some(mut entry) = entry else {
                break;
            };

            // the one we hold counts as idle
            let idle_now = self.idle.lock().len() as u32 + 1;
            if entry.since.elapsed() >= self.config.min_evictable_idle
                && idle_now > self.config.min_idle
            {
                debug!("{} pool: evicting connection idle for {:?}", self.name, entry.since.elapsed());
                self.discard(entry.conn).await;
                evicted += 1;
                continue;
            }

            if self.config.test_while_idle {
                if let Err(e) = self.factory.validate(&mut entry.conn).await {
                    warn!("{} pool: idle connection failed validation, evicting: {e}", self.name);
                    self.discard(entry.conn).await;
                    evicted += 1;
                    continue;
                }
            }

            if self.is_closed() {
                self.discard(entry.conn).await;
                return;
            }
            self.idle.lock().push_back(entry);
        }

        if evicted > 0 {
            debug!("{} pool: evicted {evicted} connections", self.name);
        }

        self.replenish().await;
    }
}

fn spawn_evictor<F: ConnectionFactory>(inner: &Arc<PoolInner<F>>, every: Duration) -> JoinHandle<()> {
    let pool: Weak<PoolInner<F>> = Arc::downgrade(inner);

    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = pool.upgrade() else {
                break;
            };
            if inner.is_closed() {
                break;
            }
            inner.evict().await;
        }
    })
}

/// A borrowed connection. Derefs to the underlying connection and goes back to its pool
/// when dropped.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    id: ConnectionId,
    pool: Arc<PoolInner<F>>,
    permit: Option<OwnedSemaphorePermit>,
    lease: Option<Arc<LeaseTable>>,
    borrowed_at: Instant,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: Arc<PoolInner<F>>, conn: F::Connection, permit: Option<OwnedSemaphorePermit>) -> Self {
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        let seq = pool.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId::new(pool.id, seq);
        trace!("{} pool: lending out connection {id}", pool.name);

        Self {
            conn: Some(conn),
            id,
            pool,
            permit,
            lease: None,
            borrowed_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the pool this connection belongs to.
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    /// Whether the owning pool has been destroyed since the borrow.
    pub fn pool_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn held_for(&self) -> Duration {
        self.borrowed_at.elapsed()
    }

    /// Swaps in a freshly opened connection, the old one is dropped.
    pub fn replace(&mut self, conn: F::Connection) {
        self.conn = Some(conn);
    }

    pub(crate) fn track(&mut self, leases: Arc<LeaseTable>) {
        self.lease = Some(leases);
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        self.conn.as_ref().expect("connection is present until dropped")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.conn.as_mut().expect("connection is present until dropped")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(leases) = self.lease.take() {
            leases.forget(self.id);
        }
        if let Some(conn) = self.conn.take() {
            trace!("{} pool: connection {} returned after {:?}", self.pool.name, self.id, self.held_for());
            self.pool.give_back(conn, self.permit.take());
        }
    }
}
