//! Reconnect-and-rebuild on top of plain pools.
//!
//! [`RecoveryManager`] predates validation inside the pool: it borrows without trusting the
//! result, checks a separate canary connection when a borrow fails, and tears the pool down
//! and builds it again when both look dead. New code should prefer a [`Pool`] with
//! `test_on_borrow` and the evictor. This stays for callers that want the escalation.
//!
//! Per borrow:
//!
//! 1. build the pool of that type if there is none yet
//! 2. borrow, bounded by the borrow timeout
//! 3. no connection: if the canary answers, the pool is fine and the caller gets
//!    [`PoolError::Connect`]. Otherwise rebuild the pool and borrow again, failing with
//!    [`PoolError::LdapTimeout`]
//! 4. a connection that reports itself closed is replaced in place by a fresh one from the
//!    factory. If that fails, rebuild as above, failing with [`PoolError::ServerDown`]
//! 5. any other error gets one more borrow before it is returned
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::config::{Config, PoolConfig};
use crate::connection::{ConnectionFactory, LdapConnector};
use crate::credentials;
use crate::error::{PoolError, Result};
use crate::pool::{Pool, PooledConnection};
use crate::types::PoolType;

struct Slot<F: ConnectionFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    pool: parking_lot::Mutex<Option<Pool<F>>>,
    // serializes building and rebuilding
    rebuild: tokio::sync::Mutex<()>,
    canary: tokio::sync::Mutex<Option<F::Connection>>,
}

pub struct RecoveryManager<F: ConnectionFactory = LdapConnector> {
    slots: HashMap<PoolType, Slot<F>>,
    borrow_timeout: Duration,
    recoveries: AtomicU32,
}

impl RecoveryManager<LdapConnector> {
    /// Registers admin and user pools, and the log pool when its account is configured.
    /// Credentials are resolved here, once.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let cipher = config.cipher()?;
        let endpoint = config.endpoint()?;
        let mut manager = Self::new(config.recovery.borrow_timeout());

        let admin = credentials::resolve("admin", &config.admin.credential, cipher.as_ref())?;
        manager.register(
            PoolType::Admin,
            LdapConnector::new(endpoint.clone(), Some(admin))?,
            config.pool_config(PoolType::Admin),
        );

        manager.register(
            PoolType::User,
            LdapConnector::new(endpoint.clone(), None)?,
            config.pool_config(PoolType::User),
        );

        if let Some(log) = &config.log_service {
            let identity = credentials::resolve("log_service", &log.credential, cipher.as_ref())?;
            manager.register(
                PoolType::Log,
                LdapConnector::new(endpoint, Some(identity))?,
                config.pool_config(PoolType::Log),
            );
        }

        Ok(manager)
    }
}

impl<F: ConnectionFactory> RecoveryManager<F> {
    pub fn new(borrow_timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            borrow_timeout,
            recoveries: AtomicU32::new(0),
        }
    }

    /// Sets up `pool_type`. The pool itself is built on first use. Reconnects go through
    /// the same factory, so they bind with the identity the factory was given.
    pub fn register(&mut self, pool_type: PoolType, factory: F, config: PoolConfig) {
        self.slots.insert(
            pool_type,
            Slot {
                factory: Arc::new(factory),
                config,
                pool: parking_lot::Mutex::new(None),
                rebuild: tokio::sync::Mutex::new(()),
                canary: tokio::sync::Mutex::new(None),
            },
        );
    }

    /// How many times a pool was torn down and built again.
    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::SeqCst)
    }

    fn slot(&self, pool_type: PoolType) -> Result<&Slot<F>> {
        match self.slots.get(&pool_type) {
            Some(slot) => Ok(slot),
            None if pool_type == PoolType::Log => Err(PoolError::LogPoolDisabled),
            None => Err(PoolError::config(format!("no {pool_type} pool registered"))),
        }
    }

    pub async fn get_connection(&self, pool_type: PoolType) -> Result<PooledConnection<F>> {
        let slot = self.slot(pool_type)?;
        let pool = self.pool(slot, pool_type).await?;

        match self.borrow(&pool).await {
            Ok(mut conn) => {
                if !slot.factory.is_closed(&mut conn) {
                    return Ok(conn);
                }

                warn!("{pool_type}: borrowed connection {} is closed, reconnecting", conn.id());
                match slot.factory.connect().await {
                    Ok(fresh) => {
                        conn.replace(fresh);
                        Ok(conn)
                    }
                    Err(e) => {
                        warn!("{pool_type}: reconnect failed: {e}");
                        drop(conn);
                        let pool = self.recover(slot, pool_type, &pool).await?;
                        self.borrow(&pool).await.map_err(|e| {
                            error!("{pool_type}: still no connection after recovery: {e}");
                            PoolError::ServerDown {
                                pool: pool_type,
                                endpoint: slot.factory.endpoint().to_string(),
                            }
                        })
                    }
                }
            }
            Err(e) if e.is_transport() => {
                if self.canary_alive(slot).await {
                    debug!("{pool_type}: canary answers, not rebuilding the pool");
                    let endpoint = slot.factory.endpoint().to_string();
                    return Err(PoolError::connect(endpoint, e).in_pool(pool_type.as_str()));
                }

                warn!("{pool_type}: canary is dead too, rebuilding the pool");
                let pool = self.recover(slot, pool_type, &pool).await?;
                self.borrow(&pool).await.map_err(|e| {
                    error!("{pool_type}: still no connection after recovery: {e}");
                    PoolError::LdapTimeout {
                        pool: pool_type,
                        endpoint: slot.factory.endpoint().to_string(),
                    }
                })
            }
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                debug!("{pool_type}: borrow failed ({e}), trying once more");
                let pool = self.pool(slot, pool_type).await?;
                self.borrow(&pool).await
            }
        }
    }

    /// Returns a connection. Connections of a pool that was rebuilt meanwhile are simply
    /// closed.
    pub fn release(&self, conn: PooledConnection<F>, pool_type: PoolType) -> Result<()> {
        let slot = self.slot(pool_type)?;
        let current = slot.pool.lock().clone();

        match current {
            Some(pool) if pool.id() == conn.pool_id() => pool.release(conn),
            _ if conn.pool_closed() => {
                debug!("{pool_type}: connection {} outlived its pool", conn.id());
                drop(conn);
                Ok(())
            }
            Some(pool) => pool.release(conn),
            None => Err(PoolError::UnknownConnectionReleased(conn.id())),
        }
    }

    /// Destroys every pool and closes the canaries.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_err = None;

        for (pool_type, slot) in &self.slots {
            let _guard = slot.rebuild.lock().await;
            let pool = slot.pool.lock().take();
            if let Some(pool) = pool {
                if let Err(e) = pool.destroy().await {
                    error!("failed to close {pool_type} pool: {e}");
                    first_err.get_or_insert(e);
                }
            }

            let canary = slot.canary.lock().await.take();
            if let Some(canary) = canary {
                if let Err(e) = slot.factory.close(canary).await {
                    debug!("{pool_type}: error closing canary: {e}");
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn pool(&self, slot: &Slot<F>, pool_type: PoolType) -> Result<Pool<F>> {
        let current = slot.pool.lock().clone();
        if let Some(pool) = current {
            return Ok(pool);
        }

        let _guard = slot.rebuild.lock().await;
        let current = slot.pool.lock().clone();
        if let Some(pool) = current {
            return Ok(pool);
        }

        let pool = Pool::new(pool_type.as_str(), slot.factory.clone(), slot.config.clone()).await?;
        *slot.pool.lock() = Some(pool.clone());
        Ok(pool)
    }

    async fn borrow(&self, pool: &Pool<F>) -> Result<PooledConnection<F>> {
        match time::timeout(self.borrow_timeout, pool.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::PoolExhausted {
                pool: pool.name().to_owned(),
                endpoint: pool.factory().endpoint().to_string(),
                waited: self.borrow_timeout,
            }),
        }
    }

    /// Destroys `stale` and puts a new pool in its place. If another caller already did so,
    /// its pool is used instead.
    async fn recover(&self, slot: &Slot<F>, pool_type: PoolType, stale: &Pool<F>) -> Result<Pool<F>> {
        let _guard = slot.rebuild.lock().await;

        let current = slot.pool.lock().clone();
        if let Some(current) = current {
            if current.id() != stale.id() {
                debug!("{pool_type} pool already rebuilt");
                return Ok(current);
            }
        }

        if let Err(e) = stale.destroy().await {
            warn!("{pool_type}: error destroying pool during recovery: {e}");
        }
        self.recoveries.fetch_add(1, Ordering::SeqCst);

        let pool = Pool::new(pool_type.as_str(), slot.factory.clone(), slot.config.clone()).await?;
        *slot.pool.lock() = Some(pool.clone());
        info!("{pool_type} pool rebuilt for {}", slot.factory.endpoint());
        Ok(pool)
    }

    /// Checks the canary, opening one if there is none. A canary that fails is dropped so
    /// the next check starts fresh.
    async fn canary_alive(&self, slot: &Slot<F>) -> bool {
        let mut canary = slot.canary.lock().await;

        if let Some(conn) = canary.as_mut() {
            match slot.factory.validate(conn).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!("canary for {} failed: {e}", slot.factory.endpoint());
                    *canary = None;
                    return false;
                }
            }
        }

        match slot.factory.connect().await {
            Ok(conn) => {
                *canary = Some(conn);
                true
            }
            Err(e) => {
                debug!("cannot open canary for {}: {e}", slot.factory.endpoint());
                false
            }
        }
    }
}
