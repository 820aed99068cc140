//! The three logical pools behind one handle.
//!
//! A [`PoolManager`] is built from a [`Config`] and shared (usually as `Arc<PoolManager>`)
//! by everything that talks to the directory. Nothing connects until the first borrow or an
//! explicit [`PoolManager::init`]; concurrent first callers wait for the same construction.
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{Config, Endpoint, PoolConfig};
use crate::connection::{ConnectionFactory, LdapConnector};
use crate::credentials::{self, BindIdentity};
use crate::error::{PoolError, Result};
use crate::ha::HaPool;
use crate::pool::{ConnectionSource, Pool, PooledConnection};
use crate::types::{PoolStatus, PoolType};

type MakeFactory<F> =
    Box<dyn Fn(PoolType, &Endpoint, Option<BindIdentity>) -> Result<F> + Send + Sync>;

type Source<F> = Arc<dyn ConnectionSource<F>>;

struct PoolSet<F: ConnectionFactory> {
    admin: Source<F>,
    user: Source<F>,
    log: Option<Source<F>>,
}

impl<F: ConnectionFactory> PoolSet<F> {
    fn get(&self, pool_type: PoolType) -> Result<&Source<F>> {
        match pool_type {
            PoolType::Admin => Ok(&self.admin),
            PoolType::User => Ok(&self.user),
            PoolType::Log => self.log.as_ref().ok_or(PoolError::LogPoolDisabled),
        }
    }
}

pub struct PoolManager<F: ConnectionFactory = LdapConnector> {
    config: Config,
    make: MakeFactory<F>,
    pools: OnceCell<PoolSet<F>>,
}

impl PoolManager<LdapConnector> {
    pub fn new(config: Config) -> Self {
        Self::with_factory(config, |_, endpoint, identity| {
            LdapConnector::new(endpoint.clone(), identity)
        })
    }
}

impl<F: ConnectionFactory> PoolManager<F> {
    /// Uses `make` to produce the connection factory of every pool, or every node of an HA
    /// pool.
    pub fn with_factory<M>(config: Config, make: M) -> Self
    where
        M: Fn(PoolType, &Endpoint, Option<BindIdentity>) -> Result<F> + Send + Sync + 'static,
    {
        Self {
            config,
            make: Box::new(make),
            pools: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the pools if that has not happened yet. A failed attempt leaves the manager
    /// uninitialized, so the next call tries again.
    pub async fn init(&self) -> Result<()> {
        self.pools().await.map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.pools.initialized()
    }

    async fn pools(&self) -> Result<&PoolSet<F>> {
        self.pools.get_or_try_init(|| self.build()).await
    }

    async fn build(&self) -> Result<PoolSet<F>> {
        let config = &self.config;
        config.validate()?;

        let cipher = config.cipher()?;
        let admin_id = credentials::resolve("admin", &config.admin.credential, cipher.as_ref())?;
        let log_id = config
            .log_service
            .as_ref()
            .map(|log| credentials::resolve("log_service", &log.credential, cipher.as_ref()))
            .transpose()?;

        let admin = self.source(PoolType::Admin, Some(admin_id), true).await?;

        let user_ha = config.ha.as_ref().map_or(false, |ha| ha.user);
        let user = self.source(PoolType::User, None, user_ha).await?;

        let log = match log_id {
            Some(identity) => Some(self.source(PoolType::Log, Some(identity), true).await?),
            None => {
                info!("no log_service credentials configured, log pool disabled");
                None
            }
        };

        Ok(PoolSet { admin, user, log })
    }

    /// One pool of `pool_type`, spread over the HA nodes when there are any and `ha_capable`.
    async fn source(
        &self,
        pool_type: PoolType,
        identity: Option<BindIdentity>,
        ha_capable: bool,
    ) -> Result<Source<F>> {
        let pool_config: PoolConfig = self.config.pool_config(pool_type);

        if let (Some(ha), true) = (&self.config.ha, ha_capable) {
            let factories = self
                .config
                .ha_endpoints()?
                .unwrap_or_default()
                .iter()
                .map(|endpoint| (self.make)(pool_type, endpoint, identity.clone()).map(Arc::new))
                .collect::<Result<Vec<_>>>()?;

            let pool = HaPool::new(pool_type.as_str(), factories, pool_config, ha.strategy, ha.retries).await?;
            return Ok(Arc::new(pool));
        }

        let factory = (self.make)(pool_type, &self.config.endpoint()?, identity)?;
        let pool = Pool::new(pool_type.as_str(), Arc::new(factory), pool_config).await?;
        Ok(Arc::new(pool))
    }

    /// Borrows a connection bound as the service account.
    pub async fn admin(&self) -> Result<PooledConnection<F>> {
        self.acquire(PoolType::Admin).await
    }

    /// Borrows an unbound connection for authenticating end users.
    pub async fn user(&self) -> Result<PooledConnection<F>> {
        self.acquire(PoolType::User).await
    }

    /// Borrows a connection bound as the audit-log account. Fails with
    /// [`PoolError::LogPoolDisabled`] when no such account is configured.
    pub async fn log(&self) -> Result<PooledConnection<F>> {
        self.acquire(PoolType::Log).await
    }

    pub async fn acquire(&self, pool_type: PoolType) -> Result<PooledConnection<F>> {
        let pools = self.pools().await?;
        pools.get(pool_type)?.acquire().await
    }

    /// Returns a connection to the pool of `pool_type`. Releasing into the wrong pool is an
    /// error, although the connection still finds its way home.
    pub fn release(&self, conn: PooledConnection<F>, pool_type: PoolType) -> Result<()> {
        let Some(pools) = self.pools.get() else {
            return Err(PoolError::UnknownConnectionReleased(conn.id()));
        };
        pools.get(pool_type)?.release(conn)
    }

    pub fn status(&self, pool_type: PoolType) -> Option<PoolStatus> {
        let pools = self.pools.get()?;
        pools.get(pool_type).ok().map(|source| source.status())
    }

    /// Destroys every pool. A pool that fails to close does not keep the others open; the
    /// first failure is reported once all of them were attempted.
    pub async fn close_all(&self) -> Result<()> {
        let Some(pools) = self.pools.get() else {
            return Ok(());
        };

        let mut first_err = None;
        let sources = [Some(&pools.admin), Some(&pools.user), pools.log.as_ref()];
        for source in sources.into_iter().flatten() {
            if let Err(e) = source.destroy().await {
                error!("failed to close {} pool: {e}", source.name());
                first_err.get_or_insert(e);
            }
        }

        info!("all directory pools closed");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
