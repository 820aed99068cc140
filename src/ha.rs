//! Failover across several directory nodes.
//!
//! An [`HaPool`] keeps one [`Pool`] per node and picks a node per borrow according to its
//! [`Strategy`]. Transport failures are paid for out of a retry budget shared by all callers
//! of the instance. Anything else fails the borrow at once.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::{PoolConfig, WhenExhausted};
use crate::connection::ConnectionFactory;
use crate::error::{PoolError, Result};
use crate::pool::{ConnectionSource, Pool, PooledConnection};
use crate::types::{ConnectionId, PoolStatus};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Spread borrows over all nodes in turn.
    #[default]
    RoundRobin,
    /// Stay on one node and move to the next only when it fails.
    ActivePassive,
}

/// Which node each outstanding connection was borrowed from.
#[derive(Debug, Default)]
pub struct LeaseTable {
    entries: Mutex<HashMap<ConnectionId, usize>>,
}

impl LeaseTable {
    fn insert(&self, id: ConnectionId, node: usize) {
        self.entries.lock().insert(id, node);
    }

    fn remove(&self, id: ConnectionId) -> Option<usize> {
        self.entries.lock().remove(&id)
    }

    /// Drops the entry of a connection going back on its own.
    pub(crate) fn forget(&self, id: ConnectionId) {
        self.entries.lock().remove(&id);
    }

    pub fn node_of(&self, id: ConnectionId) -> Option<usize> {
        self.entries.lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct HaPool<F: ConnectionFactory> {
    name: String,
    nodes: Vec<Pool<F>>,
    strategy: Strategy,
    retries: u32,
    budget: AtomicU32,
    counter: AtomicUsize,
    primary: AtomicUsize,
    leases: Arc<LeaseTable>,
}

impl<F: ConnectionFactory> HaPool<F> {
    /// Builds one pool per factory, in order. Node pools always validate on borrow and grow
    /// when exhausted, whatever `config` says.
    pub async fn new(
        name: impl Into<String>,
        factories: Vec<Arc<F>>,
        config: PoolConfig,
        strategy: Strategy,
        retries: u32,
    ) -> Result<Self> {
        let name = name.into();
        if factories.is_empty() {
            return Err(PoolError::config(format!("{name}: no nodes configured")));
        }
        if retries == 0 {
            return Err(PoolError::config(format!("{name}: retries must be at least 1")));
        }

        let config = config
            .test_on_borrow(true)
            .when_exhausted(WhenExhausted::Grow);

        let mut nodes = Vec::with_capacity(factories.len());
        for (i, factory) in factories.into_iter().enumerate() {
            nodes.push(Pool::new(format!("{name}[{i}]"), factory, config.clone()).await?);
        }

        info!("{name} pool spans {} nodes ({strategy:?}, {retries} retries)", nodes.len());

        Ok(Self {
            name,
            nodes,
            strategy,
            retries,
            budget: AtomicU32::new(retries),
            counter: AtomicUsize::new(0),
            primary: AtomicUsize::new(0),
            leases: Arc::new(LeaseTable::default()),
        })
    }

    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        let (node, mut conn) = match self.strategy {
            Strategy::RoundRobin => self.round_robin().await?,
            Strategy::ActivePassive => self.active_passive().await?,
        };

        self.budget.store(self.retries, Ordering::SeqCst);
        self.leases.insert(conn.id(), node);
        conn.track(self.leases.clone());

        debug!("{}: connection {} from node {node}", self.name, conn.id());
        Ok(conn)
    }

    async fn round_robin(&self) -> Result<(usize, PooledConnection<F>)> {
        let mut spent = 0;
        loop {
            let node = self.counter.fetch_add(1, Ordering::SeqCst) % self.nodes.len();
            match self.try_node(node).await? {
                Ok(conn) => return Ok((node, conn)),
                Err(e) => self.spend(&mut spent, e)?,
            }
        }
    }

    async fn active_passive(&self) -> Result<(usize, PooledConnection<F>)> {
        let n = self.nodes.len();
        let mut spent = 0;
        loop {
            let start = self.primary.load(Ordering::SeqCst) % n;
            let mut failure = None;

            for step in 0..n {
                let node = (start + step) % n;
                match self.try_node(node).await? {
                    Ok(conn) => {
                        if node != start {
                            info!("{}: primary moved to node {node}", self.name);
                        }
                        self.primary.store(node, Ordering::SeqCst);
                        return Ok((node, conn));
                    }
                    Err(e) => {
                        self.primary.store((node + 1) % n, Ordering::SeqCst);
                        failure = Some(e);
                    }
                }
            }

            // every node failed once, that costs one unit
            if let Some(e) = failure {
                self.spend(&mut spent, e)?;
            }
            self.primary.store(0, Ordering::SeqCst);
        }
    }

    /// Borrows from one node. The outer error is fatal, the inner one is a transport failure
    /// worth another attempt.
    async fn try_node(&self, node: usize) -> Result<Result<PooledConnection<F>>> {
        let pool = &self.nodes[node];
        match pool.acquire().await {
            Ok(conn) => Ok(Ok(conn)),
            Err(e) if e.is_transport() => {
                warn!("{}: node {node} ({}) unavailable: {e}", self.name, pool.factory().endpoint());
                Ok(Err(e))
            }
            Err(e) => Err(PoolError::NodeFailure {
                node: pool.factory().endpoint().to_string(),
                source: Box::new(e),
            }),
        }
    }

    /// Pays for one failure. Besides the shared budget, a single call never spends more than
    /// `retries`, so successes elsewhere refilling the budget cannot keep it looping.
    fn spend(&self, spent: &mut u32, last: PoolError) -> Result<()> {
        *spent += 1;

        let remaining = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| Some(b.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0);

        if remaining == 0 || *spent >= self.retries {
            error!("{}: giving up after {spent} failed attempts", self.name);
            return Err(PoolError::RetryExhausted {
                pool: self.name.clone(),
                attempts: *spent,
                last: Box::new(last),
            });
        }

        debug!("{}: retrying, {remaining} retries left", self.name);
        Ok(())
    }

    /// Sends a connection back to the node it came from.
    pub fn release(&self, conn: PooledConnection<F>) -> Result<()> {
        let id = conn.id();
        match self.leases.remove(id) {
            Some(node) => self.nodes[node].release(conn),
            None => {
                error!("{}: release of connection {id} that is not on loan", self.name);
                drop(conn);
                Err(PoolError::UnknownConnectionReleased(id))
            }
        }
    }

    pub async fn destroy(&self) -> Result<()> {
        let mut first_err = None;
        for node in &self.nodes {
            if let Err(e) = node.destroy().await {
                warn!("{}: error destroying node pool {}: {e}", self.name, node.name());
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.nodes
            .iter()
            .map(Pool::status)
            .fold(PoolStatus::default(), |acc, s| acc + s)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Pool<F>] {
        &self.nodes
    }

    pub fn remaining_retries(&self) -> u32 {
        self.budget.load(Ordering::SeqCst)
    }

    pub fn primary(&self) -> usize {
        self.primary.load(Ordering::SeqCst)
    }

    /// Number of connections currently on loan.
    pub fn outstanding(&self) -> usize {
        self.leases.len()
    }

    pub fn node_of(&self, id: ConnectionId) -> Option<usize> {
        self.leases.node_of(id)
    }
}

#[async_trait]
impl<F: ConnectionFactory> ConnectionSource<F> for HaPool<F> {
    async fn acquire(&self) -> Result<PooledConnection<F>> {
        HaPool::acquire(self).await
    }

    fn release(&self, conn: PooledConnection<F>) -> Result<()> {
        HaPool::release(self, conn)
    }

    async fn destroy(&self) -> Result<()> {
        HaPool::destroy(self).await
    }

    fn status(&self) -> PoolStatus {
        HaPool::status(self)
    }

    fn name(&self) -> &str {
        HaPool::name(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MockFactory;
    use std::time::Duration;

    fn node_config() -> PoolConfig {
        PoolConfig::new()
            .min_idle(0)
            .max_total(4)
            .max_wait(Duration::from_millis(100))
            .eviction_interval(None)
    }

    fn factories(hosts: &[&str]) -> Vec<Arc<MockFactory>> {
        hosts.iter().map(|h| Arc::new(MockFactory::new(h))).collect()
    }

    async fn ha(
        factories: &[Arc<MockFactory>],
        strategy: Strategy,
        retries: u32,
    ) -> HaPool<MockFactory> {
        HaPool::new("admin", factories.to_vec(), node_config(), strategy, retries)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn needs_nodes() {
        let result = HaPool::<MockFactory>::new("admin", vec![], node_config(), Strategy::RoundRobin, 2).await;
        assert_eq!(result.err().unwrap().code(), 100);
    }

    #[tokio::test]
    async fn round_robin_visits_every_node_once() {
        let factories = factories(&["ldap0", "ldap1", "ldap2"]);
        let pool = ha(&factories, Strategy::RoundRobin, 2).await;

        let mut hosts = Vec::new();
        let mut held = Vec::new();
        for _ in 0..3 {
            let conn = pool.acquire().await.unwrap();
            hosts.push(conn.host.clone());
            held.push(conn);
        }

        assert_eq!(hosts, ["ldap0", "ldap1", "ldap2"]);
        assert_eq!(pool.remaining_retries(), 2);
    }

    // three nodes, node 2 down: the call landing on it pays one unit and falls through to 0
    #[tokio::test]
    async fn round_robin_skips_failed_node() {
        let factories = factories(&["ldap0", "ldap1", "ldap2"]);
        factories[2].set_up(false);
        let pool = ha(&factories, Strategy::RoundRobin, 2).await;

        let mut hosts = Vec::new();
        for _ in 0..5 {
            let conn = pool.acquire().await.unwrap();
            hosts.push(conn.host.clone());
            pool.release(conn).unwrap();
        }

        assert_eq!(hosts, ["ldap0", "ldap1", "ldap0", "ldap1", "ldap0"]);
        assert_eq!(factories[2].connect_count(), 2);
        // reset by the success that followed
        assert_eq!(pool.remaining_retries(), 2);
    }

    #[tokio::test]
    async fn round_robin_gives_up_when_budget_is_spent() {
        let factories = factories(&["ldap0", "ldap1", "ldap2"]);
        for f in &factories {
            f.set_up(false);
        }
        let pool = ha(&factories, Strategy::RoundRobin, 2).await;

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::RetryExhausted { attempts: 2, .. }));
        assert!(err.to_string().starts_with(&format!("{} pool", pool.name())), "{err}");
        assert_eq!(pool.remaining_retries(), 0);
        assert_eq!(pool.outstanding(), 0);

        // the budget never goes below zero
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.remaining_retries(), 0);

        factories[0].set_up(true);
        factories[1].set_up(true);
        factories[2].set_up(true);
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.remaining_retries(), 2);
    }

    #[tokio::test]
    async fn active_passive_fails_over_without_spending() {
        let factories = factories(&["ldap0", "ldap1", "ldap2"]);
        factories[0].set_up(false);
        let pool = ha(&factories, Strategy::ActivePassive, 2).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.host, "ldap1");
        assert_eq!(pool.primary(), 1);
        assert_eq!(pool.remaining_retries(), 2);
        pool.release(conn).unwrap();

        // sticks to the new primary
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.host, "ldap1");
        assert_eq!(factories[0].connect_count(), 1);
    }

    #[tokio::test]
    async fn active_passive_stays_on_primary() {
        let factories = factories(&["ldap0", "ldap1"]);
        let pool = ha(&factories, Strategy::ActivePassive, 2).await;

        for _ in 0..4 {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(conn.host, "ldap0");
        }
        assert_eq!(factories[1].connect_count(), 0);
    }

    #[tokio::test]
    async fn active_passive_spends_one_unit_per_full_pass() {
        let factories = factories(&["ldap0", "ldap1", "ldap2"]);
        for f in &factories {
            f.set_up(false);
        }
        let pool = ha(&factories, Strategy::ActivePassive, 2).await;

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::RetryExhausted { attempts: 2, .. }));
        // two passes over three nodes
        for f in &factories {
            assert_eq!(f.connect_count(), 2);
        }
    }

    #[tokio::test]
    async fn active_passive_recovers_on_second_pass() {
        let factories = factories(&["ldap0", "ldap1"]);
        factories[0].fail_next_connects(1);
        factories[1].fail_next_connects(1);
        let pool = ha(&factories, Strategy::ActivePassive, 2).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.host, "ldap0");
        assert_eq!(pool.primary(), 0);
        assert_eq!(pool.remaining_retries(), 2);
    }

    #[tokio::test]
    async fn release_goes_to_the_owning_node() {
        let factories = factories(&["ldap0", "ldap1"]);
        let pool = ha(&factories, Strategy::RoundRobin, 2).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.node_of(a.id()), Some(0));
        assert_eq!(pool.node_of(b.id()), Some(1));

        pool.release(b).unwrap();
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.nodes()[1].status().idle, 1);
        assert_eq!(pool.nodes()[0].status().idle, 0);

        drop(a);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.nodes()[0].status().idle, 1);
    }

    #[tokio::test]
    async fn foreign_connection_is_rejected() {
        let factories = factories(&["ldap0"]);
        let pool = ha(&factories, Strategy::RoundRobin, 2).await;
        let single: Pool<MockFactory> =
            Pool::new("other", Arc::new(MockFactory::new("ldapx")), node_config())
                .await
                .unwrap();

        let conn = single.acquire().await.unwrap();
        let err = pool.release(conn).unwrap_err();
        assert_eq!(err.code(), 500);
        assert_eq!(single.status().idle, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lease_table_tracks_concurrent_borrows() {
        let factories = factories(&["ldap0", "ldap1", "ldap2"]);
        let pool = Arc::new(ha(&factories, Strategy::RoundRobin, 2).await);

        let mut tasks = Vec::new();
        for _ in 0..30 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                let node = pool.node_of(conn.id()).unwrap();
                assert_eq!(conn.host, format!("ldap{node}"));
                tokio::task::yield_now().await;
                pool.release(conn).unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn destroy_closes_every_node() {
        let factories = factories(&["ldap0", "ldap1"]);
        let pool = ha(&factories, Strategy::RoundRobin, 2).await;
        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());

        pool.destroy().await.unwrap();
        assert!(pool.nodes().iter().all(Pool::is_closed));
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), 401);
    }
}
