//! In-memory connection factory for exercising the pools without a directory server.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;

use crate::config::Endpoint;
use crate::connection::ConnectionFactory;
use crate::error::{PoolError, Result};

#[derive(Debug)]
pub(crate) struct MockConnection {
    pub serial: u64,
    pub host: String,
    generation: u64,
}

/// A scriptable server: it can be switched off, fail a given number of upcoming connects
/// or validations, and "restart" so every open connection looks dead.
#[derive(Debug)]
pub(crate) struct MockFactory {
    endpoint: Endpoint,
    up: AtomicBool,
    generation: AtomicU64,
    fail_connects: AtomicU32,
    fail_validations: AtomicU32,
    fail_closes: AtomicU32,
    serial: AtomicU64,
    pub connects: AtomicU32,
    pub validations: AtomicU32,
    pub closes: AtomicU32,
    pub failed_closes: AtomicU32,
}

impl MockFactory {
    pub fn new(host: &str) -> Self {
        Self {
            endpoint: Endpoint::new(host, 389),
            up: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            fail_connects: AtomicU32::new(0),
            fail_validations: AtomicU32::new(0),
            fail_closes: AtomicU32::new(0),
            serial: AtomicU64::new(0),
            connects: AtomicU32::new(0),
            validations: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            failed_closes: AtomicU32::new(0),
        }
    }

    pub fn down(host: &str) -> Self {
        let factory = Self::new(host);
        factory.set_up(false);
        factory
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// The next `n` connects fail regardless of the up switch.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` validations fail regardless of the up switch.
    pub fn fail_next_validations(&self, n: u32) {
        self.fail_validations.store(n, Ordering::SeqCst);
    }

    /// The next `n` closes report an error.
    pub fn fail_next_closes(&self, n: u32) {
        self.fail_closes.store(n, Ordering::SeqCst);
    }

    /// Every connection opened so far now reports itself closed.
    pub fn restart(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn take_scripted(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn refused(&self) -> PoolError {
        PoolError::connect(self.endpoint.to_string(), "connection refused")
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if Self::take_scripted(&self.fail_connects) || !self.up.load(Ordering::SeqCst) {
            return Err(self.refused());
        }
        Ok(MockConnection {
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            host: self.endpoint.host.clone(),
            generation: self.generation.load(Ordering::SeqCst),
        })
    }

    async fn validate(&self, conn: &mut MockConnection) -> Result<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if Self::take_scripted(&self.fail_validations)
            || !self.up.load(Ordering::SeqCst)
            || self.is_closed(conn)
        {
            return Err(self.refused());
        }
        Ok(())
    }

    fn is_closed(&self, conn: &mut MockConnection) -> bool {
        conn.generation < self.generation.load(Ordering::SeqCst)
    }

    async fn close(&self, _conn: MockConnection) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if Self::take_scripted(&self.fail_closes) {
            self.failed_closes.fetch_add(1, Ordering::SeqCst);
            return Err(PoolError::Io(std::io::ErrorKind::BrokenPipe.into()));
        }
        Ok(())
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
