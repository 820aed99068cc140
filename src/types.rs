//! Common types across the crate

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

/// The logical pools the directory layer keeps apart. Each one selects a bind identity
/// and an intended use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Connections pre-bound with the service account.
    Admin,
    /// Unbound connections, the caller binds with end-user credentials.
    User,
    /// Connections bound with the audit-log service account.
    Log,
}

impl PoolType {
    pub const ALL: [PoolType; 3] = [PoolType::Admin, PoolType::User, PoolType::Log];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Admin => "admin",
            PoolType::User => "user",
            PoolType::Log => "log",
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identity of a borrowed connection, assigned when the pool hands it out.
///
/// The first half names the pool instance, the second counts borrows within it, so two
/// pools never produce the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pool: u64,
    seq: u64,
}

impl ConnectionId {
    pub(crate) fn new(pool: u64, seq: u64) -> Self {
        Self { pool, seq }
    }

    pub fn pool(&self) -> u64 {
        self.pool
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.seq)
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections ready for checkout.
    pub idle: u32,
    /// Connections currently lent out.
    pub in_use: u32,
    /// Configured maximum.
    pub max: u32,
}

impl PoolStatus {
    pub fn total(&self) -> u32 {
        self.idle + self.in_use
    }
}

impl std::ops::Add for PoolStatus {
    type Output = PoolStatus;

    fn add(self, rhs: PoolStatus) -> PoolStatus {
        PoolStatus {
            idle: self.idle + rhs.idle,
            in_use: self.in_use + rhs.in_use,
            max: self.max + rhs.max,
        }
    }
}
