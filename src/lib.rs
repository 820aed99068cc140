//! Segregated, self-healing connection pools for an RBAC directory.
//!
//! Three logical pools (admin, user and audit log) sit behind a [`PoolManager`]. Each one is a
//! bounded [`Pool`] to a single endpoint, or an [`HaPool`] failing over between several
//! nodes. [`RecoveryManager`] adds reconnect-and-rebuild on top of plain pools for callers
//! that want it.
#[macro_use]
extern crate log;

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod ha;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{Config, Endpoint, PoolConfig, WhenExhausted};
pub use connection::{ConnectionFactory, LdapConnection, LdapConnector};
pub use error::{PoolError, Result};
pub use ha::{HaPool, Strategy};
pub use pool::{ConnectionSource, Pool, PooledConnection};
pub use recovery::RecoveryManager;
pub use registry::PoolManager;
pub use types::{ConnectionId, PoolStatus, PoolType};
