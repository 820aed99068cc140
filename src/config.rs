//! Configuration file handling.
//!
//! The whole file is read once when the pools are built. Durations are given in
//! milliseconds. `ldappool.example.toml` at the repository root lists every key.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use url::Url;

use crate::credentials::{CredentialCipher, KEY_ENV};
use crate::error::{PoolError, Result};
use crate::ha::Strategy;
use crate::types::PoolType;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log")]
    log: LevelFilter,

    pub directory: DirectoryConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    pub admin: BoundPoolConfig,

    #[serde(default)]
    pub user: PoolSizing,

    // Without it the log pool stays disabled.
    pub log_service: Option<BoundPoolConfig>,

    #[serde(default)]
    pub pool: PoolDefaults,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    pub ha: Option<HaConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// StartTLS on a plain connection.
    #[serde(default)]
    pub enable_tls: bool,
    /// TLS from the first byte (`ldaps://`).
    #[serde(default)]
    pub enable_ssl: bool,
    /// CA certificate(s), PEM or DER, used to verify the server.
    pub trust_store: Option<PathBuf>,
    #[serde(default)]
    pub no_tls_verify: bool,
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityConfig {
    /// Base64 AES-256 key for `password_encrypted` values.
    pub key: Option<String>,
}

/// Bind DN plus either a plaintext or an encrypted credential.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub bind_dn: String,
    pub password: Option<String>,
    pub password_encrypted: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoundPoolConfig {
    #[serde(flatten)]
    pub credential: CredentialConfig,
    #[serde(flatten)]
    pub sizing: PoolSizing,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PoolSizing {
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
    #[serde(default = "default_max_total")]
    pub max_total: u32,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min_idle: default_min_idle(),
            max_total: default_max_total(),
        }
    }
}

/// What a pool does when every connection is lent out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhenExhausted {
    /// Wait up to `max_wait` for a connection to come back.
    Block,
    /// Fail right away.
    Fail,
    /// Open an extra connection beyond the maximum. It is closed when returned.
    Grow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolDefaults {
    #[serde(default = "default_when_exhausted")]
    pub when_exhausted: WhenExhausted,
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
    /// 0 disables the evictor.
    #[serde(default = "default_eviction_interval")]
    pub time_between_eviction_runs_ms: u64,
    #[serde(default = "default_min_evictable_idle")]
    pub min_evictable_idle_ms: u64,
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,
    #[serde(default = "default_true")]
    pub test_while_idle: bool,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            when_exhausted: default_when_exhausted(),
            max_wait_ms: default_max_wait(),
            time_between_eviction_runs_ms: default_eviction_interval(),
            min_evictable_idle_ms: default_min_evictable_idle(),
            test_on_borrow: true,
            test_while_idle: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_borrow_timeout")]
    pub borrow_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            borrow_timeout_ms: default_borrow_timeout(),
        }
    }
}

impl RecoveryConfig {
    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Also put the user pool behind the node set.
    #[serde(default)]
    pub user: bool,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_log() -> LevelFilter {
    LevelFilter::Info
}
fn default_port() -> u16 {
    389
}
fn default_version() -> u8 {
    3
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_min_idle() -> u32 {
    1
}
fn default_max_total() -> u32 {
    10
}
fn default_when_exhausted() -> WhenExhausted {
    WhenExhausted::Block
}
fn default_max_wait() -> u64 {
    5_000
}
fn default_eviction_interval() -> u64 {
    60_000
}
fn default_min_evictable_idle() -> u64 {
    300_000
}
fn default_borrow_timeout() -> u64 {
    2_000
}
fn default_retries() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

/// How the connection is protected on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    None,
    StartTls,
    Ssl,
}

/// A fully resolved directory endpoint. Immutable once a pool is built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub security: TransportSecurity,
    pub trust_store: Option<PathBuf>,
    pub no_tls_verify: bool,
    pub connect_timeout: Duration,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: TransportSecurity::None,
            trust_store: None,
            no_tls_verify: false,
            connect_timeout: Duration::from_millis(default_connect_timeout()),
        }
    }

    pub fn url(&self) -> Result<Url> {
        let scheme = match self.security {
            TransportSecurity::Ssl => "ldaps",
            TransportSecurity::None | TransportSecurity::StartTls => "ldap",
        };
        Url::parse(&format!("{scheme}://{}:{}", self.host, self.port))
            .map_err(|e| PoolError::config(format!("invalid endpoint {}:{}: {e}", self.host, self.port)))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.security == TransportSecurity::Ssl {
            "ldaps"
        } else {
            "ldap"
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Runtime settings of a single-endpoint pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_idle: u32,
    pub max_total: u32,
    pub when_exhausted: WhenExhausted,
    pub max_wait: Duration,
    /// `None` disables the background evictor.
    pub time_between_eviction_runs: Option<Duration>,
    pub min_evictable_idle: Duration,
    pub test_on_borrow: bool,
    pub test_while_idle: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_defaults(&PoolDefaults::default(), PoolSizing::default())
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_defaults(defaults: &PoolDefaults, sizing: PoolSizing) -> Self {
        let eviction = match defaults.time_between_eviction_runs_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            min_idle: sizing.min_idle,
            max_total: sizing.max_total,
            when_exhausted: defaults.when_exhausted,
            max_wait: Duration::from_millis(defaults.max_wait_ms),
            time_between_eviction_runs: eviction,
            min_evictable_idle: Duration::from_millis(defaults.min_evictable_idle_ms),
            test_on_borrow: defaults.test_on_borrow,
            test_while_idle: defaults.test_while_idle,
        }
    }

    #[must_use]
    pub fn min_idle(mut self, count: u32) -> Self {
        self.min_idle = count;
        self
    }

    #[must_use]
    pub fn max_total(mut self, count: u32) -> Self {
        self.max_total = count;
        self
    }

    #[must_use]
    pub fn when_exhausted(mut self, policy: WhenExhausted) -> Self {
        self.when_exhausted = policy;
        self
    }

    #[must_use]
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    #[must_use]
    pub fn eviction_interval(mut self, interval: Option<Duration>) -> Self {
        self.time_between_eviction_runs = interval;
        self
    }

    #[must_use]
    pub fn min_evictable_idle(mut self, idle: Duration) -> Self {
        self.min_evictable_idle = idle;
        self
    }

    #[must_use]
    pub fn test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    #[must_use]
    pub fn test_while_idle(mut self, enabled: bool) -> Self {
        self.test_while_idle = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(PoolError::config("max_total must be greater than 0"));
        }
        if self.min_idle > self.max_total {
            return Err(PoolError::config("min_idle cannot be greater than max_total"));
        }
        Ok(())
    }
}

impl Config {
    pub fn load_from_file<A: AsRef<Path>>(path: A) -> Result<Config> {
        let string = std::fs::read_to_string(path)?;

        Self::from_toml(string.as_str())
    }

    pub fn from_toml(input: &str) -> Result<Config> {
        let config: Config = toml::from_str(input)?;

        config.validate()?;

        Ok(config)
    }

    pub fn log(&self) -> LevelFilter {
        self.log
    }

    /// Rejects contradictory or incomplete settings. Nothing is built from a config that
    /// fails here.
    pub fn validate(&self) -> Result<()> {
        self.directory.security()?;

        if self.directory.version != 3 {
            return Err(PoolError::config(format!(
                "unsupported LDAP protocol version {}, only 3 is supported",
                self.directory.version
            )));
        }

        if let Some(trust_store) = &self.directory.trust_store {
            if !trust_store.is_file() {
                return Err(PoolError::config(format!(
                    "trust store {} does not exist or is not a file",
                    trust_store.display()
                )));
            }
        }

        if self.admin.credential.bind_dn.trim().is_empty() {
            return Err(PoolError::config("admin: bind_dn must not be empty"));
        }
        if let Some(log) = &self.log_service {
            if log.credential.bind_dn.trim().is_empty() {
                return Err(PoolError::config("log_service: bind_dn must not be empty"));
            }
        }

        for pool_type in PoolType::ALL {
            self.pool_config(pool_type)
                .validate()
                .map_err(|e| PoolError::config(format!("{pool_type} pool: {e}")))?;
        }

        if let Some(ha) = &self.ha {
            if ha.nodes.is_empty() {
                return Err(PoolError::config("ha: at least one node is required"));
            }
            if ha.retries == 0 {
                return Err(PoolError::config("ha: retries must be at least 1"));
            }
        }

        Ok(())
    }

    /// Pool settings for `pool_type`, shared defaults combined with the per-pool sizing.
    pub fn pool_config(&self, pool_type: PoolType) -> PoolConfig {
        let sizing = match pool_type {
            PoolType::Admin => self.admin.sizing,
            PoolType::User => self.user,
            PoolType::Log => self
                .log_service
                .as_ref()
                .map(|l| l.sizing)
                .unwrap_or_default(),
        };
        PoolConfig::from_defaults(&self.pool, sizing)
    }

    /// The primary endpoint from `[directory]`.
    pub fn endpoint(&self) -> Result<Endpoint> {
        self.directory.endpoint(&self.directory.host, self.directory.port)
    }

    /// The HA node set, each node inheriting the transport settings of `[directory]`.
    pub fn ha_endpoints(&self) -> Result<Option<Vec<Endpoint>>> {
        let Some(ha) = &self.ha else {
            return Ok(None);
        };
        ha.nodes
            .iter()
            .map(|node| self.directory.endpoint(&node.host, node.port))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// The cipher for encrypted credentials, from `[security] key` or the environment.
    pub fn cipher(&self) -> Result<Option<CredentialCipher>> {
        let key = match &self.security.key {
            Some(key) => Some(key.clone()),
            None => std::env::var(KEY_ENV).ok(),
        };
        key.map(|k| CredentialCipher::from_base64(&k)).transpose()
    }
}

impl DirectoryConfig {
    pub fn security(&self) -> Result<TransportSecurity> {
        match (self.enable_tls, self.enable_ssl) {
            (true, true) => Err(PoolError::config(
                "enable_tls and enable_ssl are mutually exclusive",
            )),
            (true, false) => Ok(TransportSecurity::StartTls),
            (false, true) => Ok(TransportSecurity::Ssl),
            (false, false) => Ok(TransportSecurity::None),
        }
    }

    fn endpoint(&self, host: &str, port: u16) -> Result<Endpoint> {
        Ok(Endpoint {
            host: host.to_owned(),
            port,
            security: self.security()?,
            trust_store: self.trust_store.clone(),
            no_tls_verify: self.no_tls_verify,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
        [directory]
        host = "ldap.example.com"

        [admin]
        bind_dn = "cn=Manager,dc=example,dc=com"
        password = "secret"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.log(), LevelFilter::Info);
        assert_eq!(config.directory.port, 389);
        assert!(config.log_service.is_none());
        assert!(config.ha.is_none());

        let pool = config.pool_config(PoolType::Admin);
        assert_eq!(pool.min_idle, 1);
        assert_eq!(pool.max_total, 10);
        assert_eq!(pool.when_exhausted, WhenExhausted::Block);
        assert_eq!(pool.time_between_eviction_runs, Some(Duration::from_secs(60)));
        assert!(pool.test_on_borrow);

        assert_eq!(config.endpoint().unwrap().to_string(), "ldap://ldap.example.com:389");
    }

    #[test]
    fn tls_and_ssl_are_exclusive() {
        let input = MINIMAL.replace(
            "host = \"ldap.example.com\"",
            "host = \"ldap.example.com\"\nenable_tls = true\nenable_ssl = true",
        );
        let err = Config::from_toml(&input).unwrap_err();
        assert_eq!(err.code(), 100);
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn ssl_switches_scheme() {
        let input = MINIMAL.replace(
            "host = \"ldap.example.com\"",
            "host = \"ldap.example.com\"\nport = 636\nenable_ssl = true",
        );
        let config = Config::from_toml(&input).unwrap();
        let url = config.endpoint().unwrap().url().unwrap();
        assert_eq!(url.scheme(), "ldaps");
        assert_eq!(url.port(), Some(636));
    }

    #[test]
    fn missing_trust_store_is_rejected() {
        let input = MINIMAL.replace(
            "host = \"ldap.example.com\"",
            "host = \"ldap.example.com\"\ntrust_store = \"/nonexistent/ca.pem\"",
        );
        let err = Config::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("trust store"));
    }

    #[test]
    fn only_protocol_version_3() {
        let input = MINIMAL.replace(
            "host = \"ldap.example.com\"",
            "host = \"ldap.example.com\"\nversion = 2",
        );
        assert!(Config::from_toml(&input).is_err());
    }

    #[test]
    fn bad_sizing_is_rejected() {
        let input = format!("{MINIMAL}\nmin_idle = 5\nmax_total = 2\n");
        let err = Config::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("admin pool"));
    }

    #[test]
    fn full_config() {
        let input = r#"
            log = "debug"

            [directory]
            host = "ldap1.example.com"
            enable_tls = true
            connect_timeout_ms = 250

            [admin]
            bind_dn = "cn=Manager,dc=example,dc=com"
            password = "secret"
            min_idle = 2
            max_total = 4

            [user]
            min_idle = 0
            max_total = 20

            [log_service]
            bind_dn = "cn=log,dc=example,dc=com"
            password = "logsecret"
            max_total = 3

            [pool]
            when_exhausted = "grow"
            max_wait_ms = 100
            time_between_eviction_runs_ms = 0
            test_while_idle = false

            [recovery]
            borrow_timeout_ms = 750

            [ha]
            strategy = "active_passive"
            retries = 3

            [[ha.nodes]]
            host = "ldap1.example.com"

            [[ha.nodes]]
            host = "ldap2.example.com"
            port = 1389
        "#;
        let config = Config::from_toml(input).unwrap();

        assert_eq!(config.log(), LevelFilter::Debug);
        assert_eq!(config.pool_config(PoolType::Admin).max_total, 4);
        assert_eq!(config.pool_config(PoolType::User).max_total, 20);
        assert_eq!(config.pool_config(PoolType::Log).max_total, 3);

        let user = config.pool_config(PoolType::User);
        assert_eq!(user.when_exhausted, WhenExhausted::Grow);
        assert_eq!(user.max_wait, Duration::from_millis(100));
        assert_eq!(user.time_between_eviction_runs, None);
        assert!(!user.test_while_idle);

        assert_eq!(config.recovery.borrow_timeout(), Duration::from_millis(750));

        let ha = config.ha.as_ref().unwrap();
        assert_eq!(ha.strategy, Strategy::ActivePassive);
        assert_eq!(ha.retries, 3);

        let nodes = config.ha_endpoints().unwrap().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].port, 1389);
        assert_eq!(nodes[1].security, TransportSecurity::StartTls);
        assert_eq!(nodes[1].connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn example_file_is_valid() {
        let config = Config::from_toml(include_str!("../ldappool.example.toml")).unwrap();
        assert!(config.log_service.is_none());
        assert!(config.ha.is_none());
        assert_eq!(config.pool_config(PoolType::User).max_total, 10);
    }

    #[test]
    fn ha_needs_nodes() {
        let input = format!("{MINIMAL}\n[ha]\nnodes = []\n");
        assert!(Config::from_toml(&input).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ldappool.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.directory.host, "ldap.example.com");

        let err = Config::load_from_file(dir.path().join("missing.toml")).unwrap_err();
        assert_eq!(err.code(), 900);
    }

    #[test]
    fn pool_config_validation() {
        assert!(PoolConfig::new().max_total(0).validate().is_err());
        assert!(PoolConfig::new().min_idle(3).max_total(2).validate().is_err());
        assert!(PoolConfig::new().min_idle(2).max_total(2).validate().is_ok());
    }
}
