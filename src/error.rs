use std::time::Duration;

use thiserror::Error;

use crate::types::{ConnectionId, PoolType};

pub type Result<T> = std::result::Result<T, PoolError>;

/// Everything that can go wrong between a caller asking for a connection and handing it back.
///
/// Every variant maps to a stable numeric code (see [`PoolError::code`]) so callers further up
/// can report failures without matching on message text.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("{pool} pool exhausted: no connection to {endpoint} within {waited:?}")]
    PoolExhausted {
        pool: String,
        endpoint: String,
        waited: Duration,
    },

    #[error("{pool} pool is closed")]
    PoolClosed { pool: String },

    #[error("cannot connect to {endpoint}{}: {reason}", pool_suffix(.pool))]
    Connect {
        /// Filled in by the pool the attempt was made for.
        pool: Option<String>,
        endpoint: String,
        reason: String,
    },

    #[error("directory server {endpoint} is down ({pool} pool)")]
    ServerDown { pool: PoolType, endpoint: String },

    #[error("timed out waiting for a {pool} connection to {endpoint}")]
    LdapTimeout { pool: PoolType, endpoint: String },

    #[error("LDAP error: {0}")]
    Ldap(#[from] #[source] ldap3::LdapError),

    #[error("{pool} pool: retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        pool: String,
        attempts: u32,
        #[source]
        last: Box<PoolError>,
    },

    #[error("node {node} failed with a non-transport error: {source}")]
    NodeFailure {
        node: String,
        #[source]
        source: Box<PoolError>,
    },

    #[error("connection {0} was not borrowed from this pool")]
    UnknownConnectionReleased(ConnectionId),

    #[error("log pool is disabled: no log service credentials configured")]
    LogPoolDisabled,

    #[error("I/O error: {0}")]
    Io(#[from] #[source] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Toml(#[from] #[source] toml::de::Error),
}

impl PoolError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connect(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            pool: None,
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Names the pool a connect failure happened in, unless it already carries one.
    pub fn in_pool(mut self, name: &str) -> Self {
        if let Self::Connect { pool: pool @ None, .. } = &mut self {
            *pool = Some(name.to_owned());
        }
        self
    }

    /// Numeric code surfaced to callers alongside the message.
    pub fn code(&self) -> u32 {
        match self {
            Self::Configuration(_) | Self::Toml(_) => 100,
            Self::Credential(_) => 101,
            Self::PoolExhausted { .. } => 200,
            Self::PoolClosed { .. } => 201,
            Self::Connect { .. } => 300,
            Self::ServerDown { .. } => 301,
            Self::LdapTimeout { .. } => 302,
            Self::Ldap(_) => 303,
            Self::RetryExhausted { .. } => 400,
            Self::NodeFailure { .. } => 401,
            Self::UnknownConnectionReleased(_) => 500,
            Self::LogPoolDisabled => 501,
            Self::Io(_) => 900,
        }
    }

    /// Errors that mean the endpoint could not be reached or did not answer in time.
    /// These are the ones failover and recovery act on.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::ServerDown { .. }
            | Self::LdapTimeout { .. }
            | Self::PoolExhausted { .. } => true,
            Self::Ldap(e) => matches!(
                e,
                ldap3::LdapError::Io { .. }
                    | ldap3::LdapError::Timeout { .. }
                    | ldap3::LdapError::EndOfStream
                    | ldap3::LdapError::OpSend { .. }
                    | ldap3::LdapError::ResultRecv { .. }
            ),
            _ => false,
        }
    }

    /// Whether no further attempt inside this crate can help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ServerDown { .. }
                | Self::LdapTimeout { .. }
                | Self::RetryExhausted { .. }
        )
    }
}

fn pool_suffix(pool: &Option<String>) -> String {
    match pool {
        Some(pool) => format!(" ({pool} pool)"),
        None => String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PoolError::config("x").code(), 100);
        assert_eq!(PoolError::connect("ldap://a:389", "refused").code(), 300);
        assert_eq!(PoolError::LogPoolDisabled.code(), 501);
        let exhausted = PoolError::RetryExhausted {
            pool: "admin".into(),
            attempts: 2,
            last: Box::new(PoolError::connect("ldap://a:389", "refused")),
        };
        assert_eq!(exhausted.code(), 400);
    }

    #[test]
    fn transport_classification() {
        assert!(PoolError::connect("ldap://a:389", "refused").is_transport());
        assert!(PoolError::PoolExhausted {
            pool: "admin".into(),
            endpoint: "ldap://a:389".into(),
            waited: Duration::from_millis(10),
        }
        .is_transport());
        assert!(!PoolError::config("both tls and ssl").is_transport());
        assert!(!PoolError::LogPoolDisabled.is_transport());
    }

    #[test]
    fn retry_exhausted_keeps_last_cause() {
        let err = PoolError::RetryExhausted {
            pool: "log".into(),
            attempts: 3,
            last: Box::new(PoolError::connect("ldap://b:389", "refused")),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("log pool"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("ldap://b:389"));
    }

    #[test]
    fn connect_error_names_its_pool_once() {
        let err = PoolError::connect("ldap://a:389", "refused");
        assert_eq!(err.to_string(), "cannot connect to ldap://a:389: refused");

        let err = err.in_pool("user").in_pool("admin");
        assert_eq!(err.to_string(), "cannot connect to ldap://a:389 (user pool): refused");
        assert_eq!(PoolError::LogPoolDisabled.in_pool("log").code(), 501);
    }
}
