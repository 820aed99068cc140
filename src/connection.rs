//! Producing directory connections.
//!
//! Pools never talk to `ldap3` directly. They go through a [`ConnectionFactory`], which knows
//! how to open, validate and close one kind of connection. [`LdapConnector`] is the real one;
//! tests swap in an in-memory factory.

use std::collections::HashSet;

use async_trait::async_trait;
use ldap3::controls::ProxyAuth;
use ldap3::exop::WhoAmI;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry, SearchOptions};
use native_tls::{Certificate, TlsConnector};
use url::Url;

use crate::config::{Endpoint, TransportSecurity};
use crate::credentials::BindIdentity;
use crate::error::{PoolError, Result};

// noSuchObject
const RC_NO_SUCH_OBJECT: u32 = 32;
// sizeLimitExceeded
const RC_SIZE_LIMIT: u32 = 4;

/// Opens, validates and closes connections to one endpoint.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Opens a new connection, bound with the factory's identity if it has one.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Round-trip liveness check.
    async fn validate(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Local check without touching the network.
    fn is_closed(&self, conn: &mut Self::Connection) -> bool;

    /// Closes the connection gracefully.
    async fn close(&self, conn: Self::Connection) -> Result<()>;

    fn endpoint(&self) -> &Endpoint;
}

/// [`ConnectionFactory`] backed by `ldap3`.
///
/// Admin and log pools hand in the service identity and get pre-bound connections. The user
/// pool passes `None`, its connections stay anonymous until the caller binds them.
#[derive(Clone)]
pub struct LdapConnector {
    endpoint: Endpoint,
    url: Url,
    identity: Option<BindIdentity>,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for LdapConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnector")
            .field("endpoint", &self.endpoint.to_string())
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LdapConnector {
    /// Prepares a connector. The trust store, if any, is loaded here so a broken one fails at
    /// startup rather than on the first borrow.
    pub fn new(endpoint: Endpoint, identity: Option<BindIdentity>) -> Result<Self> {
        let url = endpoint.url()?;
        let tls = match endpoint.security {
            TransportSecurity::None => None,
            TransportSecurity::StartTls | TransportSecurity::Ssl => tls_connector(&endpoint)?,
        };

        Ok(Self {
            endpoint,
            url,
            identity,
            tls,
        })
    }

    pub fn identity(&self) -> Option<&BindIdentity> {
        self.identity.as_ref()
    }

    fn settings(&self) -> LdapConnSettings {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(self.endpoint.connect_timeout)
            .set_starttls(self.endpoint.security == TransportSecurity::StartTls)
            .set_no_tls_verify(self.endpoint.no_tls_verify);

        if let Some(tls) = &self.tls {
            settings = settings.set_connector(tls.clone());
        }

        settings
    }
}

fn tls_connector(endpoint: &Endpoint) -> Result<Option<TlsConnector>> {
    let Some(path) = &endpoint.trust_store else {
        return Ok(None);
    };

    let bytes = std::fs::read(path).map_err(|e| {
        PoolError::config(format!("cannot read trust store {}: {e}", path.display()))
    })?;
    let cert = if bytes.starts_with(b"-----BEGIN") {
        Certificate::from_pem(&bytes)
    } else {
        Certificate::from_der(&bytes)
    }
    .map_err(|e| PoolError::config(format!("malformed trust store {}: {e}", path.display())))?;

    let connector = TlsConnector::builder()
        .add_root_certificate(cert)
        .danger_accept_invalid_certs(endpoint.no_tls_verify)
        .build()
        .map_err(|e| PoolError::config(format!("cannot build TLS connector: {e}")))?;

    Ok(Some(connector))
}

#[async_trait]
impl ConnectionFactory for LdapConnector {
    type Connection = LdapConnection;

    async fn connect(&self) -> Result<LdapConnection> {
        let (conn, mut ldap) = LdapConnAsync::from_url_with_settings(self.settings(), &self.url)
            .await
            .map_err(|e| PoolError::connect(self.endpoint.to_string(), e))?;
        ldap3::drive!(conn);

        if let Some(identity) = &self.identity {
            ldap.simple_bind(&identity.dn, identity.credential.expose())
                .await?
                .success()?;
        }

        trace!("opened connection to {}", self.endpoint);

        Ok(LdapConnection { ldap })
    }

    async fn validate(&self, conn: &mut LdapConnection) -> Result<()> {
        conn.ldap
            .with_timeout(self.endpoint.connect_timeout)
            .extended(WhoAmI)
            .await?
            .success()?;
        Ok(())
    }

    fn is_closed(&self, conn: &mut LdapConnection) -> bool {
        conn.ldap.is_closed()
    }

    async fn close(&self, mut conn: LdapConnection) -> Result<()> {
        conn.ldap.unbind().await?;
        Ok(())
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// One session with the directory. Pools lend these out wrapped in a
/// [`PooledConnection`](crate::pool::PooledConnection), which derefs to it.
pub struct LdapConnection {
    ldap: Ldap,
}

impl LdapConnection {
    /// The raw `ldap3` handle, for operations not covered below.
    pub fn ldap(&mut self) -> &mut Ldap {
        &mut self.ldap
    }

    /// Reads a single entry. `None` if it does not exist.
    pub async fn lookup(&mut self, dn: &str, attrs: &[&str]) -> Result<Option<SearchEntry>> {
        let result = self
            .ldap
            .search(dn, Scope::Base, "(objectClass=*)", attrs)
            .await?;

        if result.1.rc == RC_NO_SUCH_OBJECT {
            return Ok(None);
        }

        let (mut entries, _) = result.success()?;
        Ok(entries.pop().map(SearchEntry::construct))
    }

    /// Searches below `base`. Hitting `size_limit` is not an error, the entries received so
    /// far are returned.
    pub async fn search(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
        size_limit: i32,
    ) -> Result<Vec<SearchEntry>> {
        let ldap3::SearchResult(entries, result) = self
            .ldap
            .with_search_options(SearchOptions::new().sizelimit(size_limit))
            .search(base, scope, filter, attrs)
            .await?;

        if result.rc != 0 && result.rc != RC_SIZE_LIMIT {
            return Err(ldap3::LdapError::LdapResult { result }.into());
        }

        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    pub async fn add(&mut self, dn: &str, attrs: Vec<(String, HashSet<String>)>) -> Result<()> {
        self.ldap.add(dn, attrs).await?.success()?;
        Ok(())
    }

    pub async fn modify(&mut self, dn: &str, mods: Vec<Mod<String>>) -> Result<()> {
        self.ldap.modify(dn, mods).await?.success()?;
        Ok(())
    }

    pub async fn delete(&mut self, dn: &str) -> Result<()> {
        self.ldap.delete(dn).await?.success()?;
        Ok(())
    }

    /// Compares `attr` of `dn` against `value`. With `proxy`, the server evaluates access as
    /// that identity (proxied authorization, RFC 4370).
    pub async fn compare(
        &mut self,
        dn: &str,
        attr: &str,
        value: &str,
        proxy: Option<&str>,
    ) -> Result<bool> {
        if let Some(authz) = proxy {
            // always sent critical
            self.ldap.with_controls(ProxyAuth {
                authzid: format!("dn:{authz}"),
            });
        }

        Ok(self.ldap.compare(dn, attr, value).await?.equal()?)
    }

    /// Binds as `dn`. Used on user pool connections to authenticate end users.
    pub async fn bind(&mut self, dn: &str, credential: &str) -> Result<()> {
        self.ldap.simple_bind(dn, credential).await?.success()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::credentials::Secret;

    #[test]
    fn plain_connector_has_no_tls() {
        let connector = LdapConnector::new(Endpoint::new("localhost", 389), None).unwrap();
        assert!(connector.tls.is_none());
        assert_eq!(connector.url.as_str(), "ldap://localhost:389");
        assert!(connector.identity().is_none());
    }

    #[test]
    fn debug_hides_credentials() {
        let identity = BindIdentity {
            dn: "cn=Manager,dc=example,dc=com".into(),
            credential: Secret::new("topsecret"),
        };
        let connector =
            LdapConnector::new(Endpoint::new("localhost", 389), Some(identity)).unwrap();
        let debug = format!("{connector:?}");
        assert!(debug.contains("cn=Manager"));
        assert!(!debug.contains("topsecret"));
    }

    #[test]
    fn malformed_trust_store_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, "-----BEGIN CERTIFICATE-----\nnot a cert\n-----END CERTIFICATE-----\n")
            .unwrap();

        let mut endpoint = Endpoint::new("localhost", 636);
        endpoint.security = TransportSecurity::Ssl;
        endpoint.trust_store = Some(path);

        let err = LdapConnector::new(endpoint, None).unwrap_err();
        assert_eq!(err.code(), 100);
        assert!(err.to_string().contains("trust store"));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_error() {
        let mut endpoint = Endpoint::new("127.0.0.1", 1);
        endpoint.connect_timeout = std::time::Duration::from_millis(200);
        let connector = LdapConnector::new(endpoint, None).unwrap();

        let err = connector.connect().await.err().unwrap();
        assert!(err.is_transport());
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
