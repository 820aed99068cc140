//! Bind credentials, optionally stored encrypted in the configuration file.
//!
//! Encrypted values are `base64(nonce || ciphertext)` produced by AES-256-GCM with a random
//! 12 byte nonce. They are decrypted once, when a pool is built from the endpoint, and from
//! then on only travel as a [`Secret`], which never prints its contents.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::{thread_rng, RngCore};

use crate::config::CredentialConfig;
use crate::error::{PoolError, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Environment variable consulted when the configuration carries no key.
pub const KEY_ENV: &str = "LDAPPOOL_KEY";

/// A decrypted credential. `Debug` is redacted so it can sit inside logged structs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// A resolved bind identity: the DN plus its decrypted credential.
#[derive(Debug, Clone)]
pub struct BindIdentity {
    pub dn: String,
    pub credential: Secret,
}

pub struct CredentialCipher {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Builds a cipher from a base64 encoded 32 byte key.
    pub fn from_base64(key: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| PoolError::Credential(format!("key is not valid base64: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            PoolError::Credential(format!("key must be {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Generates a fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| PoolError::Credential(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| PoolError::Credential(e.to_string()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Secret> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| PoolError::Credential(format!("encrypted value is not valid base64: {e}")))?;
        if data.len() <= NONCE_LEN {
            return Err(PoolError::Credential("encrypted value is too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| PoolError::Credential(e.to_string()))?;
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            // never echo the input, it is the secret
            .map_err(|_| PoolError::Credential("cannot decrypt credential, wrong key?".into()))?;

        String::from_utf8(plaintext)
            .map(Secret)
            .map_err(|_| PoolError::Credential("decrypted credential is not UTF-8".into()))
    }
}

/// Turns a configured identity into a [`BindIdentity`]. This is the single place where
/// encrypted credentials get decrypted.
pub fn resolve(
    what: &str,
    config: &CredentialConfig,
    cipher: Option<&CredentialCipher>,
) -> Result<BindIdentity> {
    let credential = match (&config.password, &config.password_encrypted) {
        (Some(_), Some(_)) => {
            return Err(PoolError::config(format!(
                "{what}: set either password or password_encrypted, not both"
            )))
        }
        (Some(plain), None) => Secret::new(plain.as_str()),
        (None, Some(encrypted)) => {
            let Some(cipher) = cipher else {
                return Err(PoolError::config(format!(
                    "{what}: password_encrypted needs [security] key or {KEY_ENV}"
                )));
            };
            cipher.decrypt(encrypted)?
        }
        (None, None) => {
            return Err(PoolError::config(format!("{what}: missing bind credential")));
        }
    };

    debug!("resolved bind identity for {what}: {}", config.bind_dn);

    Ok(BindIdentity {
        dn: config.bind_dn.clone(),
        credential,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::from_base64(&CredentialCipher::generate_key()).unwrap()
    }

    fn identity(password: Option<&str>, encrypted: Option<String>) -> CredentialConfig {
        CredentialConfig {
            bind_dn: "cn=Manager,dc=example,dc=com".to_string(),
            password: password.map(str::to_owned),
            password_encrypted: encrypted,
        }
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        let id = BindIdentity {
            dn: "cn=x".into(),
            credential: secret,
        };
        assert!(!format!("{id:?}").contains("hunter2"));
    }

    #[test]
    fn encrypted_credential_resolves() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("s3cret").unwrap();
        assert_ne!(encrypted, "s3cret");

        let id = resolve("admin", &identity(None, Some(encrypted)), Some(&cipher)).unwrap();
        assert_eq!(id.credential.expose(), "s3cret");
        assert_eq!(id.dn, "cn=Manager,dc=example,dc=com");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let encrypted = cipher().encrypt("s3cret").unwrap();
        let err = cipher().decrypt(&encrypted).unwrap_err();
        assert_eq!(err.code(), 101);
        assert!(!err.to_string().contains("s3cret"));
    }

    #[test]
    fn short_key_is_rejected() {
        let err = CredentialCipher::from_base64(&BASE64.encode([1u8; 16])).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn plaintext_and_encrypted_conflict() {
        let err = resolve("admin", &identity(Some("a"), Some("b".into())), None).unwrap_err();
        assert_eq!(err.code(), 100);
    }

    #[test]
    fn encrypted_without_key() {
        let err = resolve("log", &identity(None, Some("abc".into())), None).unwrap_err();
        assert!(err.to_string().contains("password_encrypted"));
    }

    #[test]
    fn missing_credential() {
        let err = resolve("admin", &identity(None, None), None).unwrap_err();
        assert!(err.to_string().contains("missing bind credential"));
    }
}
