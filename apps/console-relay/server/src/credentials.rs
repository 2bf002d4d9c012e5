//! Long-lived service credentials for cluster connections.
//!
//! Secrets live in the inventory only in sealed form: base64 of
//! `nonce || ChaCha20-Poly1305(secret)`, with the connection id as associated
//! data so a sealed value cannot be replayed under another connection. They
//! are opened on every use and never cached.

use std::{collections::HashMap, fmt};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential key must be 32 bytes of base64")]
    InvalidKey,
    #[error("no credential configured for connection {0}")]
    UnknownConnection(String),
    #[error("sealed credential is malformed")]
    Malformed,
    #[error("invalid base64 encoding")]
    Base64(#[from] base64::DecodeError),
    #[error("encryption failure")]
    Seal(#[source] chacha20poly1305::aead::Error),
    #[error("decryption failure")]
    Open(#[source] chacha20poly1305::aead::Error),
    #[error("credential is not valid utf-8")]
    Utf8,
}

/// Process-wide key used to open sealed secrets.
#[derive(Clone)]
pub struct SealingKey([u8; KEY_LEN]);

impl SealingKey {
    pub fn from_base64(value: &str) -> Result<Self, CredentialError> {
        let bytes = BASE64_STANDARD
            .decode(value.trim())
            .map_err(|_| CredentialError::InvalidKey)?;
        if bytes.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey);
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Seals `secret` for `connection_id`, producing the inventory form.
    pub fn seal(&self, connection_id: &str, secret: &str) -> Result<String, CredentialError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret.as_bytes(),
                    aad: connection_id.as_bytes(),
                },
            )
            .map_err(CredentialError::Seal)?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(envelope))
    }

    pub fn open(&self, connection_id: &str, sealed: &str) -> Result<String, CredentialError> {
        let envelope = BASE64_STANDARD.decode(sealed.trim())?;
        if envelope.len() <= NONCE_LEN {
            return Err(CredentialError::Malformed);
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: connection_id.as_bytes(),
                },
            )
            .map_err(CredentialError::Open)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::Utf8)
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealingKey(<redacted>)")
    }
}

/// An opened API token. Lives for the duration of one outbound request.
#[derive(Clone)]
pub struct ServiceCredential {
    pub token_id: String,
    secret: String,
}

impl ServiceCredential {
    pub fn new(token_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            secret: secret.into(),
        }
    }

    /// Value of the `Authorization` header expected by the cluster manager.
    pub fn authorization_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.secret)
    }
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("token_id", &self.token_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    fn reveal(&self, connection_id: &str) -> Result<ServiceCredential, CredentialError>;
}

struct SealedEntry {
    token_id: String,
    sealed_secret: String,
}

/// Credential store backed by sealed inventory entries.
pub struct SealedCredentialStore {
    key: SealingKey,
    entries: HashMap<String, SealedEntry>,
}

impl SealedCredentialStore {
    pub fn new(key: SealingKey) -> Self {
        Self {
            key,
            entries: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        connection_id: impl Into<String>,
        token_id: impl Into<String>,
        sealed_secret: impl Into<String>,
    ) {
        self.entries.insert(
            connection_id.into(),
            SealedEntry {
                token_id: token_id.into(),
                sealed_secret: sealed_secret.into(),
            },
        );
    }
}

impl CredentialStore for SealedCredentialStore {
    fn reveal(&self, connection_id: &str) -> Result<ServiceCredential, CredentialError> {
        let entry = self
            .entries
            .get(connection_id)
            .ok_or_else(|| CredentialError::UnknownConnection(connection_id.to_owned()))?;
        let secret = self.key.open(connection_id, &entry.sealed_secret)?;
        Ok(ServiceCredential::new(entry.token_id.clone(), secret))
    }
}
