use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::resource::{ConsoleKind, ResourceKind};

const SESSION_ID_BYTES: usize = 32;
/// Length of a base64url (unpadded) encoding of `SESSION_ID_BYTES`.
const SESSION_ID_LEN: usize = 43;

/// Opaque, unguessable identifier of a console session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Draws a fresh id from the operating system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        SessionId(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Validates an id taken from an untrusted request path.
    pub fn parse(raw: &str) -> Result<Self, SessionIdError> {
        if raw.len() != SESSION_ID_LEN {
            return Err(SessionIdError::Length(raw.len()));
        }
        let decoded = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| SessionIdError::Encoding)?;
        if decoded.len() != SESSION_ID_BYTES {
            return Err(SessionIdError::Length(raw.len()));
        }
        Ok(SessionId(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id has unexpected length {0}")]
    Length(usize),
    #[error("session id is not base64url")]
    Encoding,
}

/// What a console widget needs to render itself. Deliberately carries no
/// ticket and no service credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    pub connection_id: String,
    pub node: String,
    pub resource_type: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<u32>,
    pub console_kind: ConsoleKind,
    pub title: String,
}

/// Body returned by the session creation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSessionResponse {
    pub session_id: SessionId,
    pub relay_path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub display: DisplayMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn generated_ids_are_unique_and_parse_back() {
        let first = SessionId::generate();
        let second = SessionId::generate();
        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), SESSION_ID_LEN);
        assert_eq!(SessionId::parse(first.as_str()).unwrap(), first);
    }

    #[test_timeout::timeout]
    fn rejects_malformed_ids() {
        assert_eq!(SessionId::parse(""), Err(SessionIdError::Length(0)));
        assert_eq!(SessionId::parse("short"), Err(SessionIdError::Length(5)));
        let bad_alphabet = "!".repeat(SESSION_ID_LEN);
        assert_eq!(SessionId::parse(&bad_alphabet), Err(SessionIdError::Encoding));
    }

    #[test_timeout::timeout]
    fn relay_path_embeds_id() {
        let id = SessionId::generate();
        assert_eq!(crate::relay_path(&id), format!("/ws/console/{}", id));
    }
}
