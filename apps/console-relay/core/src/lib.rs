//! Core primitives shared by the console broker and its relay.
//!
//! The server crate owns all runtime state; this crate only carries the wire
//! shapes handed to callers and the error taxonomy, so tooling that talks to
//! the broker can depend on a single source of truth without pulling in the
//! HTTP stack.

pub mod error;
pub mod resource;
pub mod session;

pub use error::ConsoleError;
pub use resource::{ConsoleKind, ResourceKind, ResourceRef, UnknownResourceKind};
pub use session::{ConsoleSessionResponse, DisplayMetadata, SessionId, SessionIdError};

use serde::{Deserialize, Serialize};

/// How the relay should treat the TLS certificate presented by a cluster
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Verified,
    SelfSigned,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Verified
    }
}

impl TlsMode {
    /// Whether certificate verification has to be skipped for this connection.
    pub fn accepts_invalid_certs(self) -> bool {
        matches!(self, TlsMode::SelfSigned)
    }
}

/// Relay path handed to callers for a freshly issued session.
pub fn relay_path(session_id: &SessionId) -> String {
    format!("/ws/console/{}", session_id)
}
