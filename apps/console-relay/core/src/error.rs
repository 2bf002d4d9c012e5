use thiserror::Error;

/// Failures surfaced by the broker, either to HTTP callers or to the relay
/// log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("console access denied")]
    AuthorizationDenied,
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("cluster manager unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("console session missing, expired, or already used")]
    SessionInvalid,
    #[error("upstream console handshake failed: {0}")]
    UpstreamHandshakeFailed(String),
    #[error("no reachable cluster address: {0}")]
    DiscoveryFailed(String),
}

impl ConsoleError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ConsoleError::AuthorizationDenied => "authorization_denied",
            ConsoleError::ResourceNotFound(_) => "resource_not_found",
            ConsoleError::UpstreamUnavailable(_) => "upstream_unavailable",
            ConsoleError::SessionInvalid => "session_invalid",
            ConsoleError::UpstreamHandshakeFailed(_) => "upstream_handshake_failed",
            ConsoleError::DiscoveryFailed(_) => "discovery_failed",
        }
    }
}
