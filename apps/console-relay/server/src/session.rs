use std::{fmt, sync::Arc, time::Duration};

use console_relay_core::{ConsoleKind, ResourceRef, SessionId};
use dashmap::DashMap;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

use crate::inventory::{ConnectionTarget, Endpoint};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A single-use console grant waiting for its relay connection.
#[derive(Clone)]
pub struct ConsoleSession {
    pub session_id: SessionId,
    pub target: Arc<ConnectionTarget>,
    /// Cluster address that issued the ticket; the relay dials the same one.
    pub endpoint: Endpoint,
    pub resource: ResourceRef,
    pub console_kind: ConsoleKind,
    pub proxy_port: u16,
    ticket: String,
    pub created_at: OffsetDateTime,
    pub expires_at: Instant,
}

impl ConsoleSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        target: Arc<ConnectionTarget>,
        endpoint: Endpoint,
        resource: ResourceRef,
        console_kind: ConsoleKind,
        proxy_port: u16,
        ticket: String,
        ttl: Duration,
    ) -> Self {
        Self {
            session_id,
            target,
            endpoint,
            resource,
            console_kind,
            proxy_port,
            ticket,
            created_at: OffsetDateTime::now_utc(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.target.id)
            .field("endpoint", &self.endpoint)
            .field("resource", &self.resource)
            .field("console_kind", &self.console_kind)
            .field("proxy_port", &self.proxy_port)
            .field("ticket", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Process-wide map of issued sessions. Cloning yields another handle to the
/// same map.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

struct SessionStoreInner {
    sessions: DashMap<SessionId, ConsoleSession>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: DashMap::new(),
                config,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.config.ttl
    }

    pub fn put(&self, session: ConsoleSession) {
        self.inner
            .sessions
            .insert(session.session_id.clone(), session);
        gauge!("console_relay_sessions_pending", self.len() as f64);
    }

    /// Removes and returns the session if it is still live.
    ///
    /// Removal happens under the shard lock, so of any number of concurrent
    /// callers at most one receives the record. Expiry is checked after
    /// removal: an expired record is dropped and reported as absent.
    pub fn consume(&self, session_id: &SessionId) -> Option<ConsoleSession> {
        let Some((_, session)) = self.inner.sessions.remove(session_id) else {
            counter!("console_relay_session_consume_total", 1, "outcome" => "miss");
            return None;
        };
        gauge!("console_relay_sessions_pending", self.len() as f64);

        if session.is_expired(Instant::now()) {
            counter!("console_relay_session_consume_total", 1, "outcome" => "expired");
            debug!(session_id = %session_id, "dropping expired console session");
            return None;
        }

        counter!("console_relay_session_consume_total", 1, "outcome" => "hit");
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Drops every session past its deadline. Only bounds memory; `consume`
    /// never relies on it.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.inner.sessions.len();
        self.inner
            .sessions
            .retain(|_, session| !session.is_expired(now));
        let purged = before.saturating_sub(self.inner.sessions.len());
        if purged > 0 {
            counter!("console_relay_sessions_purged_total", purged as u64);
            gauge!("console_relay_sessions_pending", self.len() as f64);
        }
        purged
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let purged = store.purge_expired(Instant::now());
                if purged > 0 {
                    debug!(purged, "swept expired console sessions");
                }
            }
        })
    }
}
