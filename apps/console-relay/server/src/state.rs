use std::sync::Arc;

use axum::extract::FromRef;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    access::AccessPolicy, issuer::SessionIssuer, relay::RelayState, session::SessionStore,
};

/// Handles shared by every request. Each field is a cheap clone of a
/// process-wide registry built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub issuer: SessionIssuer,
    pub policy: Arc<AccessPolicy>,
    pub relay: RelayState,
    pub sessions: SessionStore,
    pub metrics: PrometheusHandle,
}

impl FromRef<AppState> for RelayState {
    fn from_ref(state: &AppState) -> Self {
        state.relay.clone()
    }
}
