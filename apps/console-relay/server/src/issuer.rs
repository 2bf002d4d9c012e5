use std::sync::Arc;

use console_relay_core::{
    relay_path, ConsoleError, ConsoleKind, ConsoleSessionResponse, DisplayMetadata, ResourceRef,
    SessionId,
};
use metrics::counter;
use tracing::{info, warn};

use crate::{
    access::{Authorizer, User},
    cluster::ClusterApi,
    inventory::Connections,
    session::{ConsoleSession, SessionStore},
};

/// Turns an authorized console request into a short-lived relay session.
#[derive(Clone)]
pub struct SessionIssuer {
    authorizer: Arc<dyn Authorizer>,
    connections: Arc<Connections>,
    cluster: Arc<dyn ClusterApi>,
    store: SessionStore,
}

impl SessionIssuer {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        connections: Arc<Connections>,
        cluster: Arc<dyn ClusterApi>,
        store: SessionStore,
    ) -> Self {
        Self {
            authorizer,
            connections,
            cluster,
            store,
        }
    }

    pub async fn create(
        &self,
        user: &User,
        resource: ResourceRef,
        kind: ConsoleKind,
    ) -> Result<ConsoleSessionResponse, ConsoleError> {
        match self.issue(user, resource, kind).await {
            Ok(response) => {
                counter!("console_relay_sessions_issued_total", 1, "kind" => kind.as_str());
                Ok(response)
            }
            Err(err) => {
                counter!(
                    "console_relay_session_requests_failed_total",
                    1,
                    "reason" => err.metric_label()
                );
                Err(err)
            }
        }
    }

    async fn issue(
        &self,
        user: &User,
        resource: ResourceRef,
        kind: ConsoleKind,
    ) -> Result<ConsoleSessionResponse, ConsoleError> {
        // Nothing remote happens and nothing is stored before this check.
        if !self.authorizer.is_permitted(user, &resource) {
            warn!(user = %user.name, resource = %resource, "console access denied");
            return Err(ConsoleError::AuthorizationDenied);
        }

        let target = self
            .connections
            .get(&resource.connection_id)
            .ok_or_else(|| {
                ConsoleError::ResourceNotFound(format!("connection {}", resource.connection_id))
            })?;

        let ticket = self
            .cluster
            .issue_ticket(&target, &resource, kind)
            .await
            .map_err(ConsoleError::from)?;

        let session_id = SessionId::generate();
        let session = ConsoleSession::new(
            session_id.clone(),
            target,
            ticket.endpoint,
            resource.clone(),
            kind,
            ticket.port,
            ticket.ticket,
            self.store.ttl(),
        );
        let expires_at = session.created_at + self.store.ttl();
        self.store.put(session);

        info!(
            session_id = %session_id,
            user = %user.name,
            resource = %resource,
            console_kind = kind.as_str(),
            "console session issued"
        );

        Ok(ConsoleSessionResponse {
            relay_path: relay_path(&session_id),
            session_id,
            expires_at,
            display: DisplayMetadata {
                title: resource.title(),
                connection_id: resource.connection_id,
                node: resource.node,
                resource_type: resource.resource_type,
                resource_id: resource.resource_id,
                console_kind: kind,
            },
        })
    }
}
