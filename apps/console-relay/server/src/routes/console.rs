use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use console_relay_core::{ConsoleKind, ConsoleSessionResponse, ResourceKind, ResourceRef};
use serde::Deserialize;
use tracing::warn;

use super::{ApiError, ApiResult, AuthenticatedUser};
use crate::{access::User, state::AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleRequest {
    #[serde(default)]
    pub kind: Option<ConsoleKind>,
}

pub async fn create_guest_console(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path((connection_id, node, resource_type, resource_id)): Path<(String, String, String, String)>,
    body: Bytes,
) -> ApiResult<ConsoleSessionResponse> {
    let resource_type = resource_type
        .parse::<ResourceKind>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if resource_type == ResourceKind::Node {
        return Err(ApiError::BadRequest(
            "node shells are opened through /nodes/{node}/console".into(),
        ));
    }
    let resource_id = resource_id
        .parse::<u32>()
        .map_err(|_| ApiError::BadRequest(format!("invalid resource id {resource_id:?}")))?;

    let resource = ResourceRef::guest(connection_id, node, resource_type, resource_id);
    let kind = requested_kind(&body, resource_type)?;
    open_console(state, user, resource, kind).await
}

pub async fn create_node_console(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path((connection_id, node)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<ConsoleSessionResponse> {
    let resource = ResourceRef::node_shell(connection_id, node);
    let kind = requested_kind(&body, ResourceKind::Node)?;
    open_console(state, user, resource, kind).await
}

async fn open_console(
    state: AppState,
    user: User,
    resource: ResourceRef,
    kind: ConsoleKind,
) -> ApiResult<ConsoleSessionResponse> {
    state
        .issuer
        .create(&user, resource.clone(), kind)
        .await
        .map(Json)
        .map_err(|err| {
            warn!(
                user = %user.name,
                resource = %resource,
                error = %err,
                "console session request failed"
            );
            ApiError::from(err)
        })
}

/// An empty body asks for the resource's default console.
fn requested_kind(body: &[u8], resource_type: ResourceKind) -> Result<ConsoleKind, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(resource_type.default_console());
    }
    let request: ConsoleRequest =
        serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(request
        .kind
        .unwrap_or_else(|| resource_type.default_console()))
}
