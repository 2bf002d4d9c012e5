mod auth;
mod console;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use console_relay_core::ConsoleError;
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{relay::console_ws_handler, state::AppState};

pub use auth::AuthenticatedUser;
pub use console::{create_guest_console, create_node_console, ConsoleRequest};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/connections/:connection_id/nodes/:node/console",
            post(create_node_console),
        )
        .route(
            "/api/connections/:connection_id/nodes/:node/:resource_type/:resource_id/console",
            post(create_guest_console),
        )
        .route("/ws/console/:session_id", get(console_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
}

impl From<ConsoleError> for ApiError {
    fn from(err: ConsoleError) -> Self {
        match err {
            ConsoleError::AuthorizationDenied => ApiError::Forbidden("console access denied"),
            ConsoleError::ResourceNotFound(what) => ApiError::NotFound(what),
            ConsoleError::SessionInvalid => ApiError::NotFound(err.to_string()),
            ConsoleError::UpstreamUnavailable(_)
            | ConsoleError::UpstreamHandshakeFailed(_)
            | ConsoleError::DiscoveryFailed(_) => ApiError::BadGateway(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", Some(msg.to_string())),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::BadGateway(msg) => {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable", Some(msg))
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}
