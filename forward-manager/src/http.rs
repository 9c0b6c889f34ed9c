use crate::core::{
    scoped_cluster_name, PortForwardRequest, Session, SessionSummary, StopOrDeleteRequest,
};
use crate::{auth, manager::PortForwardManager, ports};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

/// Header scoping registry keys to one caller of a shared cluster.
pub const USER_ID_HEADER: &str = "X-HEADLAMP-USER-ID";

pub fn router(manager: PortForwardManager) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/clusters/{cluster}/portforward",
            post(start_port_forward)
                .delete(stop_or_delete_port_forward)
                .get(get_port_forward_by_id),
        )
        .route(
            "/clusters/{cluster}/portforward/list",
            get(list_port_forwards),
        )
        .with_state(manager)
}

/// Error surface of the HTTP handlers; bodies are plain text.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or incomplete request.
    InvalidRequest(String),
    /// 404 - No session with the requested id.
    NotFound(String),
    /// 500 - Free-port allocation failed.
    PortAllocation(String),
    /// 500 - Session start failed (config, permission, init, or readiness).
    StartFailed(String),
    /// 500 - Stop or delete failed.
    StopFailed(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::PortAllocation(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("can't find any available port {message}"),
            ),
            Self::StartFailed(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            Self::StopFailed(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to delete port forward {message}"),
            ),
        };
        (status, message).into_response()
    }
}

fn user_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Fills the server-generated defaults: a fresh universally-unique id when
/// none was supplied, and a free local port when none was requested.
/// Supplied values pass through untouched.
fn prepare_request(request: &mut PortForwardRequest) -> Result<(), ApiError> {
    if request.id.is_empty() {
        request.id = Uuid::new_v4().to_string();
    }
    request
        .validate()
        .map_err(|error| ApiError::InvalidRequest(error.to_string()))?;

    if request.port.is_empty() {
        let port = ports::free_local_port().map_err(|error| {
            error!(%error, "allocating local port");
            ApiError::PortAllocation(error.to_string())
        })?;
        request.port = port.to_string();
    }

    Ok(())
}

async fn start_port_forward(
    State(manager): State<PortForwardManager>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
    Json(mut request): Json<PortForwardRequest>,
) -> Result<Json<Session>, ApiError> {
    prepare_request(&mut request)?;

    let token = auth::token_from_cookie(&headers, &cluster);
    let scoped_cluster = scoped_cluster_name(&cluster, user_id(&headers));

    let session = manager
        .start(&scoped_cluster, &request, token.as_deref())
        .await
        .map_err(|start_error| {
            error!(
                cluster = %scoped_cluster,
                id = %request.id,
                %start_error,
                "starting portforward",
            );
            ApiError::StartFailed(start_error.to_string())
        })?;

    Ok(Json(session))
}

async fn stop_or_delete_port_forward(
    State(manager): State<PortForwardManager>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
    Json(request): Json<StopOrDeleteRequest>,
) -> Result<&'static str, ApiError> {
    request
        .validate()
        .map_err(|error| ApiError::InvalidRequest(error.to_string()))?;

    let scoped_cluster = scoped_cluster_name(&cluster, user_id(&headers));
    manager
        .stop_or_delete(&scoped_cluster, &request.id, request.stop_or_delete)
        .map_err(|not_found| {
            error!(cluster = %scoped_cluster, id = %request.id, "stopping portforward");
            ApiError::StopFailed(not_found.to_string())
        })?;

    Ok("stopped")
}

async fn list_port_forwards(
    State(manager): State<PortForwardManager>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ApiError> {
    if cluster.is_empty() {
        return Err(ApiError::InvalidRequest("cluster is required".to_string()));
    }

    let scoped_cluster = scoped_cluster_name(&cluster, user_id(&headers));
    Ok(Json(manager.list(&scoped_cluster)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetByIdParams {
    id: String,
}

async fn get_port_forward_by_id(
    State(manager): State<PortForwardManager>,
    Path(cluster): Path<String>,
    Query(params): Query<GetByIdParams>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>, ApiError> {
    if cluster.is_empty() {
        return Err(ApiError::InvalidRequest("cluster is required".to_string()));
    }
    if params.id.is_empty() {
        return Err(ApiError::InvalidRequest("id is required".to_string()));
    }

    let scoped_cluster = scoped_cluster_name(&cluster, user_id(&headers));
    let session = manager.get(&scoped_cluster, &params.id).map_err(|_| {
        ApiError::NotFound(format!("no portforward running with id {}", params.id))
    })?;

    Ok(Json(SessionSummary::from(&session)))
}
