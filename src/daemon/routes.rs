//! REST API route handlers for the roster HTTP server
//!
//! Thin adapter over [`PeerRegistry`]; every handler maps one registry
//! operation and converts its error into a status code.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::RosterError;
use crate::registry::{PeerGroups, PeerRegistry, PeerView};

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: PeerRegistry,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub error: String,
}

impl From<RosterError> for ApiError {
    fn from(e: RosterError) -> Self {
        let (status, code) = match &e {
            RosterError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            RosterError::DuplicateName { .. } => (StatusCode::CONFLICT, "duplicate_name"),
            RosterError::InvalidName { .. } => (StatusCode::BAD_REQUEST, "invalid_name"),
            RosterError::SubnetExhausted { .. } => (StatusCode::CONFLICT, "subnet_exhausted"),
            RosterError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            RosterError::System(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", e);
        }
        Self {
            status,
            code,
            error: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Build the API router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/clients", get(handle_list_peers))
        .route("/api/clients", post(handle_create_peer))
        .route("/api/clients/ping", post(handle_refresh_liveness))
        .route("/api/clients/:name", delete(handle_delete_peer))
        .route("/api/clients/:name/config", get(handle_client_config))
        // SSE events stream
        .route("/api/events", get(handle_events_sse))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerRequest {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// `?isAdmin=` selector for name-addressed routes
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleQuery {
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Serialize)]
pub struct DeletePeerResponse {
    pub deleted: bool,
    pub name: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/clients - List peers with their last known liveness
pub async fn handle_list_peers(State(state): State<AppState>) -> Result<Json<PeerGroups>, ApiError> {
    Ok(Json(state.registry.list_peers().await?))
}

/// POST /api/clients/ping - Probe every peer, then list
pub async fn handle_refresh_liveness(
    State(state): State<AppState>,
) -> Result<Json<PeerGroups>, ApiError> {
    Ok(Json(state.registry.refresh_liveness().await?))
}

/// POST /api/clients - Provision a new peer
pub async fn handle_create_peer(
    State(state): State<AppState>,
    Json(request): Json<CreatePeerRequest>,
) -> Result<(StatusCode, Json<PeerView>), ApiError> {
    let peer = state
        .registry
        .create_peer(&request.name, request.is_admin)
        .await?;
    Ok((StatusCode::CREATED, Json(peer)))
}

/// DELETE /api/clients/:name?isAdmin= - Remove a peer
pub async fn handle_delete_peer(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RoleQuery>,
) -> Result<Json<DeletePeerResponse>, ApiError> {
    state.registry.delete_peer(&name, query.is_admin).await?;
    Ok(Json(DeletePeerResponse {
        deleted: true,
        name,
    }))
}

/// GET /api/clients/:name/config?isAdmin= - Download a client document
pub async fn handle_client_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RoleQuery>,
) -> Result<Response, ApiError> {
    let document = state.registry.client_config(&name, query.is_admin).await?;
    let disposition = format!(
        "attachment; filename=\"{}.conf\"",
        name.replace(['"', '\\'], "_")
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document,
    )
        .into_response())
}

// ============================================================================
// Server-Sent Events
// ============================================================================

/// GET /api/events - SSE stream of registry notifications
pub async fn handle_events_sse(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.registry.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(msg) => Some(Ok(Event::default().data(msg))),
        Err(e) => {
            tracing::debug!("SSE subscriber lagged: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
