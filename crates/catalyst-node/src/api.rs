//! HTTP API for the Catalyst node.
//!
//! The peer-facing half mirrors what `ActivePeerClient` consumes; the rest is
//! for operators.

use crate::node::NodeState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use catalyst_cluster::{
    AuditInfo, ChallengeResponse, Entity, PeerSyncState, ServerRecord, StatusResponse,
};
use catalyst_history::{
    now_millis, DeploymentFilters, DeploymentStatus, EntityType, FailedDeploymentRecord,
    HistoryPage, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type AppState = Arc<NodeState>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Peer surface
        .route("/status", get(status))
        .route("/challenge", get(challenge))
        .route("/deployments", get(list_deployments))
        .route("/entities/:entity_type", get(get_entities))
        .route("/audit/:entity_type/:entity_id", get(get_audit))
        .route("/contents/:hash", get(get_content))
        // Operator surface
        .route("/failed-deployments", get(list_failed_deployments))
        .route(
            "/failed-deployments/:entity_type/:entity_id/retry",
            post(retry_failed_deployment),
        )
        .route("/peers", get(list_peers))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn internal_error(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn parse_entity_type(raw: &str) -> Result<EntityType, StatusCode> {
    raw.parse().map_err(|_| StatusCode::BAD_REQUEST)
}

// --- Health ---

async fn health() -> &'static str {
    "OK"
}

// --- Peer surface ---

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        name: state.server_name.clone(),
        current_time: now_millis(),
    })
}

async fn challenge(State(state): State<AppState>) -> Json<ChallengeResponse> {
    Json(ChallengeResponse {
        challenge_text: state.challenge.challenge_text().to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    from: Option<Timestamp>,
    to: Option<Timestamp>,
    server_name: Option<String>,
    entity_type: Option<EntityType>,
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, StatusCode> {
    let filters = DeploymentFilters {
        from: query.from,
        to: query.to,
        server_name: query.server_name,
        entity_type: query.entity_type,
    };
    let page = state
        .history
        .read()
        .await
        .query(filters, query.offset.unwrap_or(0), query.limit)
        .map_err(internal_error)?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct EntityQuery {
    id: Option<String>,
}

async fn get_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(query): Query<EntityQuery>,
) -> Result<Json<Vec<Entity>>, StatusCode> {
    let entity_type = parse_entity_type(&entity_type)?;
    let Some(id) = query.id else {
        return Ok(Json(Vec::new()));
    };

    let entity = state
        .deployer
        .entity(entity_type, &id)
        .map_err(internal_error)?;
    Ok(Json(entity.into_iter().collect()))
}

async fn get_audit(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<AuditInfo>, StatusCode> {
    let entity_type = parse_entity_type(&entity_type)?;
    match state.deployer.audit_info(entity_type, &entity_id) {
        Ok(Some(audit)) => Ok(Json(audit)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal_error(e)),
    }
}

async fn get_content(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<([(header::HeaderName, &'static str); 1], Vec<u8>), StatusCode> {
    match state.deployer.content(&hash) {
        Ok(Some(data)) => Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal_error(e)),
    }
}

// --- Operator surface ---

async fn list_failed_deployments(
    State(state): State<AppState>,
) -> Result<Json<Vec<FailedDeploymentRecord>>, StatusCode> {
    state.failed.all().map(Json).map_err(internal_error)
}

async fn retry_failed_deployment(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<DeploymentStatus>, StatusCode> {
    let entity_type = parse_entity_type(&entity_type)?;
    match state.synchronizer.retry_failed(entity_type, &entity_id).await {
        Ok(status) => Ok(Json(status)),
        Err(catalyst_cluster::Error::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal_error(e)),
    }
}

/// Cluster view: our own record (once known) and every active peer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeersResponse {
    own_record: Option<ServerRecord>,
    members: usize,
    peers: Vec<PeerSyncState>,
}

async fn list_peers(State(state): State<AppState>) -> Json<PeersResponse> {
    let synchronizer = &state.synchronizer;
    Json(PeersResponse {
        own_record: synchronizer.own_record().await,
        members: synchronizer.membership().await.len(),
        peers: synchronizer.peer_states().await,
    })
}
