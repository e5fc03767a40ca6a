use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::ws::ws_handler;
use super::RelayAppState;
use crate::error::{AppError, ErrorResponse, Result};
use crate::signaling::ParticipantInfo;

/// Create the relay router
pub fn create_router(state: Arc<RelayAppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_path = state.config.get().relay.ws_path.clone();

    let public_routes = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/ice-servers", get(ice_servers))
        .route(&ws_path, any(ws_handler));

    // Moderation collaborator endpoints
    let admin_routes = Router::new()
        .route("/api/sessions/:id", get(session_members))
        .route("/api/sessions/:id/moderation", post(moderation))
        .route("/api/sessions/:id/block", post(block_participant))
        .layer(middleware::from_fn_with_state(state.clone(), admin_middleware));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Requires `Authorization: Bearer <relay.auth.admin_token>`
async fn admin_middleware(
    State(state): State<Arc<RelayAppState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.config.get().relay.auth.admin_token.clone();
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if admin_token_matches(expected.as_deref(), provided) {
        next.run(request).await
    } else {
        let body = ErrorResponse {
            success: false,
            message: "Not authenticated".to_string(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// An unset or empty admin token locks the endpoints
fn admin_token_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) if !expected.is_empty() => {
            bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
        }
        _ => false,
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
    pub connections: usize,
}

pub async fn health_check(State(state): State<Arc<RelayAppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.hub.session_count(),
        connections: state.hub.connection_count(),
    })
}

/// ICE server entry in the browser's `RTCIceServer` shape
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServerInfo>,
}

pub async fn ice_servers(State(state): State<Arc<RelayAppState>>) -> Json<IceServersResponse> {
    let config = state.config.get();
    let mut ice_servers: Vec<IceServerInfo> = config
        .ice
        .stun_servers
        .iter()
        .filter(|s| !s.is_empty())
        .map(|stun| IceServerInfo {
            urls: vec![stun.clone()],
            username: None,
            credential: None,
        })
        .collect();

    ice_servers.extend(config.ice.turn_servers.iter().map(|turn| IceServerInfo {
        urls: turn.urls.clone(),
        username: Some(turn.username.clone()),
        credential: Some(turn.credential.clone()),
    }));

    Json(IceServersResponse { ice_servers })
}

#[derive(Serialize)]
pub struct SessionMembersResponse {
    pub session_id: String,
    pub participants: Vec<ParticipantInfo>,
}

pub async fn session_members(
    State(state): State<Arc<RelayAppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMembersResponse>> {
    let participants = state.hub.members(&session_id);
    if participants.is_empty() {
        return Err(AppError::NotFound(format!("Session not found: {}", session_id)));
    }
    Ok(Json(SessionMembersResponse {
        session_id,
        participants,
    }))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationKind {
    Alert,
    Warning,
}

#[derive(Debug, Deserialize)]
pub struct ModerationRequest {
    pub kind: ModerationKind,
    pub message: String,
}

#[derive(Serialize)]
pub struct DeliveryResponse {
    pub success: bool,
    pub delivered: usize,
}

pub async fn moderation(
    State(state): State<Arc<RelayAppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ModerationRequest>,
) -> Json<DeliveryResponse> {
    let delivered = match req.kind {
        ModerationKind::Alert => state.hub.moderation_alert(&session_id, &req.message),
        ModerationKind::Warning => state.hub.moderation_warning(&session_id, &req.message),
    };
    tracing::info!(session_id = %session_id, kind = ?req.kind, delivered, "Moderation message forwarded");
    Json(DeliveryResponse {
        success: true,
        delivered,
    })
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub identity: String,
    pub reason: String,
}

pub async fn block_participant(
    State(state): State<Arc<RelayAppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<DeliveryResponse>> {
    if req.identity.is_empty() {
        return Err(AppError::BadRequest("identity is required".to_string()));
    }
    // Absent identities are still barred from joining later
    let present = state.hub.block(&session_id, &req.identity, &req.reason);
    Ok(Json(DeliveryResponse {
        success: true,
        delivered: usize::from(present),
    }))
}
