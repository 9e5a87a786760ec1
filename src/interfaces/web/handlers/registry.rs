use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::super::AppState;

#[derive(serde::Deserialize)]
pub struct RegisterRequest {
    role: String,
    endpoint: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// Tool servers call this on startup and on their 30s heartbeat.
pub async fn register_server(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> impl IntoResponse {
    state
        .registry
        .register(&payload.role, &payload.endpoint, payload.capabilities)
        .await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "role": payload.role })),
    )
}

#[derive(serde::Deserialize)]
pub struct ServersQuery {
    role: Option<String>,
}

pub async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<ServersQuery>,
) -> impl IntoResponse {
    let servers = state.registry.servers(query.role.as_deref()).await;
    Json(servers)
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
