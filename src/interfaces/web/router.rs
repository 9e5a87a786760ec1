use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers::{kb, query, registry};
use super::AppState;

pub fn build_api_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route(
            "/api/tenants/{tenant_id}/query",
            post(query::submit_query),
        )
        .route("/api/query/{saga_id}", get(query::query_status))
        .route(
            "/api/tenants/{tenant_id}/kb/upload",
            post(kb::upload_document),
        )
        .route(
            "/api/tenants/{tenant_id}/kb/documents/{filename}",
            axum::routing::delete(kb::delete_document),
        )
        .route("/api/kb/ask", post(kb::ask))
        .route("/register", post(registry::register_server))
        .route("/servers", get(registry::list_servers))
        .route("/health", get(registry::health))
        .layer(cors)
        .with_state(state)
}
