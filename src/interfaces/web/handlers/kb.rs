use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use super::super::AppState;
use crate::core::bus::TOPIC_KB_INGEST;
use crate::core::error::SagaError;
use crate::core::qa::answer_from_knowledge_base;

/// Accept a multipart document upload and enqueue it for ingestion. The
/// response returns before chunking and embedding happen.
pub async fn upload_document(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut filename = None;
    let mut content = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            filename = field.file_name().map(|s| s.to_string());
            content = field
                .bytes()
                .await
                .ok()
                .map(|b| String::from_utf8_lossy(&b).to_string());
        }
    }

    let (Some(filename), Some(content)) = (filename, content) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "multipart field 'file' is required" })),
        );
    };

    let file_id = uuid::Uuid::new_v4().to_string();
    info!(tenant_id, filename, file_id, "queueing document for ingestion");

    let message = serde_json::json!({
        "action": "add",
        "tenant_id": tenant_id,
        "filename": filename,
        "content": content,
    });
    if let Err(e) = state.bus.publish(TOPIC_KB_INGEST, message).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "file_id": file_id })),
    )
}

pub async fn delete_document(
    Path((tenant_id, filename)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let message = serde_json::json!({
        "action": "delete",
        "tenant_id": tenant_id,
        "filename": filename,
    });
    match state.bus.publish(TOPIC_KB_INGEST, message).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "queued" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(serde::Deserialize)]
pub struct AskRequest {
    tenant_id: String,
    query: String,
}

/// Synchronous retrieval-only Q&A against the tenant's knowledge base.
pub async fn ask(
    State(state): State<AppState>,
    Json(payload): Json<AskRequest>,
) -> impl IntoResponse {
    match answer_from_knowledge_base(
        state.llm.clone(),
        state.vectors.clone(),
        &payload.tenant_id,
        &payload.query,
    )
    .await
    {
        Ok(answer) => (StatusCode::OK, Json(serde_json::json!(answer))),
        Err(SagaError::NoContextAvailable) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "NoContextAvailable",
                "message": "No documents indexed for this tenant yet",
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
