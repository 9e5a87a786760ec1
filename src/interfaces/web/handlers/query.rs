use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use super::super::AppState;
use crate::core::bus::TOPIC_QUERY_INITIATED;
use crate::core::saga::worker::Envelope;
use crate::core::saga::{SagaRecord, SagaStatus};

#[derive(serde::Deserialize)]
pub struct QueryRequest {
    question: String,
}

/// Accept a question, create the saga in `pending`, publish the first stage
/// message, and return immediately. Clients poll the status endpoint.
pub async fn submit_query(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> impl IntoResponse {
    let question = payload.question.trim().to_string();
    if question.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "question must not be empty" })),
        );
    }

    let saga_id = uuid::Uuid::new_v4().to_string();
    info!(saga_id, tenant_id, "accepted query");

    let record = SagaRecord::new(saga_id.clone(), tenant_id.clone(), question);
    if let Err(e) = state.store.create(&record).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        );
    }

    let envelope = Envelope::new(&saga_id, &tenant_id);
    if let Err(e) = state
        .bus
        .publish(
            TOPIC_QUERY_INITIATED,
            serde_json::to_value(&envelope).unwrap_or_default(),
        )
        .await
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "saga_id": saga_id })),
    )
}

/// The saga record minus worker-internal fields.
fn public_view(record: &SagaRecord) -> serde_json::Value {
    serde_json::json!({
        "saga_id": record.saga_id,
        "tenant_id": record.tenant_id,
        "question": record.question,
        "status": record.status.as_str(),
        "generated_sql": record.generated_sql,
        "raw_results": record.raw_results,
        "formatted_response": record.formatted_response,
        "is_irrelevant": record.is_irrelevant,
        "error_message": record.error_message,
        "call_stack": record.call_stack,
        "total_duration_ms": record.total_duration_ms,
        "total_tokens": record.total_tokens,
    })
}

pub async fn query_status(
    Path(saga_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.store.get(&saga_id).await {
        Ok(Some(record)) => {
            let message = match record.status {
                SagaStatus::Completed => Some("Query completed"),
                SagaStatus::Error => Some("Query failed"),
                _ => None,
            };
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": record.status.as_str(),
                    "message": message,
                    "result": public_view(&record),
                })),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "not_found",
                "message": "Unknown or expired saga id",
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
