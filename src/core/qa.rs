use std::sync::Arc;
use tracing::info;

use crate::core::error::SagaError;
use crate::core::kb::vector::VectorStore;
use crate::core::llm::{ChatMessage, LlmClient};

pub const RETRIEVAL_TOP_K: usize = 4;

#[derive(Debug, Clone, serde::Serialize)]
pub struct QaAnswer {
    pub answer: String,
    pub context: Vec<String>,
}

/// Single-shot retrieval Q&A: embed the query, pull the nearest chunks from
/// the tenant's collection, and synthesize an answer with no tools. Runs
/// beside the saga pipeline, not through it.
pub async fn answer_from_knowledge_base(
    llm: Arc<dyn LlmClient>,
    vectors: Arc<dyn VectorStore>,
    tenant_id: &str,
    query: &str,
) -> Result<QaAnswer, SagaError> {
    let embedding = llm
        .embed(&[query.to_string()])
        .await
        .map_err(|e| SagaError::Llm(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| SagaError::Llm("embedder returned no vector".to_string()))?;

    let hits = vectors
        .search(tenant_id, &embedding, RETRIEVAL_TOP_K)
        .await
        .map_err(|e| SagaError::StateStoreUnavailable(e.to_string()))?;
    if hits.is_empty() {
        return Err(SagaError::NoContextAvailable);
    }

    let context: Vec<String> = hits.into_iter().map(|h| h.record.text).collect();
    info!(tenant_id, retrieved = context.len(), "answering from knowledge base");

    let prompt = format!(
        "Answer the question using only the provided business context.\n\n\
         Question: {query}\n\nContext:\n{}\n\n\
         If the context does not cover the question, say so plainly.",
        context
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] {}", i + 1, c))
            .collect::<Vec<_>>()
            .join("\n")
    );

    let output = llm
        .generate(
            &[
                ChatMessage::system("You answer questions from a business knowledge base."),
                ChatMessage::user(prompt),
            ],
            &[],
        )
        .await
        .map_err(|e| SagaError::Llm(e.to_string()))?;

    Ok(QaAnswer {
        answer: output.text,
        context,
    })
}
