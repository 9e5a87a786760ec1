pub mod chunker;
pub mod vector;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::core::bus::{MessageBus, TOPIC_KB_INGEST};
use crate::core::llm::LlmClient;
use chunker::{semantic_chunks, ChunkerConfig};
use vector::{ChunkRecord, VectorStore};

const REQUEUE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum IngestMessage {
    Add {
        tenant_id: String,
        filename: String,
        content: String,
    },
    Delete {
        tenant_id: String,
        filename: String,
    },
}

/// Pull the indexable text out of an uploaded document. Formats are decided
/// by extension; everything the engine accepts today is text-shaped, so
/// unknown extensions fall through as plain text.
pub fn extract_text(filename: &str, content: &str) -> String {
    let extension = filename.rsplit('.').next().unwrap_or_default().to_lowercase();
    match extension.as_str() {
        "md" | "markdown" => {
            // Drop heading markers and emphasis so chunks read as prose.
            content
                .lines()
                .map(|line| line.trim_start_matches('#').trim())
                .collect::<Vec<_>>()
                .join("\n")
        }
        "csv" => content.replace(',', ", "),
        _ => content.to_string(),
    }
}

/// Consumes `kb.ingest` messages: extract text, chunk semantically, and
/// upsert the chunks into the tenant's collection. Runs beside the saga
/// workers but writes the collection stage 1 later reads through the KB
/// tool.
pub struct KbIngestor {
    bus: Arc<dyn MessageBus>,
    llm: Arc<dyn LlmClient>,
    vectors: Arc<dyn VectorStore>,
}

impl KbIngestor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        llm: Arc<dyn LlmClient>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self { bus, llm, vectors }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut consumer = self.bus.subscribe(TOPIC_KB_INGEST).await;
            while let Some(delivery) = consumer.next().await {
                match self.handle(delivery.payload.clone()).await {
                    Ok(()) => consumer.ack(&delivery).await,
                    Err(e) => {
                        error!(error = %e, attempt = delivery.attempt, "kb ingestion failed");
                        consumer.nack(&delivery, REQUEUE_DELAY).await;
                    }
                }
            }
        })
    }

    pub async fn handle(&self, payload: serde_json::Value) -> Result<()> {
        let message: IngestMessage = serde_json::from_value(payload)
            .map_err(|e| anyhow!("malformed ingest message: {e}"))?;

        match message {
            IngestMessage::Add {
                tenant_id,
                filename,
                content,
            } => {
                let text = extract_text(&filename, &content);
                let chunks =
                    semantic_chunks(self.llm.as_ref(), &text, ChunkerConfig::default()).await?;
                info!(
                    tenant_id,
                    filename,
                    chunks = chunks.len(),
                    "indexing document"
                );

                // Replace any earlier version of this document wholesale.
                self.vectors.delete_document(&tenant_id, &filename).await?;
                let records: Vec<ChunkRecord> = chunks
                    .into_iter()
                    .enumerate()
                    .map(|(ordinal, chunk)| ChunkRecord {
                        chunk_id: format!("{tenant_id}/{filename}#{ordinal}"),
                        tenant_id: tenant_id.clone(),
                        source_doc: filename.clone(),
                        text: chunk.text,
                        embedding: chunk.embedding,
                        ordinal,
                    })
                    .collect();
                self.vectors.upsert(records).await?;
                Ok(())
            }
            IngestMessage::Delete {
                tenant_id,
                filename,
            } => {
                info!(tenant_id, filename, "deleting document");
                self.vectors.delete_document(&tenant_id, &filename).await
            }
        }
    }
}
