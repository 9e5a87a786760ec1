use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::chunker::cosine_similarity;

/// One indexed chunk. Membership in a tenant's collection is the sole
/// access control: searches never cross tenants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub tenant_id: String,
    pub source_doc: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub ordinal: usize,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    pub score: f32,
}

/// Embedding-indexed chunk collections with per-tenant scoping.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()>;
    async fn search(
        &self,
        tenant_id: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;
    async fn delete_document(&self, tenant_id: &str, source_doc: &str) -> Result<()>;
    async fn count(&self, tenant_id: &str) -> Result<usize>;
}

/// Sqlite-backed store: embeddings live as JSON next to the chunk text and
/// similarity is computed in-process. Collections here are small enough
/// (business definitions, not corpora) that a scan per query is fine.
pub struct SqliteVectorStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteVectorStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS kb_chunks (
                chunk_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                source_doc TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_kb_chunks_tenant ON kb_chunks (tenant_id)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()> {
        let db = self.db.lock().await;
        for chunk in chunks {
            db.execute(
                "INSERT INTO kb_chunks (chunk_id, tenant_id, source_doc, ordinal, text, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                    tenant_id = excluded.tenant_id,
                    source_doc = excluded.source_doc,
                    ordinal = excluded.ordinal,
                    text = excluded.text,
                    embedding = excluded.embedding",
                params![
                    chunk.chunk_id,
                    chunk.tenant_id,
                    chunk.source_doc,
                    chunk.ordinal as i64,
                    chunk.text,
                    serde_json::to_string(&chunk.embedding)?,
                ],
            )?;
        }
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT chunk_id, source_doc, ordinal, text, embedding
             FROM kb_chunks WHERE tenant_id = ?1",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let (chunk_id, source_doc, ordinal, text, embedding_json) = row?;
            let stored: Vec<f32> = serde_json::from_str(&embedding_json)?;
            let score = cosine_similarity(embedding, &stored);
            scored.push(ScoredChunk {
                record: ChunkRecord {
                    chunk_id,
                    tenant_id: tenant_id.to_string(),
                    source_doc,
                    text,
                    embedding: stored,
                    ordinal: ordinal as usize,
                },
                score,
            });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_document(&self, tenant_id: &str, source_doc: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM kb_chunks WHERE tenant_id = ?1 AND source_doc = ?2",
            params![tenant_id, source_doc],
        )?;
        Ok(())
    }

    async fn count(&self, tenant_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM kb_chunks WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, tenant: &str, doc: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            tenant_id: tenant.to_string(),
            source_doc: doc.to_string(),
            text: format!("text for {id}"),
            embedding,
            ordinal: 0,
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .upsert(vec![
                chunk("a", "acme", "doc.txt", vec![1.0, 0.0]),
                chunk("b", "acme", "doc.txt", vec![0.0, 1.0]),
                chunk("c", "acme", "doc.txt", vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = store.search("acme", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.chunk_id, "a");
        assert_eq!(hits[1].record.chunk_id, "c");
    }

    #[tokio::test]
    async fn search_is_tenant_scoped() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .upsert(vec![
                chunk("a", "acme", "doc.txt", vec![1.0, 0.0]),
                chunk("b", "globex", "doc.txt", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.search("acme", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.chunk_id, "a");
    }

    #[tokio::test]
    async fn upsert_replaces_existing_chunk() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .upsert(vec![chunk("a", "acme", "doc.txt", vec![1.0, 0.0])])
            .await
            .unwrap();
        let mut replacement = chunk("a", "acme", "doc.txt", vec![0.0, 1.0]);
        replacement.text = "updated".to_string();
        store.upsert(vec![replacement]).await.unwrap();

        assert_eq!(store.count("acme").await.unwrap(), 1);
        let hits = store.search("acme", &[0.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].record.text, "updated");
    }

    #[tokio::test]
    async fn delete_document_removes_only_that_document() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .upsert(vec![
                chunk("a", "acme", "old.txt", vec![1.0, 0.0]),
                chunk("b", "acme", "new.txt", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        store.delete_document("acme", "old.txt").await.unwrap();
        assert_eq!(store.count("acme").await.unwrap(), 1);
        let hits = store.search("acme", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits[0].record.source_doc, "new.txt");
    }
}
