use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{now_epoch_ms, SagaPatch, SagaRecord, SagaStatus, StepRecord, SAGA_TTL_SECS};
use crate::core::error::SagaError;

/// Persists saga state outside any single worker. All writes are
/// read-modify-write serialized per key; records expire an hour after their
/// last write.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn create(&self, record: &SagaRecord) -> Result<(), SagaError>;

    /// `None` when the saga does not exist or its TTL has elapsed.
    async fn get(&self, saga_id: &str) -> Result<Option<SagaRecord>, SagaError>;

    /// Apply a partial update. Returns the updated record, or `None` when
    /// the saga is missing/expired or already terminal (a lost race with
    /// another worker, not an error).
    async fn update(
        &self,
        saga_id: &str,
        patch: SagaPatch,
    ) -> Result<Option<SagaRecord>, SagaError>;

    async fn complete(
        &self,
        saga_id: &str,
        formatted_response: String,
        step: Option<StepRecord>,
    ) -> Result<Option<SagaRecord>, SagaError> {
        let mut patch = SagaPatch {
            status: Some(SagaStatus::Completed),
            formatted_response: Some(formatted_response),
            ..Default::default()
        };
        if let Some(step) = step {
            patch.append_steps.push(step);
        }
        self.update(saga_id, patch).await
    }

    async fn fail(
        &self,
        saga_id: &str,
        error: &SagaError,
        step: Option<StepRecord>,
    ) -> Result<Option<SagaRecord>, SagaError> {
        let mut patch = SagaPatch {
            status: Some(SagaStatus::Error),
            error_message: Some(error.to_string()),
            ..Default::default()
        };
        if let Some(step) = step {
            patch.append_steps.push(step);
        }
        self.update(saga_id, patch).await
    }
}

/// Sqlite-backed store. The single connection behind a mutex is the per-key
/// lock the contract asks for: every read-modify-write happens inside one
/// lock hold.
pub struct SqliteSagaStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteSagaStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS sagas (
                saga_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn store_err(e: impl std::fmt::Display) -> SagaError {
        SagaError::StateStoreUnavailable(e.to_string())
    }

    fn expiry() -> i64 {
        (now_epoch_ms() / 1000 + SAGA_TTL_SECS) as i64
    }

    fn load(db: &Connection, saga_id: &str) -> Result<Option<SagaRecord>, SagaError> {
        let row: Option<(String, i64)> = db
            .query_row(
                "SELECT record, expires_at FROM sagas WHERE saga_id = ?1",
                params![saga_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Self::store_err)?;

        let Some((json, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= (now_epoch_ms() / 1000) as i64 {
            let _ = db.execute("DELETE FROM sagas WHERE saga_id = ?1", params![saga_id]);
            return Ok(None);
        }
        let record: SagaRecord = serde_json::from_str(&json).map_err(Self::store_err)?;
        Ok(Some(record))
    }

    fn save(db: &Connection, record: &SagaRecord) -> Result<(), SagaError> {
        let json = serde_json::to_string(record).map_err(Self::store_err)?;
        db.execute(
            "INSERT INTO sagas (saga_id, tenant_id, status, record, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(saga_id) DO UPDATE SET
                status = excluded.status,
                record = excluded.record,
                expires_at = excluded.expires_at",
            params![
                record.saga_id,
                record.tenant_id,
                record.status.as_str(),
                json,
                Self::expiry(),
            ],
        )
        .map_err(Self::store_err)?;
        Ok(())
    }
}

#[async_trait]
impl SagaStore for SqliteSagaStore {
    async fn create(&self, record: &SagaRecord) -> Result<(), SagaError> {
        let db = self.db.lock().await;
        Self::save(&db, record)?;
        info!(saga_id = %record.saga_id, "created saga record");
        Ok(())
    }

    async fn get(&self, saga_id: &str) -> Result<Option<SagaRecord>, SagaError> {
        let db = self.db.lock().await;
        Self::load(&db, saga_id)
    }

    async fn update(
        &self,
        saga_id: &str,
        patch: SagaPatch,
    ) -> Result<Option<SagaRecord>, SagaError> {
        let db = self.db.lock().await;
        let Some(mut record) = Self::load(&db, saga_id)? else {
            return Ok(None);
        };
        if let Err(rejected) = record.apply(patch) {
            warn!(saga_id, %rejected, "dropping saga patch");
            return Ok(None);
        }
        Self::save(&db, &record)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::saga::{StepMetadata, StepStatus};

    fn store() -> SqliteSagaStore {
        SqliteSagaStore::open_in_memory().unwrap()
    }

    fn record(id: &str) -> SagaRecord {
        SagaRecord::new(id.into(), "acme".into(), "top customers?".into())
    }

    fn step(name: &str) -> StepRecord {
        StepRecord {
            step_name: name.into(),
            status: StepStatus::Success,
            duration_ms: 5,
            metadata: StepMetadata::default(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        store.create(&record("s1")).await.unwrap();
        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.saga_id, "s1");
        assert_eq!(loaded.status, SagaStatus::Pending);
    }

    #[tokio::test]
    async fn missing_saga_reads_as_none() {
        let store = store();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_is_partial_and_preserves_other_fields() {
        let store = store();
        store.create(&record("s1")).await.unwrap();

        store
            .update(
                "s1",
                SagaPatch {
                    status: Some(SagaStatus::Generating),
                    generated_sql: Some("SELECT 1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store
            .update(
                "s1",
                SagaPatch {
                    raw_results: Some("| a |".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.generated_sql.as_deref(), Some("SELECT 1"));
        assert_eq!(updated.raw_results.as_deref(), Some("| a |"));
        assert_eq!(updated.status, SagaStatus::Generating);
    }

    #[tokio::test]
    async fn call_stack_grows_across_updates() {
        let store = store();
        store.create(&record("s1")).await.unwrap();
        store
            .update("s1", SagaPatch::default().with_step(step("generate_query")))
            .await
            .unwrap();
        let updated = store
            .update("s1", SagaPatch::default().with_step(step("execute_query")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.call_stack.len(), 2);
        assert_eq!(updated.call_stack[0].step_name, "generate_query");
        assert_eq!(updated.call_stack[1].step_name, "execute_query");
    }

    #[tokio::test]
    async fn terminal_records_reject_further_updates() {
        let store = store();
        store.create(&record("s1")).await.unwrap();
        store
            .complete("s1", "all done".into(), None)
            .await
            .unwrap();

        let refused = store
            .update("s1", SagaPatch::status(SagaStatus::Generating))
            .await
            .unwrap();
        assert!(refused.is_none());

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SagaStatus::Completed);
        assert_eq!(loaded.formatted_response.as_deref(), Some("all done"));
    }

    #[tokio::test]
    async fn fail_records_the_error_message() {
        let store = store();
        store.create(&record("s1")).await.unwrap();
        store
            .fail("s1", &SagaError::SqlNotProduced, Some(step("generate_query")))
            .await
            .unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SagaStatus::Error);
        assert_eq!(loaded.error_message.as_deref(), Some("SqlNotProduced"));
        assert_eq!(loaded.call_stack.len(), 1);
    }

    #[tokio::test]
    async fn expired_records_read_as_none() {
        let store = store();
        store.create(&record("s1")).await.unwrap();
        {
            let db = store.db.lock().await;
            db.execute("UPDATE sagas SET expires_at = 1", [])
                .unwrap();
        }
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
