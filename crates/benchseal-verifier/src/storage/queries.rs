//! Database queries for the verifier.

use benchseal_core::{ClockSource, SystemClock};

use super::db::{DatabaseError, ResultDatabase};
use super::models::{NewValidatedResult, ProcessingStatus, UploadRow, ValidatedResultRow};

/// Outcome of [`ResultDatabase::save_validated_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedResult {
    pub id: String,
    /// `false` when an identical result was already stored.
    pub created: bool,
}

impl ResultDatabase {
    // =========================================================================
    // Upload queries
    // =========================================================================

    /// Record a new pending upload.
    pub async fn create_upload(
        &self,
        id: &str,
        scope: &str,
        key_id: &str,
        metadata: Option<&str>,
    ) -> Result<UploadRow, DatabaseError> {
        let now = SystemClock.unix_now();

        sqlx::query(
            r"
            INSERT INTO uploads (id, scope, key_id, status, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(scope)
        .bind(key_id)
        .bind(ProcessingStatus::Pending.as_str())
        .bind(metadata)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_upload(id).await
    }

    /// Get an upload by ID.
    pub async fn get_upload(&self, id: &str) -> Result<UploadRow, DatabaseError> {
        sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Upload {id}")))
    }

    /// Update upload status.
    pub async fn update_upload_status(
        &self,
        id: &str,
        status: ProcessingStatus,
    ) -> Result<(), DatabaseError> {
        let now = SystemClock.unix_now();

        sqlx::query("UPDATE uploads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Store the final status, the serialized report and the result link.
    pub async fn finish_upload(
        &self,
        id: &str,
        status: ProcessingStatus,
        report: &str,
        result_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = SystemClock.unix_now();

        sqlx::query(
            r"
            UPDATE uploads
            SET status = ?, report = ?, result_id = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(report)
        .bind(result_id)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Uploads still waiting for or undergoing verification.
    pub async fn list_unfinished_uploads(&self) -> Result<Vec<UploadRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE status IN ('pending', 'processing') ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Validated result queries
    // =========================================================================

    /// Persist an accepted result.
    ///
    /// Idempotent: a result whose `log_hash` or `(scope, nonce)` is already
    /// stored is not inserted again, and the existing row's id is returned.
    pub async fn save_validated_result(
        &self,
        record: &NewValidatedResult,
    ) -> Result<SavedResult, DatabaseError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = SystemClock.unix_now();

        let inserted = sqlx::query(
            r"
            INSERT INTO validated_results
                (id, scope, nonce, log_hash, payload, metadata, signed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(&id)
        .bind(&record.scope)
        .bind(&record.nonce)
        .bind(&record.log_hash)
        .bind(&record.payload)
        .bind(record.metadata.as_deref())
        .bind(record.signed_at)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(SavedResult { id, created: true });
        }

        let (existing,): (String,) = sqlx::query_as(
            r"
            SELECT id FROM validated_results
            WHERE log_hash = ? OR (scope = ? AND nonce = ?)
            LIMIT 1
            ",
        )
        .bind(&record.log_hash)
        .bind(&record.scope)
        .bind(&record.nonce)
        .fetch_one(self.pool())
        .await?;

        Ok(SavedResult {
            id: existing,
            created: false,
        })
    }

    /// Get a validated result by ID.
    pub async fn get_validated_result(&self, id: &str) -> Result<ValidatedResultRow, DatabaseError> {
        sqlx::query_as::<_, ValidatedResultRow>("SELECT * FROM validated_results WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Validated result {id}")))
    }

    pub async fn count_validated_results(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM validated_results")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(nonce: &str, log_hash: &str) -> NewValidatedResult {
        NewValidatedResult {
            scope: "scope-a".into(),
            nonce: nonce.into(),
            log_hash: log_hash.into(),
            payload: r#"{"a":1}"#.into(),
            metadata: None,
            signed_at: 1_750_000_000,
        }
    }

    #[tokio::test]
    async fn create_and_finish_upload() {
        let db = ResultDatabase::open_in_memory().await.unwrap();

        let upload = db
            .create_upload("up-1", "scope-a", "key-1", Some(r#"{"run":7}"#))
            .await
            .unwrap();
        assert_eq!(upload.status, "pending");
        assert!(upload.report.is_none());

        db.update_upload_status("up-1", ProcessingStatus::Processing)
            .await
            .unwrap();
        assert_eq!(db.list_unfinished_uploads().await.unwrap().len(), 1);

        let saved = db.save_validated_result(&record("n1", "h1")).await.unwrap();
        db.finish_upload("up-1", ProcessingStatus::Completed, "{}", Some(&saved.id))
            .await
            .unwrap();

        let upload = db.get_upload("up-1").await.unwrap();
        assert_eq!(upload.status, "completed");
        assert_eq!(upload.result_id.as_deref(), Some(saved.id.as_str()));
        assert!(db.list_unfinished_uploads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_upload_is_not_found() {
        let db = ResultDatabase::open_in_memory().await.unwrap();
        assert!(matches!(
            db.get_upload("nope").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn save_is_idempotent_on_log_hash() {
        let db = ResultDatabase::open_in_memory().await.unwrap();

        let first = db.save_validated_result(&record("n1", "h1")).await.unwrap();
        let second = db.save_validated_result(&record("n2", "h1")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(db.count_validated_results().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn save_is_idempotent_on_scope_and_nonce() {
        let db = ResultDatabase::open_in_memory().await.unwrap();

        let first = db.save_validated_result(&record("n1", "h1")).await.unwrap();
        let second = db.save_validated_result(&record("n1", "h2")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.count_validated_results().await.unwrap(), 1);

        let stored = db.get_validated_result(&first.id).await.unwrap();
        assert_eq!(stored.log_hash, "h1");
    }
}
