//! Persistent record store for upload sessions, backed by SQLite.

use crate::models::upload_session::UploadSession;
use crate::services::{UploadError, UploadResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_COLUMNS: &str =
    "id, owner, size, current_offset, filename, mime_type, file_key, created_at, updated_at";

/// Narrow repository over the `upload_sessions` table.
///
/// The protocol core only ever needs single-record reads and atomic
/// single-record writes; the record store's own atomicity is the durability
/// primitive the finalizer relies on.
#[derive(Clone)]
pub struct SessionRepository {
    db: Arc<SqlitePool>,
}

impl SessionRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create a new session with `current_offset = 0`.
    pub async fn create(
        &self,
        owner: &str,
        size: i64,
        filename: &str,
        mime_type: &str,
    ) -> UploadResult<UploadSession> {
        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            size,
            current_offset: 0,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            file_key: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO upload_sessions \
             (id, owner, size, current_offset, filename, mime_type, file_key, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.owner)
        .bind(session.size)
        .bind(session.current_offset)
        .bind(&session.filename)
        .bind(&session.mime_type)
        .bind(&session.file_key)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&*self.db)
        .await?;

        Ok(session)
    }

    /// Fetch a session by id. Returns SessionNotFound if missing.
    pub async fn find(&self, id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::SessionNotFound(id),
            other => UploadError::Sqlx(other),
        })
    }

    /// Persist a new offset after a fully successful chunk write and return
    /// the updated row.
    pub async fn advance_offset(&self, id: Uuid, new_offset: i64) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "UPDATE upload_sessions SET current_offset = ?, updated_at = ? WHERE id = ? \
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(new_offset)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::SessionNotFound(id),
            other => UploadError::Sqlx(other),
        })
    }

    /// Record the blob key of a finalized upload. Replaces any prior key.
    pub async fn attach_file(&self, id: Uuid, file_key: &str) -> UploadResult<()> {
        let result =
            sqlx::query("UPDATE upload_sessions SET file_key = ?, updated_at = ? WHERE id = ?")
                .bind(file_key)
                .bind(Utc::now())
                .bind(id)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::SessionNotFound(id));
        }

        Ok(())
    }

    /// All sessions whose declared size has been fully received, most
    /// recently updated first. Includes already-finalized sessions; the
    /// finalizer treats those as a no-op.
    pub async fn find_complete(&self) -> UploadResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions \
             WHERE size != 0 AND size = current_offset \
             ORDER BY updated_at DESC",
            SESSION_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;

        Ok(sessions)
    }

    /// Delete a session. Access references cascade at the schema level.
    pub async fn delete(&self, id: Uuid) -> UploadResult<()> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::SessionNotFound(id));
        }

        Ok(())
    }
}
