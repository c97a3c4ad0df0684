//! Persistent record store for access references, backed by SQLite.

use crate::models::access_ref::AccessRef;
use crate::services::{UploadError, UploadResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Narrow repository over the `access_refs` table.
#[derive(Clone)]
pub struct AccessRefRepository {
    db: Arc<SqlitePool>,
}

impl AccessRefRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn create(&self, upload_id: Uuid, owner: &str) -> UploadResult<AccessRef> {
        let access_ref = AccessRef {
            id: Uuid::new_v4(),
            upload_id,
            owner: owner.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO access_refs (id, upload_id, owner, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(access_ref.id)
        .bind(access_ref.upload_id)
        .bind(&access_ref.owner)
        .bind(access_ref.created_at)
        .execute(&*self.db)
        .await?;

        Ok(access_ref)
    }

    pub async fn find(&self, id: Uuid) -> UploadResult<AccessRef> {
        sqlx::query_as::<_, AccessRef>(
            "SELECT id, upload_id, owner, created_at FROM access_refs WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::AccessRefNotFound(id),
            other => UploadError::Sqlx(other),
        })
    }

    pub async fn delete(&self, id: Uuid) -> UploadResult<()> {
        let result = sqlx::query("DELETE FROM access_refs WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::AccessRefNotFound(id));
        }

        Ok(())
    }
}
