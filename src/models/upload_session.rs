//! Represents one resumable upload's tracked state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single resumable upload session.
///
/// Tracks the declared total size and how many bytes have been durably
/// accepted so far. The session record itself never stores a lifecycle
/// state field: the state is fully derived from `current_offset`, `size`,
/// the presence of the staging buffer, and `file_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,

    /// Identity of the user who created the session.
    pub owner: String,

    /// Declared total byte length. A size of 0 can never complete.
    pub size: i64,

    /// Bytes durably accepted so far. Advances only on successful appends.
    pub current_offset: i64,

    /// Original filename, supplied via `Upload-Metadata` at creation.
    pub filename: String,

    /// MIME type, supplied via `Upload-Metadata` at creation.
    pub mime_type: String,

    /// Blob key once the upload has been finalized into durable storage.
    pub file_key: Option<String>,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// When the session was last modified. Feeds `Last-Modified` on reads.
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Whether all declared bytes have been accepted.
    ///
    /// A zero declared size is explicitly "not finished" so that degenerate
    /// empty sessions are never auto-finalized.
    pub fn is_complete(&self) -> bool {
        self.size != 0 && self.size == self.current_offset
    }
}
