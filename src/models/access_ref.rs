//! Represents a stable, shareable pointer to a finalized upload's file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An access reference: a stable id through which a finalized upload's file
/// can be fetched, independent of the upload's own ownership rules.
///
/// References are never mutated after creation. Deleting the upload session
/// cascades to its references.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct AccessRef {
    /// Unique identifier for this reference.
    pub id: Uuid,

    /// The upload session this reference resolves to.
    #[serde(rename = "upload")]
    pub upload_id: Uuid,

    /// Identity of the user who created the reference. May differ from the
    /// upload's owner.
    pub owner: String,

    /// When the reference was created.
    pub created_at: DateTime<Utc>,
}
