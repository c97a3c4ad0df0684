//! Service layer: the upload protocol core plus its narrow persistence and
//! filesystem backends.
//!
//! `UploadService` orchestrates everything; the repositories own the record
//! store, `ChunkStore` owns the staging buffers, and `BlobStore` owns the
//! durable files.

pub mod access_repo;
pub mod blob_store;
pub mod chunk_store;
pub mod session_repo;
pub mod upload_service;

use std::io;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("access reference `{0}` not found")]
    AccessRefNotFound(Uuid),
    #[error(
        "upload `{id}`: offset {claimed} not appendable (current offset {current}, size {size})"
    )]
    OffsetConflict {
        id: Uuid,
        claimed: i64,
        current: i64,
        size: i64,
    },
    #[error("upload `{0}` is not finished")]
    NotFinished(Uuid),
    #[error("upload `{id}`: body was {actual} bytes but Content-Length declared {declared}")]
    LengthMismatch {
        id: Uuid,
        actual: i64,
        declared: i64,
    },
    #[error("upload `{0}` has no stored file")]
    FileMissing(Uuid),
    #[error("caller is not the owner of `{0}`")]
    NotOwner(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;
