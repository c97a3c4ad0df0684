//! src/services/upload_service.rs
//!
//! UploadService — the resumable-upload protocol core. Session state lives
//! in SQLite, in-flight bytes in the staging `ChunkStore`, finalized bytes
//! in the `BlobStore`. Appends and finalizations for one session are
//! serialized through a per-session async lock; finalization triggered by a
//! completing chunk runs on a dedicated worker task fed through a queue so
//! its failure can never fail the chunk response that triggered it.

use crate::models::{access_ref::AccessRef, upload_session::UploadSession};
use crate::services::{
    UploadError, UploadResult, access_repo::AccessRefRepository, blob_store::BlobStore,
    chunk_store::ChunkStore, session_repo::SessionRepository,
};
use bytes::Bytes;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::{
    fs,
    sync::{Mutex, mpsc},
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Depth of the finalize job queue. Jobs are retried by the recovery sweep
/// on the next start if the queue is ever unavailable.
const FINALIZE_QUEUE_DEPTH: usize = 64;

/// Result of a finalize attempt on an eligible session.
#[derive(Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The staging buffer was attached as the session's durable file.
    Finalized,
    /// Nothing left to do: the buffer is gone, typically because a previous
    /// finalize already ran. Safe to hit from both the completion trigger
    /// and the recovery sweep.
    NotApplicable,
}

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite pool, also used by the readiness probe.
    pub db: Arc<SqlitePool>,

    sessions: SessionRepository,
    access_refs: AccessRefRepository,
    chunks: ChunkStore,
    blobs: BlobStore,

    /// One async mutex per session id. Entries are never evicted; ids are
    /// process-generated UUIDs so growth is bounded by session count.
    locks: Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>,

    finalize_tx: mpsc::Sender<Uuid>,
    public_url: String,
}

impl UploadService {
    /// Build the service and the receiving end of its finalize queue. The
    /// caller is expected to hand the receiver to `run_finalize_worker`.
    pub fn new(
        db: Arc<SqlitePool>,
        staging_dir: impl Into<PathBuf>,
        blob_dir: impl Into<PathBuf>,
        public_url: String,
    ) -> (Self, mpsc::Receiver<Uuid>) {
        let (finalize_tx, finalize_rx) = mpsc::channel(FINALIZE_QUEUE_DEPTH);
        let service = Self {
            sessions: SessionRepository::new(db.clone()),
            access_refs: AccessRefRepository::new(db.clone()),
            chunks: ChunkStore::new(staging_dir),
            blobs: BlobStore::new(blob_dir),
            locks: Arc::new(StdMutex::new(HashMap::new())),
            finalize_tx,
            public_url,
            db,
        };
        (service, finalize_rx)
    }

    /// Base URL used to construct `Location` references for new sessions.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// The staging directory. Exposed for the readiness probe.
    pub fn staging_dir(&self) -> &Path {
        self.chunks.dir()
    }

    fn session_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    /// Create a new session with offset 0 for `owner`.
    pub async fn create_session(
        &self,
        owner: &str,
        size: i64,
        filename: &str,
        mime_type: &str,
    ) -> UploadResult<UploadSession> {
        let session = self.sessions.create(owner, size, filename, mime_type).await?;
        debug!(
            "created upload {} ({} bytes declared, owner {})",
            session.id, session.size, session.owner
        );
        Ok(session)
    }

    /// Current state of a session, for the status query.
    pub async fn session_status(&self, id: Uuid) -> UploadResult<UploadSession> {
        self.sessions.find(id).await
    }

    /// Accept one chunk at `upload_offset`.
    ///
    /// The offset-equality precondition makes acceptance strictly in-order,
    /// gapless, and exactly-once: a retransmission of an already-accepted
    /// offset is a conflict, never a silent success. The per-session lock
    /// closes the lost-update window between the offset check and the
    /// persisted offset write when two appends race with the same claim.
    pub async fn append_chunk(
        &self,
        id: Uuid,
        upload_offset: i64,
        content_length: i64,
        chunk: Bytes,
    ) -> UploadResult<UploadSession> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self.sessions.find(id).await?;
        if upload_offset != session.current_offset || upload_offset >= session.size {
            return Err(UploadError::OffsetConflict {
                id,
                claimed: upload_offset,
                current: session.current_offset,
                size: session.size,
            });
        }

        // Checked before anything touches the staging buffer: a rejected
        // append must leave no bytes behind for a retried chunk to bury,
        // or the finalized blob would carry a stale tail.
        let body_len = chunk.len() as i64;
        if body_len != content_length {
            return Err(UploadError::LengthMismatch {
                id,
                actual: body_len,
                declared: content_length,
            });
        }

        self.chunks.write_at(id, upload_offset as u64, &chunk).await?;

        let session = self
            .sessions
            .advance_offset(id, upload_offset + body_len)
            .await?;

        if session.is_complete() {
            if let Err(err) = self.finalize_tx.send(id).await {
                // The chunk is already durable; the recovery sweep will pick
                // this session up on the next start.
                error!("failed to enqueue finalize for upload {}: {}", id, err);
            }
        }

        Ok(session)
    }

    /// Move a completed session's staging buffer into durable blob storage.
    ///
    /// Idempotent: once the buffer is gone the call reports `NotApplicable`,
    /// so the completion trigger and the recovery sweep can race freely.
    /// The buffer is deleted only after the record store has durably
    /// accepted the new blob key; a crash between the two steps leaves the
    /// buffer for the sweep to re-finalize.
    pub async fn finalize(&self, id: Uuid) -> UploadResult<FinalizeOutcome> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self.sessions.find(id).await?;
        if !session.is_complete() {
            return Err(UploadError::NotFinished(id));
        }

        if self.chunks.stat(id).await?.is_none() {
            return Ok(FinalizeOutcome::NotApplicable);
        }

        let part_path = self.chunks.part_path(id);
        let file_key = self.blobs.attach(id, &part_path, &session.filename).await?;

        if let Err(err) = self.sessions.attach_file(id, &file_key).await {
            let _ = self.blobs.remove(id, &file_key).await;
            return Err(err);
        }

        self.chunks.remove(id).await?;

        if let Some(old_key) = session.file_key {
            if let Err(err) = self.blobs.remove(id, &old_key).await {
                debug!("failed to remove replaced blob for upload {}: {}", id, err);
            }
        }

        debug!("finalized upload {} into blob {}", id, file_key);
        Ok(FinalizeOutcome::Finalized)
    }

    /// Startup sweep over sessions that completed but were never finalized,
    /// e.g. because the process died between the last chunk and the
    /// finalize. Individual failures are logged and skipped.
    pub async fn recover_unfinalized(&self) -> UploadResult<usize> {
        let sessions = self.sessions.find_complete().await?;
        let mut finalized = 0;

        for session in sessions {
            match self.finalize(session.id).await {
                Ok(FinalizeOutcome::Finalized) => {
                    info!("recovered unfinalized upload {}", session.id);
                    finalized += 1;
                }
                Ok(FinalizeOutcome::NotApplicable) => {}
                Err(err) => {
                    error!("startup finalize failed for upload {}: {}", session.id, err);
                }
            }
        }

        Ok(finalized)
    }

    /// Create an access reference to an upload the caller owns.
    pub async fn create_access_ref(&self, owner: &str, upload_id: Uuid) -> UploadResult<AccessRef> {
        let session = self.sessions.find(upload_id).await?;
        if session.owner != owner {
            return Err(UploadError::NotOwner(upload_id));
        }

        self.access_refs.create(upload_id, owner).await
    }

    /// Delete an access reference the caller owns.
    pub async fn delete_access_ref(&self, owner: &str, id: Uuid) -> UploadResult<()> {
        let access_ref = self.access_refs.find(id).await?;
        if access_ref.owner != owner {
            return Err(UploadError::NotOwner(id));
        }

        self.access_refs.delete(id).await
    }

    /// Resolve an access reference to its session and the on-disk blob path.
    ///
    /// An unfinalized upload, a deleted session, or a missing blob file are
    /// all a not-found condition for the caller.
    pub async fn resolve_access_ref(
        &self,
        access_ref_id: Uuid,
    ) -> UploadResult<(UploadSession, PathBuf)> {
        let access_ref = self.access_refs.find(access_ref_id).await?;
        let session = self.sessions.find(access_ref.upload_id).await?;

        let file_key = session
            .file_key
            .clone()
            .ok_or(UploadError::FileMissing(session.id))?;
        let path = self.blobs.blob_path(session.id, &file_key);
        match fs::metadata(&path).await {
            Ok(_) => Ok((session, path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(UploadError::FileMissing(session.id))
            }
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    /// Delete a session record; references cascade. Used by the record
    /// store's own lifecycle, not exposed over the upload protocol.
    pub async fn delete_session(&self, id: Uuid) -> UploadResult<()> {
        self.sessions.delete(id).await
    }
}

/// Drain the finalize queue, one job at a time.
///
/// Runs for the lifetime of the process. Errors are logged and swallowed:
/// the triggering client already got its chunk acknowledgment, and the
/// recovery sweep will retry on the next start.
pub async fn run_finalize_worker(service: UploadService, mut jobs: mpsc::Receiver<Uuid>) {
    while let Some(upload_id) = jobs.recv().await {
        match service.finalize(upload_id).await {
            Ok(FinalizeOutcome::Finalized) => debug!("finalized upload {}", upload_id),
            Ok(FinalizeOutcome::NotApplicable) => {
                debug!("upload {} had nothing left to finalize", upload_id)
            }
            Err(err) => error!("finalize failed for upload {}: {}", upload_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    async fn test_service() -> (TempDir, UploadService, mpsc::Receiver<Uuid>) {
        let temp = tempdir().expect("tempdir");

        // One connection so the in-memory database is shared across calls.
        let db = Arc::new(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .expect("in-memory pool"),
        );
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&*db)
            .await
            .expect("enable foreign keys");
        for stmt in include_str!("../../migrations/0001_init.sql")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&*db).await.expect("migrate");
        }

        let (service, jobs) = UploadService::new(
            db,
            temp.path().join("staging"),
            temp.path().join("blobs"),
            "http://localhost:3000".to_string(),
        );
        (temp, service, jobs)
    }

    #[tokio::test]
    async fn create_then_status_reports_declared_size_and_zero_offset() {
        let (_temp, service, _jobs) = test_service().await;

        let session = service
            .create_session("alice", 10, "file.txt", "text/plain")
            .await
            .expect("create");

        let status = service.session_status(session.id).await.expect("status");
        assert_eq!(status.current_offset, 0);
        assert_eq!(status.size, 10);
        assert_eq!(status.filename, "file.txt");
        assert_eq!(status.mime_type, "text/plain");
        assert!(status.file_key.is_none());
    }

    #[tokio::test]
    async fn status_of_unknown_session_is_not_found() {
        let (_temp, service, _jobs) = test_service().await;

        let err = service.session_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn append_advances_offset_and_rejects_replayed_offset() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 10, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        let updated = service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"abcd"))
            .await
            .expect("first append");
        assert_eq!(updated.current_offset, 4);

        // A repeated earlier offset is a conflict, not a no-op.
        let err = service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"abcd"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::OffsetConflict { .. }));
    }

    #[tokio::test]
    async fn append_with_mismatched_offset_is_conflict() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 10, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        let err = service
            .append_chunk(session.id, 3, 4, Bytes::from_static(b"abcd"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::OffsetConflict { .. }));

        let status = service.session_status(session.id).await.expect("status");
        assert_eq!(status.current_offset, 0);
    }

    #[tokio::test]
    async fn append_at_or_past_declared_size_is_conflict() {
        let (_temp, service, mut jobs) = test_service().await;
        let session = service
            .create_session("alice", 4, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"full"))
            .await
            .expect("fill");
        assert_eq!(jobs.recv().await, Some(session.id));

        let err = service
            .append_chunk(session.id, 4, 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::OffsetConflict { .. }));
    }

    #[tokio::test]
    async fn declared_length_mismatch_fails_without_advancing_offset() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 10, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        let err = service
            .append_chunk(session.id, 0, 5, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::LengthMismatch { .. }));

        // Resumable at the unchanged offset.
        let status = service.session_status(session.id).await.expect("status");
        assert_eq!(status.current_offset, 0);
        let updated = service
            .append_chunk(session.id, 0, 3, Bytes::from_static(b"abc"))
            .await
            .expect("retry");
        assert_eq!(updated.current_offset, 3);
    }

    #[tokio::test]
    async fn rejected_append_leaves_no_stale_bytes_for_later_chunks() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 6, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        // Ten bytes declared as four: rejected before anything is staged.
        let err = service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"goodbyXXXX"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::LengthMismatch { .. }));
        assert!(
            service.chunks.stat(session.id).await.expect("stat").is_none(),
            "rejected append must not create a staging buffer"
        );

        service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"good"))
            .await
            .expect("retry");
        service
            .append_chunk(session.id, 4, 2, Bytes::from_static(b"by"))
            .await
            .expect("last chunk");
        assert_eq!(
            service.finalize(session.id).await.expect("finalize"),
            FinalizeOutcome::Finalized
        );

        let stored = service.session_status(session.id).await.expect("status");
        let file_key = stored.file_key.expect("file attached");
        let bytes = fs::read(service.blobs.blob_path(session.id, &file_key))
            .await
            .expect("read blob");
        assert_eq!(bytes, b"goodby");
    }

    #[tokio::test]
    async fn finalize_roundtrip_is_byte_identical_and_idempotent() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 10, "notes.txt", "text/plain")
            .await
            .expect("create");

        service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"reco"))
            .await
            .expect("chunk 1");
        service
            .append_chunk(session.id, 4, 6, Bytes::from_static(b"verabl"))
            .await
            .expect("chunk 2");

        assert_eq!(
            service.finalize(session.id).await.expect("finalize"),
            FinalizeOutcome::Finalized
        );
        // Second call never produces a second blob or an error.
        assert_eq!(
            service.finalize(session.id).await.expect("finalize again"),
            FinalizeOutcome::NotApplicable
        );

        let stored = service.session_status(session.id).await.expect("status");
        let file_key = stored.file_key.expect("file attached");
        assert!(
            service.chunks.stat(session.id).await.expect("stat").is_none(),
            "staging buffer must be removed"
        );

        let access_ref = service
            .create_access_ref("alice", session.id)
            .await
            .expect("create ref");
        let (resolved, path) = service
            .resolve_access_ref(access_ref.id)
            .await
            .expect("resolve");
        assert_eq!(resolved.filename, "notes.txt");
        assert_eq!(resolved.mime_type, "text/plain");
        assert_eq!(resolved.file_key.as_deref(), Some(file_key.as_str()));

        let bytes = fs::read(path).await.expect("read blob");
        assert_eq!(bytes, b"recoverabl");
    }

    #[tokio::test]
    async fn finalize_of_incomplete_session_is_not_finished() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 10, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        service
            .append_chunk(session.id, 0, 4, Bytes::from_static(b"abcd"))
            .await
            .expect("partial");

        let err = service.finalize(session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFinished(_)));
    }

    #[tokio::test]
    async fn zero_declared_size_never_reaches_finalize_eligibility() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 0, "empty.bin", "application/octet-stream")
            .await
            .expect("create");

        // Any append requires offset < size, so a zero-size session can
        // never move toward completion.
        let err = service
            .append_chunk(session.id, 0, 0, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::OffsetConflict { .. }));

        let err = service.finalize(session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFinished(_)));
    }

    #[tokio::test]
    async fn recovery_sweep_finalizes_complete_sessions_exactly_once() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 6, "left.bin", "application/octet-stream")
            .await
            .expect("create");

        // Simulate a crash after the last accepted chunk: buffer present,
        // offset == size, no finalize ran (the worker is not drained here).
        service
            .append_chunk(session.id, 0, 6, Bytes::from_static(b"sixsix"))
            .await
            .expect("last chunk");

        assert_eq!(service.recover_unfinalized().await.expect("sweep"), 1);
        assert_eq!(service.recover_unfinalized().await.expect("sweep again"), 0);

        let stored = service.session_status(session.id).await.expect("status");
        assert!(stored.file_key.is_some());
    }

    #[tokio::test]
    async fn completion_trigger_finalizes_via_worker() {
        let (_temp, service, jobs) = test_service().await;
        let worker = tokio::spawn(run_finalize_worker(service.clone(), jobs));

        let session = service
            .create_session("alice", 5, "file.bin", "application/octet-stream")
            .await
            .expect("create");
        service
            .append_chunk(session.id, 0, 5, Bytes::from_static(b"hello"))
            .await
            .expect("append");

        let mut attached = false;
        for _ in 0..50 {
            let stored = service.session_status(session.id).await.expect("status");
            if stored.file_key.is_some() {
                attached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(attached, "worker should finalize the completed upload");

        worker.abort();
    }

    #[tokio::test]
    async fn access_ref_requires_upload_ownership() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 3, "file.bin", "application/octet-stream")
            .await
            .expect("create");

        let err = service
            .create_access_ref("mallory", session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotOwner(_)));

        let err = service
            .create_access_ref("alice", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn resolving_an_unfinalized_upload_is_not_found() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 8, "file.bin", "application/octet-stream")
            .await
            .expect("create");
        let access_ref = service
            .create_access_ref("alice", session.id)
            .await
            .expect("create ref");

        let err = service.resolve_access_ref(access_ref.id).await.unwrap_err();
        assert!(matches!(err, UploadError::FileMissing(_)));
    }

    #[tokio::test]
    async fn deleting_a_session_cascades_to_its_access_refs() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 3, "file.bin", "application/octet-stream")
            .await
            .expect("create");
        let access_ref = service
            .create_access_ref("alice", session.id)
            .await
            .expect("create ref");

        service.delete_session(session.id).await.expect("delete");

        let err = service.resolve_access_ref(access_ref.id).await.unwrap_err();
        assert!(matches!(err, UploadError::AccessRefNotFound(_)));
    }

    #[tokio::test]
    async fn delete_access_ref_checks_reference_ownership() {
        let (_temp, service, _jobs) = test_service().await;
        let session = service
            .create_session("alice", 3, "file.bin", "application/octet-stream")
            .await
            .expect("create");
        let access_ref = service
            .create_access_ref("alice", session.id)
            .await
            .expect("create ref");

        let err = service
            .delete_access_ref("mallory", access_ref.id)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotOwner(_)));

        service
            .delete_access_ref("alice", access_ref.id)
            .await
            .expect("owner delete");
        let err = service.resolve_access_ref(access_ref.id).await.unwrap_err();
        assert!(matches!(err, UploadError::AccessRefNotFound(_)));
    }
}
