//! Durable blob storage for finalized uploads.
//!
//! One blob per session, stored at `<blob_dir>/<session_id>/<file_key>`.
//! Attaching copies the staging buffer into place and fsyncs before the
//! caller persists the new key, so a crash mid-attach always leaves the
//! staging buffer intact for the recovery sweep to retry.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Physical path of a stored blob.
    pub fn blob_path(&self, session_id: Uuid, file_key: &str) -> PathBuf {
        self.dir.join(session_id.to_string()).join(file_key)
    }

    /// Copy `source` into the blob directory for `session_id` and return the
    /// generated blob key. The copy is flushed and fsynced; `source` is left
    /// untouched so the caller can delete it only after the record store has
    /// durably accepted the new key.
    pub async fn attach(&self, session_id: Uuid, source: &Path, filename: &str) -> io::Result<String> {
        let file_key = format!("{}_{}", Uuid::new_v4().simple(), sanitize_filename(filename));
        let dest = self.blob_path(session_id, &file_key);
        let parent = dest.parent().ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "blob path missing parent directory")
        })?;
        fs::create_dir_all(parent).await?;

        let mut reader = File::open(source).await?;
        let mut writer = File::create(&dest).await?;
        if let Err(err) = tokio::io::copy(&mut reader, &mut writer).await {
            let _ = fs::remove_file(&dest).await;
            return Err(err);
        }
        if let Err(err) = writer.flush().await {
            let _ = fs::remove_file(&dest).await;
            return Err(err);
        }
        if let Err(err) = writer.sync_all().await {
            let _ = fs::remove_file(&dest).await;
            return Err(err);
        }

        Ok(file_key)
    }

    /// Remove a stored blob. Missing files are not an error so that replaced
    /// or already-cleaned blobs can be removed best-effort.
    pub async fn remove(&self, session_id: Uuid, file_key: &str) -> io::Result<()> {
        match fs::remove_file(self.blob_path(session_id, file_key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Keep blob keys safe as single path segments.
///
/// Filenames arrive from client metadata; anything outside a conservative
/// character set is replaced so keys cannot traverse out of the session's
/// blob directory.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('_').is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn attach_copies_and_leaves_source() {
        let temp = tempdir().expect("tempdir");
        let store = BlobStore::new(temp.path().join("blobs"));
        let session_id = Uuid::new_v4();

        let source = temp.path().join("buffer.part");
        fs::write(&source, b"payload").await.expect("write source");

        let key = store
            .attach(session_id, &source, "report.pdf")
            .await
            .expect("attach");

        assert!(key.ends_with("_report.pdf"));
        let stored = fs::read(store.blob_path(session_id, &key))
            .await
            .expect("read blob");
        assert_eq!(stored, b"payload");
        assert!(fs::metadata(&source).await.is_ok(), "source must survive");
    }

    #[tokio::test]
    async fn remove_tolerates_missing_blob() {
        let temp = tempdir().expect("tempdir");
        let store = BlobStore::new(temp.path().join("blobs"));
        store
            .remove(Uuid::new_v4(), "nope")
            .await
            .expect("missing blob is fine");
    }

    #[test]
    fn sanitize_filename_strips_path_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("résumé.pdf"), "r_sum_.pdf");
        assert_eq!(sanitize_filename("///"), "file");
    }
}
