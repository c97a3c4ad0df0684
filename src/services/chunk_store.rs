//! Append-only on-disk staging buffer for in-flight uploads.
//!
//! Each session owns exactly one buffer file, `<staging_dir>/<id>.part`,
//! which exists between the first accepted chunk and finalization. The
//! buffer is exclusively owned by the session's Append/Finalize pair; the
//! per-session lock in `UploadService` is what prevents concurrent writers.

use std::{
    fs::Metadata,
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The staging directory itself. Exposed for readiness probes.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the buffer file for one session.
    pub fn part_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.part", id))
    }

    /// Write `chunk` at `offset` in the session's buffer, creating the file
    /// if it does not exist yet. All-or-error: `write_all` either persists
    /// the whole chunk or fails.
    pub async fn write_at(&self, id: Uuid, offset: u64, chunk: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.part_path(id))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(chunk).await?;
        file.flush().await?;

        Ok(())
    }

    /// Stat the session's buffer. `None` means the buffer does not exist,
    /// which is distinct from other I/O failures.
    pub async fn stat(&self, id: Uuid) -> io::Result<Option<Metadata>> {
        match fs::metadata(self.part_path(id)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove the session's buffer file.
    pub async fn remove(&self, id: Uuid) -> io::Result<()> {
        fs::remove_file(self.part_path(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_at_positions_the_cursor() {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().join("staging"));
        let id = Uuid::new_v4();

        store.write_at(id, 0, b"head").await.expect("first write");
        store.write_at(id, 4, b"tail").await.expect("second write");

        let bytes = fs::read(store.part_path(id)).await.expect("read back");
        assert_eq!(bytes, b"headtail");
    }

    #[tokio::test]
    async fn stat_distinguishes_missing_buffer() {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().join("staging"));
        let id = Uuid::new_v4();

        assert!(store.stat(id).await.expect("stat").is_none());

        store.write_at(id, 0, b"abc").await.expect("write");
        let meta = store.stat(id).await.expect("stat").expect("present");
        assert_eq!(meta.len(), 3);

        store.remove(id).await.expect("remove");
        assert!(store.stat(id).await.expect("stat").is_none());
    }
}
