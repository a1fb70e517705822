//! Disk directory storage driver.
//!
//! Blobs are stored as flat files directly under the bucket's object
//! directory, named by their opaque blob name (an object version GUID,
//! never the object key).
//!
//! All writes follow crash-only design: stream to a temp file, fsync, rename.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::backend::{BlobReader, BlobStream, StorageDriver, WriteResult};

/// Size of the buffer used when streaming bodies to disk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Prefix of in-flight temp files. Never a valid blob name.
const TEMP_PREFIX: &str = ".tmp-";

/// Stores blobs as files in a single directory.
pub struct DiskStorageDriver {
    /// Directory holding this bucket's blobs.
    root: PathBuf,
}

impl DiskStorageDriver {
    /// Create a new `DiskStorageDriver` rooted at `root`.
    ///
    /// The directory will be created if it does not exist, and any temp
    /// files left behind by a crash are removed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let driver = Self { root };
        driver.sweep_temp_files()?;
        Ok(driver)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a blob name to a file path.
    ///
    /// Blob names are single path components; separators and parent
    /// references are rejected so a name can never escape the root.
    fn resolve(&self, blob: &str) -> anyhow::Result<PathBuf> {
        if blob.is_empty()
            || blob.contains('/')
            || blob.contains('\\')
            || blob.contains("..")
            || blob.starts_with(TEMP_PREFIX)
        {
            anyhow::bail!("invalid blob name: {:?}", blob);
        }
        Ok(self.root.join(blob))
    }

    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(format!("{TEMP_PREFIX}{id}"))
    }

    fn sweep_temp_files(&self) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                debug!("Removing stale temp file {}", entry.path().display());
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    async fn stream_to_temp(
        &self,
        tmp_path: &Path,
        mut reader: BlobReader,
    ) -> anyhow::Result<WriteResult> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut length: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            length += n as u64;
        }

        file.flush().await?;
        file.sync_all().await?; // fsync

        Ok(WriteResult {
            md5: hex::encode(hasher.finalize()),
            length,
        })
    }

    async fn open(&self, blob: &str) -> anyhow::Result<(tokio::fs::File, u64)> {
        let path = self.resolve(blob)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open blob {}: {}", blob, e))?;
        let length = file.metadata().await?.len();
        Ok((file, length))
    }
}

impl StorageDriver for DiskStorageDriver {
    fn write(
        &self,
        blob: &str,
        expected_length: Option<u64>,
        reader: BlobReader,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteResult>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&blob)?;
            let tmp_path = self.temp_path();

            let result = match self.stream_to_temp(&tmp_path, reader).await {
                Ok(result) => result,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(e);
                }
            };

            if let Some(expected) = expected_length {
                if expected != result.length {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    anyhow::bail!(
                        "blob {} length mismatch: expected {} bytes, received {}",
                        blob,
                        expected,
                        result.length
                    );
                }
            }

            // Atomic rename to final path.
            tokio::fs::rename(&tmp_path, &final_path).await?;
            debug!("Wrote blob {} ({} bytes)", blob, result.length);
            Ok(result)
        })
    }

    fn read(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let path = self.resolve(&blob)?;
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to read blob {}: {}", blob, e))?;
            Ok(Bytes::from(data))
        })
    }

    fn read_stream(
        &self,
        blob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobStream>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let (file, length) = self.open(&blob).await?;
            Ok(BlobStream {
                length,
                reader: Box::pin(tokio::io::BufReader::with_capacity(CHUNK_SIZE, file)),
            })
        })
    }

    fn read_range_stream(
        &self,
        blob: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobStream>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let (mut file, total) = self.open(&blob).await?;
            let end = offset
                .checked_add(length)
                .ok_or_else(|| anyhow::anyhow!("range overflow"))?;
            if end > total {
                anyhow::bail!(
                    "range {}..{} exceeds blob {} length {}",
                    offset,
                    end,
                    blob,
                    total
                );
            }
            file.seek(SeekFrom::Start(offset)).await?;
            Ok(BlobStream {
                length,
                reader: Box::pin(file.take(length)),
            })
        })
    }

    fn delete(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let path = self.resolve(&blob)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                // Idempotent: if the file doesn't exist, that's fine.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn exists(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let path = self.resolve(&blob)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn length(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let blob = blob.to_string();
        Box::pin(async move {
            let path = self.resolve(&blob)?;
            Ok(tokio::fs::metadata(&path).await?.len())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_driver() -> (tempfile::TempDir, DiskStorageDriver) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let driver = DiskStorageDriver::new(dir.path().join("objects"))
            .expect("failed to create driver");
        (dir, driver)
    }

    fn body(data: &'static [u8]) -> BlobReader {
        Box::pin(data)
    }

    #[tokio::test]
    async fn test_write_and_read_roundtrip() {
        let (_dir, driver) = test_driver();
        let result = driver.write("blob-1", Some(11), body(b"hello world")).await.unwrap();
        assert_eq!(result.length, 11);
        assert_eq!(result.md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let data = driver.read("blob-1").await.unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(driver.length("blob-1").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_write_larger_than_chunk() {
        let (_dir, driver) = test_driver();
        let payload = vec![7u8; CHUNK_SIZE * 2 + 17];
        let reader: BlobReader = Box::pin(std::io::Cursor::new(payload.clone()));
        let result = driver.write("big", None, reader).await.unwrap();
        assert_eq!(result.length, payload.len() as u64);

        let mut stream = driver.read_stream("big").await.unwrap();
        assert_eq!(stream.length, payload.len() as u64);
        let mut out = Vec::new();
        stream.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_length_mismatch_leaves_nothing() {
        let (_dir, driver) = test_driver();
        let err = driver.write("short", Some(100), body(b"abc")).await;
        assert!(err.is_err());
        assert!(!driver.exists("short").await.unwrap());

        let leftovers = std::fs::read_dir(driver.root()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_range_read() {
        let (_dir, driver) = test_driver();
        driver.write("r", None, body(b"0123456789")).await.unwrap();

        let mut stream = driver.read_range_stream("r", 2, 5).await.unwrap();
        assert_eq!(stream.length, 5);
        let mut out = Vec::new();
        stream.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"23456");

        assert!(driver.read_range_stream("r", 8, 3).await.is_err());
        assert!(driver.read_range_stream("r", 10, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (_dir, driver) = test_driver();
        driver.write("d", None, body(b"x")).await.unwrap();
        driver.delete("d").await.unwrap();
        assert!(!driver.exists("d").await.unwrap());
        driver.delete("d").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let (_dir, driver) = test_driver();
        assert!(driver.write("../escape", None, body(b"x")).await.is_err());
        assert!(driver.write("a/b", None, body(b"x")).await.is_err());
        assert!(driver.read("..").await.is_err());
        assert!(driver.delete("").await.is_err());
    }

    #[tokio::test]
    async fn test_stale_temp_files_swept_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("objects");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(".tmp-stale"), b"partial").unwrap();
        std::fs::write(root.join("kept"), b"blob").unwrap();

        let driver = DiskStorageDriver::new(&root).unwrap();
        assert!(!root.join(".tmp-stale").exists());
        assert!(driver.exists("kept").await.unwrap());
    }
}
