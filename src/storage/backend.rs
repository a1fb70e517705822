//! Abstract blob storage trait.
//!
//! Every storage driver must implement [`StorageDriver`].  The trait
//! works in terms of opaque blob names and byte streams so callers do
//! not need to know the underlying medium.  A driver is scoped to a
//! single bucket's storage root.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Boxed byte source accepted and produced by drivers.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Outcome of a successful blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Lowercase hex MD5 of the bytes written.
    pub md5: String,
    /// Number of bytes written.
    pub length: u64,
}

/// An open blob together with the number of bytes it will yield.
pub struct BlobStream {
    pub length: u64,
    pub reader: BlobReader,
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Async blob storage contract.
pub trait StorageDriver: Send + Sync + 'static {
    /// Stream `reader` into `blob`, returning its MD5 and length.
    ///
    /// When `expected_length` is given and the stream yields a different
    /// number of bytes the write fails and no blob is left behind.
    fn write(
        &self,
        blob: &str,
        expected_length: Option<u64>,
        reader: BlobReader,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteResult>> + Send + '_>>;

    /// Read the full blob into memory.
    fn read(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;

    /// Open the blob for streaming.
    fn read_stream(
        &self,
        blob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobStream>> + Send + '_>>;

    /// Open `length` bytes of the blob starting at `offset`.
    ///
    /// Fails when `offset + length` exceeds the blob's size.
    fn read_range_stream(
        &self,
        blob: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobStream>> + Send + '_>>;

    /// Delete the blob. Deleting an absent blob is not an error.
    fn delete(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Check whether the blob exists.
    fn exists(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Size of the blob in bytes.
    fn length(&self, blob: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;
}
