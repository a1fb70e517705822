//! Multipart uploads.
//!
//! Parts are staged as blobs in the configured temp directory, named
//! `{bucketGUID}_{uploadGUID}_{partNumber}`, and recorded in the
//! `uploads` / `uploadparts` tables.  Completion streams the parts in
//! part-number order through [`BucketClient::add_object`], so the final
//! object follows the same versioning rules as a single-shot write.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Duration, Utc};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, info, warn};

use crate::bucket::client::{BucketClient, ObjectWrite};
use crate::config_manager::ConfigManager;
use crate::errors::{S3Error, S3Result};
use crate::metadata::store::{ObjectRecord, UploadPartRecord, UploadRecord};
use crate::storage::backend::{BlobReader, StorageDriver};
use crate::storage::disk::DiskStorageDriver;

const INVALID_PART_MESSAGE: &str = "One or more of the specified parts could not be found. The part may not have been uploaded, or the specified entity tag may not match the part's entity tag.";

/// Temp blob name of one part.
pub fn part_blob_name(bucket_guid: &str, upload_guid: &str, part_number: u32) -> String {
    format!("{bucket_guid}_{upload_guid}_{part_number}")
}

/// S3 composite ETag: MD5 over the concatenated binary part MD5s, then
/// `-{part count}`.
fn composite_etag(part_md5s: &[&str]) -> anyhow::Result<String> {
    let mut hasher = Md5::new();
    for md5 in part_md5s {
        hasher.update(hex::decode(md5)?);
    }
    Ok(format!("{}-{}", hex::encode(hasher.finalize()), part_md5s.len()))
}

#[derive(Default)]
struct PartHashes {
    sha1: Sha1,
    sha256: Sha256,
}

/// Feeds every byte read through SHA-1 and SHA-256.
///
/// The digests live behind a shared handle because the storage driver
/// takes ownership of the reader.
struct HashingReader {
    inner: BlobReader,
    hashes: Arc<Mutex<PartHashes>>,
}

impl AsyncRead for HashingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = self.inner.as_mut().poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                let mut hashes = self.hashes.lock().expect("mutex poisoned");
                hashes.sha1.update(fresh);
                hashes.sha256.update(fresh);
            }
        }
        poll
    }
}

pub struct MultipartManager {
    config_manager: Arc<ConfigManager>,
    parts: DiskStorageDriver,
    expiration: Duration,
}

impl MultipartManager {
    /// Stage parts under `temp_dir`; uploads expire after `expiration_days`.
    pub fn new(
        config_manager: Arc<ConfigManager>,
        temp_dir: impl Into<PathBuf>,
        expiration_days: i64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            config_manager,
            parts: DiskStorageDriver::new(temp_dir)?,
            expiration: Duration::days(expiration_days),
        })
    }

    /// On-disk path of one part file.
    pub fn part_path(&self, bucket_guid: &str, upload_guid: &str, part_number: u32) -> PathBuf {
        self.parts
            .root()
            .join(part_blob_name(bucket_guid, upload_guid, part_number))
    }

    /// Start an upload of `key` into the client's bucket.
    pub async fn initiate(
        &self,
        client: &BucketClient,
        key: &str,
        content_type: Option<&str>,
        owner_guid: &str,
        author_guid: &str,
    ) -> S3Result<UploadRecord> {
        let now = Utc::now();
        let record = UploadRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            bucket_guid: client.guid(),
            owner_guid: owner_guid.to_string(),
            author_guid: author_guid.to_string(),
            key: key.to_string(),
            content_type: content_type
                .unwrap_or("application/octet-stream")
                .to_string(),
            created_utc: now,
            last_access_utc: now,
            expiration_utc: now + self.expiration,
        };
        self.config_manager.add_upload(record.clone()).await?;
        info!(
            "Initiated upload {} for {}/{}",
            record.guid,
            client.name(),
            key
        );
        Ok(record)
    }

    /// Look up an upload that belongs to the client's bucket.
    async fn require_upload(&self, client: &BucketClient, upload_id: &str) -> S3Result<UploadRecord> {
        self.config_manager
            .get_upload(upload_id)
            .await?
            .filter(|u| u.bucket_guid == client.guid())
            .ok_or_else(|| S3Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })
    }

    /// Uploads in progress for the client's bucket.
    pub async fn list_uploads(&self, client: &BucketClient) -> S3Result<Vec<UploadRecord>> {
        self.config_manager.get_uploads_by_bucket(&client.guid()).await
    }

    /// Parts recorded so far, by part number.
    pub async fn list_parts(
        &self,
        client: &BucketClient,
        upload_id: &str,
    ) -> S3Result<Vec<UploadPartRecord>> {
        let upload = self.require_upload(client, upload_id).await?;
        self.config_manager.get_upload_parts(&upload.guid).await
    }

    /// Stage one part. Re-sending a part number replaces the earlier part.
    pub async fn upload_part(
        &self,
        client: &BucketClient,
        upload_id: &str,
        part_number: u32,
        content_length: Option<u64>,
        body: BlobReader,
    ) -> S3Result<UploadPartRecord> {
        let upload = self.require_upload(client, upload_id).await?;
        if part_number == 0 || part_number > crate::config_manager::MAX_PART_NUMBER {
            return Err(S3Error::InvalidArgument {
                message: format!("invalid part number {part_number}"),
            });
        }

        let hashes = Arc::new(Mutex::new(PartHashes::default()));
        let reader = HashingReader {
            inner: body,
            hashes: hashes.clone(),
        };
        let blob = part_blob_name(&upload.bucket_guid, &upload.guid, part_number);
        let written = self
            .parts
            .write(&blob, content_length, Box::pin(reader))
            .await?;

        let (sha1, sha256) = {
            let mut hashes = hashes.lock().expect("mutex poisoned");
            let PartHashes { sha1, sha256 } = std::mem::take(&mut *hashes);
            (hex::encode(sha1.finalize()), hex::encode(sha256.finalize()))
        };

        let record = UploadPartRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            bucket_guid: upload.bucket_guid,
            owner_guid: upload.owner_guid,
            upload_guid: upload.guid,
            part_number,
            part_length: written.length,
            md5: written.md5,
            sha1,
            sha256,
            created_utc: Utc::now(),
        };
        self.config_manager.add_upload_part(record.clone()).await?;
        debug!(
            "Stored part {} of upload {} ({} bytes)",
            part_number, record.upload_guid, record.part_length
        );
        Ok(record)
    }

    /// Assemble the listed parts into a new object version.
    ///
    /// `parts` pairs part numbers with the ETags the caller received; they
    /// must be in ascending order and match the stored parts.  On success
    /// the staged parts and the upload row are removed.
    pub async fn complete(
        &self,
        client: &BucketClient,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> S3Result<ObjectRecord> {
        let upload = self.require_upload(client, upload_id).await?;
        if parts.is_empty() {
            return Err(S3Error::InvalidPart {
                message: "You must specify at least one part".to_string(),
            });
        }
        if parts.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(S3Error::InvalidPart {
                message: "The list of parts was not in ascending order".to_string(),
            });
        }

        let stored = self.config_manager.get_upload_parts(&upload.guid).await?;
        let mut selected = Vec::with_capacity(parts.len());
        for (number, etag) in parts {
            let part = stored
                .iter()
                .find(|p| p.part_number == *number && p.md5 == etag.trim_matches('"'))
                .ok_or_else(|| S3Error::InvalidPart {
                    message: INVALID_PART_MESSAGE.to_string(),
                })?;
            selected.push(part);
        }

        let total: u64 = selected.iter().map(|p| p.part_length).sum();
        let md5s: Vec<&str> = selected.iter().map(|p| p.md5.as_str()).collect();
        let etag = composite_etag(&md5s)?;

        let mut body: BlobReader = Box::pin(tokio::io::empty());
        for part in &selected {
            let blob = part_blob_name(&part.bucket_guid, &part.upload_guid, part.part_number);
            let stream = self.parts.read_stream(&blob).await?;
            body = Box::pin(body.chain(stream.reader));
        }

        let write = ObjectWrite {
            key: upload.key.clone(),
            owner_guid: upload.owner_guid.clone(),
            author_guid: upload.author_guid.clone(),
            content_type: Some(upload.content_type.clone()),
            content_length: Some(total),
            etag: Some(etag),
            expiration_utc: None,
        };
        let object = client.add_object(write, body).await?;

        self.discard(&upload).await?;
        info!(
            "Completed upload {} as {}/{} version {}",
            upload.guid,
            client.name(),
            object.key,
            object.version
        );
        Ok(object)
    }

    /// Drop an upload and its staged parts. Returns false if unknown.
    pub async fn abort(&self, client: &BucketClient, upload_id: &str) -> S3Result<bool> {
        let upload = match self.require_upload(client, upload_id).await {
            Ok(upload) => upload,
            Err(S3Error::NoSuchUpload { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.discard(&upload).await?;
        info!("Aborted upload {}", upload.guid);
        Ok(true)
    }

    /// Remove every upload whose expiration is strictly before `now`.
    /// Returns how many were removed.
    pub async fn expire(&self, now: DateTime<Utc>) -> S3Result<usize> {
        let expired = self.config_manager.get_expired_uploads(now).await?;
        for upload in &expired {
            self.discard(upload).await?;
            info!(
                "Expired upload {} for key {} (created {})",
                upload.guid, upload.key, upload.created_utc
            );
        }
        Ok(expired.len())
    }

    /// Drop every upload of a bucket that is about to be removed.
    /// Returns how many were dropped.
    pub async fn discard_bucket(&self, bucket_guid: &str) -> S3Result<usize> {
        let uploads = self.config_manager.get_uploads_by_bucket(bucket_guid).await?;
        for upload in &uploads {
            self.discard(upload).await?;
            debug!("Discarded upload {} with its bucket", upload.guid);
        }
        Ok(uploads.len())
    }

    /// Delete part blobs, then the rows.
    async fn discard(&self, upload: &UploadRecord) -> S3Result<()> {
        let parts = self.config_manager.get_upload_parts(&upload.guid).await?;
        for part in parts {
            let blob = part_blob_name(&upload.bucket_guid, &upload.guid, part.part_number);
            if let Err(e) = self.parts.delete(&blob).await {
                warn!("Failed to delete part file {}: {}", blob, e);
            }
        }
        self.config_manager.remove_upload(&upload.guid).await
    }
}
