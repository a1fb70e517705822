//! Per-bucket object engine.
//!
//! A [`BucketClient`] couples one bucket's [`StorageDriver`] with its view
//! of the [`MetadataStore`] and implements versioned writes, deletes,
//! reads, enumeration, tags, ACLs, and statistics for that bucket.
//!
//! Object keys never reach the storage driver: every version is written
//! under a fresh GUID, so versions of one key cannot collide on disk.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{S3Error, S3Result};
use crate::metadata::store::{
    AclPermissions, BucketAclRecord, BucketRecord, BucketTagRecord, Grantee, MetadataStore,
    ObjectAclRecord, ObjectRecord, ObjectStatistics, ObjectTagRecord, UserGroup, VersionInsert,
};
use crate::storage::backend::{BlobReader, StorageDriver};

/// Rows fetched from the store per enumeration round trip.
const ENUMERATION_BATCH: u32 = 1000;

/// Page size used when the caller asks for zero results.
pub const DEFAULT_MAX_RESULTS: u32 = 1000;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Caller-supplied fields of a new object version.
#[derive(Debug, Clone, Default)]
pub struct ObjectWrite {
    pub key: String,
    pub owner_guid: String,
    pub author_guid: String,
    /// Defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// Declared body length; a body of any other length is rejected.
    pub content_length: Option<u64>,
    /// Defaults to the MD5 of the body.
    pub etag: Option<String>,
    pub expiration_utc: Option<DateTime<Utc>>,
}

/// Paging and grouping parameters of a listing.
#[derive(Debug, Clone, Default)]
pub struct EnumerationQuery {
    pub prefix: String,
    pub delimiter: Option<String>,
    /// Row id to resume from; 0 starts at the beginning.
    pub start_index: i64,
    /// Cap on returned objects. Common prefixes do not count.
    pub max_results: u32,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnumerationResult {
    pub objects: Vec<ObjectRecord>,
    /// Common prefixes, sorted and deduplicated.
    pub prefixes: Vec<String>,
    /// Cursor for the next page: last consumed row id + 1.
    pub next_start_index: i64,
    pub is_truncated: bool,
}

/// Aggregate size of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStatistics {
    pub name: String,
    pub guid: String,
    pub objects: u64,
    pub bytes: u64,
}

/// An object version opened for reading.
pub struct ObjectStream {
    pub object: ObjectRecord,
    /// Bytes `reader` will yield.
    pub length: u64,
    pub reader: BlobReader,
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("key", &self.object.key)
            .field("version", &self.object.version)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

pub struct BucketClient {
    /// Cached bucket row; versioning and public flags are read from here.
    config: RwLock<BucketRecord>,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageDriver>,
}

impl std::fmt::Debug for BucketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config.read().expect("lock poisoned");
        f.debug_struct("BucketClient")
            .field("name", &config.name)
            .field("guid", &config.guid)
            .field("versioning", &config.enable_versioning)
            .finish_non_exhaustive()
    }
}

impl BucketClient {
    pub fn new(
        config: BucketRecord,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageDriver>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            metadata,
            storage,
        }
    }

    /// Snapshot of the cached bucket row.
    pub fn config(&self) -> BucketRecord {
        self.config.read().expect("lock poisoned").clone()
    }

    /// Replace the cached bucket row.
    pub fn set_config(&self, config: BucketRecord) {
        *self.config.write().expect("lock poisoned") = config;
    }

    pub fn guid(&self) -> String {
        self.config.read().expect("lock poisoned").guid.clone()
    }

    pub fn name(&self) -> String {
        self.config.read().expect("lock poisoned").name.clone()
    }

    fn versioning_enabled(&self) -> bool {
        self.config.read().expect("lock poisoned").enable_versioning
    }

    pub fn storage(&self) -> &Arc<dyn StorageDriver> {
        &self.storage
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Store a new version of `write.key`.
    ///
    /// With versioning disabled an existing live version is a conflict.
    /// The blob is fully written before the row is inserted, so a visible
    /// row always has its bytes.  The version number and the conflict
    /// check are settled by the store at insert time, so concurrent
    /// writers of one key get distinct versions or a clean conflict.
    pub async fn add_object(&self, write: ObjectWrite, body: BlobReader) -> S3Result<ObjectRecord> {
        if write.key.is_empty() {
            return Err(S3Error::InvalidArgument {
                message: "object key must not be empty".to_string(),
            });
        }
        let bucket_guid = self.guid();
        let versioning = self.versioning_enabled();

        // Fail fast before streaming the body; the insert re-checks.
        if !versioning
            && self
                .metadata
                .get_latest_object(&bucket_guid, &write.key)
                .await?
                .is_some()
        {
            return Err(S3Error::ObjectExists { key: write.key });
        }

        let guid = uuid::Uuid::new_v4().to_string();
        let written = self.storage.write(&guid, write.content_length, body).await?;

        let now = Utc::now();
        let mut record = ObjectRecord {
            id: 0,
            guid: guid.clone(),
            bucket_guid,
            owner_guid: write.owner_guid,
            author_guid: write.author_guid,
            is_folder: write.key.ends_with('/') && written.length == 0,
            key: write.key,
            content_type: write
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_length: written.length,
            version: 0,
            etag: write.etag.unwrap_or_else(|| written.md5.clone()),
            md5: written.md5,
            blob_filename: guid.clone(),
            delete_marker: false,
            created_utc: now,
            last_update_utc: now,
            last_access_utc: now,
            expiration_utc: write.expiration_utc,
        };

        let inserted = self
            .metadata
            .insert_object_version(record.clone(), versioning)
            .await;
        let error = match inserted {
            Ok(VersionInsert::Inserted { id, version }) => {
                record.id = id;
                record.version = version;
                None
            }
            Ok(VersionInsert::LiveVersionExists) => Some(S3Error::ObjectExists {
                key: record.key.clone(),
            }),
            Err(e) => Some(S3Error::from(e)),
        };
        if let Some(error) = error {
            if let Err(cleanup) = self.storage.delete(&guid).await {
                warn!("Failed to remove orphaned blob {}: {}", guid, cleanup);
            }
            return Err(error);
        }

        info!(
            "Stored {}/{} version {} ({} bytes)",
            self.name(),
            record.key,
            record.version,
            record.content_length
        );
        Ok(record)
    }

    /// Delete the latest live version of `key`. Returns false if none exists.
    pub async fn delete_latest_object(&self, key: &str) -> S3Result<bool> {
        match self.metadata.get_latest_object(&self.guid(), key).await? {
            Some(object) => self.delete_row(object).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Delete one exact version. Returns false if it does not exist.
    pub async fn delete_object_version(&self, key: &str, version: i64) -> S3Result<bool> {
        match self
            .metadata
            .get_object_version(&self.guid(), key, version)
            .await?
        {
            Some(object) => self.delete_row(object).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Tombstone the row when versioning is on, otherwise remove row and blob.
    async fn delete_row(&self, mut object: ObjectRecord) -> S3Result<()> {
        if self.versioning_enabled() {
            if object.delete_marker {
                return Ok(());
            }
            object.delete_marker = true;
            object.last_update_utc = Utc::now();
            self.metadata.update_object(object.clone()).await?;
            info!(
                "Marked {}/{} version {} deleted",
                self.name(),
                object.key,
                object.version
            );
        } else {
            self.metadata.delete_object(&object.guid).await?;
            self.storage.delete(&object.blob_filename).await?;
            info!(
                "Deleted {}/{} version {}",
                self.name(),
                object.key,
                object.version
            );
        }
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_object_latest_metadata(&self, key: &str) -> S3Result<Option<ObjectRecord>> {
        Ok(self.metadata.get_latest_object(&self.guid(), key).await?)
    }

    /// Exact version row, delete markers included.
    pub async fn get_object_version_metadata(
        &self,
        key: &str,
        version: i64,
    ) -> S3Result<Option<ObjectRecord>> {
        Ok(self
            .metadata
            .get_object_version(&self.guid(), key, version)
            .await?)
    }

    /// Version row by GUID, if it belongs to this bucket.
    pub async fn get_object_metadata_by_guid(&self, guid: &str) -> S3Result<Option<ObjectRecord>> {
        let bucket_guid = self.guid();
        Ok(self
            .metadata
            .get_object_by_guid(guid)
            .await?
            .filter(|o| o.bucket_guid == bucket_guid))
    }

    /// Latest live version or one exact version; a tombstoned version
    /// cannot be read.
    async fn resolve_readable(
        &self,
        key: &str,
        version: Option<i64>,
    ) -> S3Result<Option<ObjectRecord>> {
        let object = match version {
            None => self.get_object_latest_metadata(key).await?,
            Some(v) => self.get_object_version_metadata(key, v).await?,
        };
        Ok(object.filter(|o| !o.delete_marker))
    }

    /// Latest live version together with its full contents.
    pub async fn get_object_latest(&self, key: &str) -> S3Result<Option<(ObjectRecord, Bytes)>> {
        let Some(object) = self.resolve_readable(key, None).await? else {
            return Ok(None);
        };
        let data = self.storage.read(&object.blob_filename).await?;
        Ok(Some((object, data)))
    }

    /// Open a version for streaming. `None` version means latest.
    pub async fn get_object_stream(
        &self,
        key: &str,
        version: Option<i64>,
    ) -> S3Result<Option<ObjectStream>> {
        let Some(object) = self.resolve_readable(key, version).await? else {
            return Ok(None);
        };
        let blob = self.storage.read_stream(&object.blob_filename).await?;
        Ok(Some(ObjectStream {
            object,
            length: blob.length,
            reader: blob.reader,
        }))
    }

    /// Open `length` bytes of a version starting at `start`.
    ///
    /// The range is checked against the blob's real size before it is
    /// opened; a range past the end is [`S3Error::InvalidRange`].
    pub async fn get_object_range(
        &self,
        key: &str,
        version: Option<i64>,
        start: u64,
        length: u64,
    ) -> S3Result<Option<ObjectStream>> {
        let Some(object) = self.resolve_readable(key, version).await? else {
            return Ok(None);
        };
        let actual = self.storage.length(&object.blob_filename).await?;
        match start.checked_add(length) {
            Some(end) if end <= actual => {}
            _ => {
                debug!(
                    "Range {}+{} outside {}/{} ({} bytes)",
                    start,
                    length,
                    self.name(),
                    key,
                    actual
                );
                return Err(S3Error::InvalidRange);
            }
        }
        let blob = self
            .storage
            .read_range_stream(&object.blob_filename, start, length)
            .await?;
        Ok(Some(ObjectStream {
            object,
            length: blob.length,
            reader: blob.reader,
        }))
    }

    // ── Enumeration ─────────────────────────────────────────────────

    /// List the latest live version of each key, grouped by delimiter.
    ///
    /// Rows are visited in insertion order from `start_index`.  Keys whose
    /// remainder after the prefix contains the delimiter, and empty folder
    /// objects, become common prefixes.
    pub async fn enumerate(&self, query: EnumerationQuery) -> S3Result<EnumerationResult> {
        self.scan(query, true).await
    }

    /// List every version row, delete markers and superseded versions
    /// included, without prefix grouping.
    pub async fn enumerate_versions(
        &self,
        prefix: &str,
        start_index: i64,
        max_results: u32,
    ) -> S3Result<EnumerationResult> {
        let query = EnumerationQuery {
            prefix: prefix.to_string(),
            delimiter: None,
            start_index,
            max_results,
        };
        self.scan(query, false).await
    }

    async fn scan(&self, query: EnumerationQuery, latest_only: bool) -> S3Result<EnumerationResult> {
        let bucket_guid = self.guid();
        let max_results = match query.max_results {
            0 => DEFAULT_MAX_RESULTS,
            n => n,
        } as usize;
        let delimiter = query.delimiter.as_deref().filter(|d| !d.is_empty());

        let mut cursor = query.start_index.max(0);
        let mut objects = Vec::new();
        let mut prefixes = BTreeSet::new();
        let mut is_truncated = false;

        'scan: loop {
            let batch = self
                .metadata
                .enumerate_objects(
                    &bucket_guid,
                    &query.prefix,
                    cursor,
                    ENUMERATION_BATCH,
                    latest_only,
                )
                .await?;
            let exhausted = (batch.len() as u32) < ENUMERATION_BATCH;

            for object in batch {
                if objects.len() >= max_results {
                    is_truncated = true;
                    break 'scan;
                }
                cursor = object.id + 1;

                if latest_only {
                    let rest = object
                        .key
                        .strip_prefix(query.prefix.as_str())
                        .unwrap_or(&object.key);
                    if let Some(pos) = delimiter.and_then(|d| rest.find(d).map(|p| p + d.len())) {
                        prefixes.insert(format!("{}{}", query.prefix, &rest[..pos]));
                        continue;
                    }
                    if object.is_folder && object.content_length == 0 {
                        prefixes.insert(object.key);
                        continue;
                    }
                }
                objects.push(object);
            }

            if exhausted {
                break;
            }
        }

        Ok(EnumerationResult {
            objects,
            prefixes: prefixes.into_iter().collect(),
            next_start_index: cursor,
            is_truncated,
        })
    }

    // ── Tags ────────────────────────────────────────────────────────

    pub async fn get_bucket_tags(&self) -> S3Result<Vec<BucketTagRecord>> {
        Ok(self.metadata.list_bucket_tags(&self.guid()).await?)
    }

    /// Replace the bucket's tag set. An empty set clears it.
    pub async fn add_bucket_tags(&self, tags: Vec<(String, String)>) -> S3Result<()> {
        let bucket_guid = self.guid();
        let records = tags
            .into_iter()
            .map(|(key, value)| BucketTagRecord {
                guid: uuid::Uuid::new_v4().to_string(),
                bucket_guid: bucket_guid.clone(),
                key,
                value,
            })
            .collect();
        self.metadata.replace_bucket_tags(&bucket_guid, records).await?;
        Ok(())
    }

    pub async fn delete_bucket_tags(&self) -> S3Result<()> {
        self.add_bucket_tags(Vec::new()).await
    }

    pub async fn get_object_tags(&self, object_guid: &str) -> S3Result<Vec<ObjectTagRecord>> {
        Ok(self.metadata.list_object_tags(object_guid).await?)
    }

    /// Replace the tag set of one object version. Returns false if the
    /// version is not in this bucket.
    pub async fn add_object_version_tags(
        &self,
        object_guid: &str,
        tags: Vec<(String, String)>,
    ) -> S3Result<bool> {
        let Some(object) = self.get_object_metadata_by_guid(object_guid).await? else {
            return Ok(false);
        };
        let records = tags
            .into_iter()
            .map(|(key, value)| ObjectTagRecord {
                guid: uuid::Uuid::new_v4().to_string(),
                bucket_guid: object.bucket_guid.clone(),
                object_guid: object.guid.clone(),
                key,
                value,
            })
            .collect();
        self.metadata.replace_object_tags(&object.guid, records).await?;
        Ok(true)
    }

    pub async fn delete_object_tags(&self, object_guid: &str) -> S3Result<bool> {
        self.add_object_version_tags(object_guid, Vec::new()).await
    }

    // ── ACLs ────────────────────────────────────────────────────────

    pub async fn get_bucket_acls(&self) -> S3Result<Vec<BucketAclRecord>> {
        Ok(self.metadata.list_bucket_acls(&self.guid()).await?)
    }

    /// Grant `permissions` to `grantee`, replacing its existing grant.
    pub async fn add_bucket_acl(
        &self,
        grantee: Grantee,
        issued_by_user_guid: &str,
        permissions: AclPermissions,
    ) -> S3Result<()> {
        let record = BucketAclRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            bucket_guid: self.guid(),
            grantee,
            issued_by_user_guid: issued_by_user_guid.to_string(),
            permissions,
            created_utc: Utc::now(),
        };
        self.metadata.upsert_bucket_acl(record).await?;
        Ok(())
    }

    pub async fn delete_bucket_acls(&self) -> S3Result<()> {
        self.metadata.delete_bucket_acls(&self.guid()).await?;
        Ok(())
    }

    pub async fn bucket_user_acl_exists(&self, user_guid: &str) -> S3Result<bool> {
        let grantee = Grantee::User(user_guid.to_string());
        Ok(self
            .metadata
            .get_bucket_acl(&self.guid(), &grantee)
            .await?
            .is_some())
    }

    pub async fn bucket_group_acl_exists(&self, group: UserGroup) -> S3Result<bool> {
        let grantee = Grantee::Group(group);
        Ok(self
            .metadata
            .get_bucket_acl(&self.guid(), &grantee)
            .await?
            .is_some())
    }

    pub async fn get_object_acls(&self, object_guid: &str) -> S3Result<Vec<ObjectAclRecord>> {
        Ok(self.metadata.list_object_acls(object_guid).await?)
    }

    /// Grant `permissions` on one object version. Returns false if the
    /// version is not in this bucket.
    pub async fn add_object_acl(
        &self,
        object_guid: &str,
        grantee: Grantee,
        issued_by_user_guid: &str,
        permissions: AclPermissions,
    ) -> S3Result<bool> {
        let Some(object) = self.get_object_metadata_by_guid(object_guid).await? else {
            return Ok(false);
        };
        let record = ObjectAclRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            bucket_guid: object.bucket_guid,
            object_guid: object.guid,
            grantee,
            issued_by_user_guid: issued_by_user_guid.to_string(),
            permissions,
            created_utc: Utc::now(),
        };
        self.metadata.upsert_object_acl(record).await?;
        Ok(true)
    }

    pub async fn delete_object_acls(&self, object_guid: &str) -> S3Result<()> {
        self.metadata.delete_object_acls(object_guid).await?;
        Ok(())
    }

    pub async fn object_user_acl_exists(&self, object_guid: &str, user_guid: &str) -> S3Result<bool> {
        let grantee = Grantee::User(user_guid.to_string());
        Ok(self
            .metadata
            .get_object_acl(object_guid, &grantee)
            .await?
            .is_some())
    }

    pub async fn object_group_acl_exists(
        &self,
        object_guid: &str,
        group: UserGroup,
    ) -> S3Result<bool> {
        let grantee = Grantee::Group(group);
        Ok(self
            .metadata
            .get_object_acl(object_guid, &grantee)
            .await?
            .is_some())
    }

    // ── Statistics ──────────────────────────────────────────────────

    /// Count and size of every row in the bucket, in one aggregate query.
    pub async fn get_full_statistics(&self) -> S3Result<BucketStatistics> {
        let config = self.config();
        let stats = self.metadata.object_statistics(&config.guid).await?;
        Ok(BucketStatistics {
            name: config.name,
            guid: config.guid,
            objects: stats.objects,
            bytes: stats.bytes,
        })
    }

    /// Count and size over rows the caller already holds.
    pub fn get_statistics(objects: &[ObjectRecord]) -> ObjectStatistics {
        ObjectStatistics {
            objects: objects.len() as u64,
            bytes: objects.iter().map(|o| o.content_length).sum(),
        }
    }

    /// Whether the bucket holds no rows at all, delete markers included.
    pub async fn is_empty(&self) -> S3Result<bool> {
        Ok(self.get_full_statistics().await?.objects == 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
