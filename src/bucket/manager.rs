//! Registry of live buckets.
//!
//! The [`BucketManager`] owns one [`BucketClient`] per configured bucket,
//! keyed by name.  The map sits behind a single mutex that is only held
//! for map access, never across I/O.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use super::client::BucketClient;
use crate::config::StorageConfig;
use crate::config_manager::ConfigManager;
use crate::errors::{S3Error, S3Result};
use crate::metadata::store::{BucketRecord, MetadataStore, StorageType};
use crate::multipart::MultipartManager;
use crate::storage::disk::DiskStorageDriver;

/// Outcome of [`BucketManager::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketRemoval {
    NotFound,
    /// Refused: the bucket still holds object rows and `destroy` was not set.
    NotEmpty,
    /// Unregistered and config row deleted; data left on disk.
    Removed,
    /// Removed and every on-disk stage deleted.
    Destroyed,
    /// Removed, but at least one destroy stage failed (see logs).
    DestroyIncomplete,
}

/// Validate a bucket name.
///
/// The name doubles as a directory name under the storage root, so it
/// follows the S3 character rules, with short names allowed:
/// - 1-63 characters long
/// - Only lowercase letters, numbers, hyphens, and periods
/// - Must begin and end with a letter or number
/// - Cannot be formatted as an IP address (e.g., 192.168.5.4)
/// - Must not start with `xn--` or end with `-s3alias` or `--ol-s3`
pub fn validate_bucket_name(name: &str) -> S3Result<()> {
    let invalid = || S3Error::InvalidBucketName {
        name: name.to_string(),
    };

    if !(1..=63).contains(&name.len()) {
        return Err(invalid());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid());
    }
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(invalid());
    }
    if name.contains("..") || looks_like_ip(name) {
        return Err(invalid());
    }
    if name.starts_with("xn--") || name.ends_with("-s3alias") || name.ends_with("--ol-s3") {
        return Err(invalid());
    }
    Ok(())
}

/// Check whether a string looks like an IPv4 address (e.g., "192.168.5.4").
fn looks_like_ip(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.parse::<u8>().is_ok())
}

pub struct BucketManager {
    clients: Mutex<HashMap<String, Arc<BucketClient>>>,
    config_manager: Arc<ConfigManager>,
    metadata: Arc<dyn MetadataStore>,
    /// Aborts a bucket's pending uploads when the bucket is removed.
    multipart: Arc<MultipartManager>,
    storage: StorageConfig,
    region: String,
}

impl BucketManager {
    /// Build a client for every configured bucket.
    ///
    /// Fails if any bucket's storage directory cannot be initialized.
    pub async fn load(
        storage: StorageConfig,
        region: impl Into<String>,
        config_manager: Arc<ConfigManager>,
        multipart: Arc<MultipartManager>,
    ) -> S3Result<Self> {
        let metadata = config_manager.metadata().clone();
        let manager = Self {
            clients: Mutex::new(HashMap::new()),
            config_manager,
            metadata,
            multipart,
            storage,
            region: region.into(),
        };

        let buckets = manager.config_manager.get_buckets().await?;
        let mut loaded = HashMap::with_capacity(buckets.len());
        for record in buckets {
            let client = manager.build_client(record.clone()).map_err(|e| {
                S3Error::InternalError(e.context(format!(
                    "failed to initialize storage for bucket {}",
                    record.name
                )))
            })?;
            loaded.insert(record.name, Arc::new(client));
        }
        info!("Loaded {} bucket(s)", loaded.len());
        *manager.clients.lock().expect("mutex poisoned") = loaded;
        Ok(manager)
    }

    fn build_client(&self, record: BucketRecord) -> anyhow::Result<BucketClient> {
        let storage = match record.storage_type {
            StorageType::Disk => DiskStorageDriver::new(&record.disk_directory)?,
        };
        Ok(BucketClient::new(
            record,
            self.metadata.clone(),
            Arc::new(storage),
        ))
    }

    /// A fresh bucket row for `name` with the configured region and layout.
    pub fn new_record(&self, name: &str, owner_guid: &str) -> BucketRecord {
        BucketRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_guid: owner_guid.to_string(),
            region: self.region.clone(),
            storage_type: StorageType::Disk,
            disk_directory: self
                .storage
                .bucket_objects_dir(name)
                .to_string_lossy()
                .into_owned(),
            enable_versioning: false,
            enable_public_read: false,
            enable_public_write: false,
            created_utc: Utc::now(),
        }
    }

    /// Persist, initialize, and register a bucket.
    pub async fn add(&self, record: BucketRecord) -> S3Result<Arc<BucketClient>> {
        validate_bucket_name(&record.name)?;
        if self.exists(&record.name) {
            return Err(S3Error::BucketAlreadyExists {
                bucket: record.name,
            });
        }

        self.config_manager.add_bucket(record.clone()).await?;
        let client = match self.build_client(record.clone()) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                // Leave no row behind that the registry does not know.
                self.config_manager.remove_bucket(&record.guid).await?;
                return Err(e.into());
            }
        };

        self.clients
            .lock()
            .expect("mutex poisoned")
            .insert(record.name.clone(), client.clone());
        info!("Added bucket {} ({})", record.name, record.guid);
        Ok(client)
    }

    /// Unregister a bucket and delete its config row; with `destroy`, also
    /// delete its data on disk.
    ///
    /// A bucket that still holds object rows is only removed with
    /// `destroy`, since its blobs would otherwise be orphaned.  Pending
    /// uploads are aborted first so no staged part outlives its row.  The
    /// client stays registered until the row is gone.  Once the row is
    /// deleted, destroy failures only downgrade the result.
    pub async fn remove(&self, name: &str, destroy: bool) -> S3Result<BucketRemoval> {
        let record = match self.get_client(name) {
            Some(client) => client.config(),
            None => match self.config_manager.get_bucket_by_name(name).await? {
                Some(record) => record,
                None => return Ok(BucketRemoval::NotFound),
            },
        };

        if !destroy && self.metadata.object_statistics(&record.guid).await?.objects > 0 {
            info!("Refusing to remove non-empty bucket {}", record.name);
            return Ok(BucketRemoval::NotEmpty);
        }

        let aborted = self.multipart.discard_bucket(&record.guid).await?;
        if aborted > 0 {
            info!("Aborted {} upload(s) in bucket {}", aborted, record.name);
        }

        self.config_manager.remove_bucket(&record.guid).await?;
        self.clients.lock().expect("mutex poisoned").remove(name);
        info!("Removed bucket {} ({})", record.name, record.guid);

        if !destroy {
            return Ok(BucketRemoval::Removed);
        }
        let root = self.storage.bucket_root(&record.name);
        let destroyed =
            destroy_directory(&root, Path::new(&record.disk_directory)).await;
        Ok(if destroyed {
            BucketRemoval::Destroyed
        } else {
            BucketRemoval::DestroyIncomplete
        })
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<BucketClient>> {
        self.clients.lock().expect("mutex poisoned").get(name).cloned()
    }

    /// Cached config row of a registered bucket.
    pub fn get(&self, name: &str) -> Option<BucketRecord> {
        self.get_client(name).map(|c| c.config())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.clients.lock().expect("mutex poisoned").contains_key(name)
    }

    /// Config rows of every registered bucket, sorted by name.
    pub fn list(&self) -> Vec<BucketRecord> {
        let mut records: Vec<_> = self
            .clients
            .lock()
            .expect("mutex poisoned")
            .values()
            .map(|c| c.config())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Persist new settings for a registered bucket and refresh its client.
    pub async fn update(&self, record: BucketRecord) -> S3Result<bool> {
        let Some(client) = self.get_client(&record.name) else {
            return Ok(false);
        };
        if client.guid() != record.guid {
            return Err(S3Error::InvalidArgument {
                message: format!("bucket {} has a different GUID", record.name),
            });
        }
        if !self.config_manager.update_bucket(record.clone()).await? {
            return Ok(false);
        }
        client.set_config(record);
        Ok(true)
    }
}

/// Delete a bucket's data in four stages: object files, object directory,
/// remaining root files, root directory.
///
/// Every stage runs even if an earlier one failed.  Returns true only if
/// all stages succeeded.  A missing path counts as success.
pub async fn destroy_directory(root: &Path, objects_dir: &Path) -> bool {
    let object_files = remove_files(objects_dir).await;
    if !object_files {
        warn!("Failed to delete object files in {}", objects_dir.display());
    }

    let object_dir = remove_dir(objects_dir).await;
    if !object_dir {
        warn!("Failed to delete object directory {}", objects_dir.display());
    }

    let root_files = remove_files(root).await;
    if !root_files {
        warn!("Failed to delete files in {}", root.display());
    }

    let root_dir = remove_dir(root).await;
    if !root_dir {
        warn!("Failed to delete directory {}", root.display());
    }

    object_files && object_dir && root_files && root_dir
}

/// Remove every regular file directly inside `dir`.
async fn remove_files(dir: &Path) -> bool {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
        Err(e) => {
            warn!("Cannot read {}: {}", dir.display(), e);
            return false;
        }
    };

    let mut ok = true;
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                let is_file = entry.file_type().await.map(|t| !t.is_dir()).unwrap_or(false);
                if is_file {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Cannot delete {}: {}", path.display(), e);
                        ok = false;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Cannot read {}: {}", dir.display(), e);
                ok = false;
                break;
            }
        }
    }
    ok
}

/// Remove `dir` and anything still under it.
async fn remove_dir(dir: &Path) -> bool {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("Cannot delete {}: {}", dir.display(), e);
            false
        }
    }
}
