//! lessd library: the core of an S3-compatible object storage server.
//!
//! This crate holds the authorization cascade and the bucket/object
//! engine: versioned objects, tags, ACLs, enumeration, and multipart
//! uploads, persisted in SQLite with blobs on local disk.  An HTTP layer
//! in front of it parses requests into a [`request::RequestContext`] and
//! renders the results.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

pub mod auth;
pub mod bucket;
pub mod cleanup;
pub mod config;
pub mod config_manager;
pub mod errors;
pub mod metadata;
pub mod multipart;
pub mod request;
pub mod storage;

pub use metadata::sqlite;

use crate::auth::AuthManager;
use crate::bucket::manager::BucketManager;
use crate::cleanup::CleanupManager;
use crate::config::Config;
use crate::config_manager::ConfigManager;
use crate::errors::S3Result;
use crate::metadata::sqlite::SqliteMetadataStore;
use crate::metadata::store::MetadataStore;
use crate::multipart::MultipartManager;
use crate::request::{RequestContext, RequestMetadata};

/// Every long-lived component, wired together once at startup.
pub struct AppState {
    pub config: Config,
    pub config_manager: Arc<ConfigManager>,
    pub bucket_manager: BucketManager,
    pub auth: AuthManager,
    pub multipart: Arc<MultipartManager>,
    pub cleanup: Arc<CleanupManager>,
}

impl AppState {
    /// Open the metadata database, seed the default credential, and load
    /// every configured bucket.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let db_path = &config.metadata.sqlite.path;
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(db_path)?);
        info!("Metadata store opened at {}", db_path);

        let config_manager = Arc::new(ConfigManager::new(store));
        config_manager.seed_default_credential(&config.auth).await?;

        let multipart = Arc::new(MultipartManager::new(
            config_manager.clone(),
            &config.storage.temp_dir,
            config.cleanup.upload_expiration_days,
        )?);
        let bucket_manager = BucketManager::load(
            config.storage.clone(),
            config.server.region.clone(),
            config_manager.clone(),
            multipart.clone(),
        )
        .await?;

        let cleanup = Arc::new(CleanupManager::new(
            multipart.clone(),
            config.cleanup.interval_seconds,
        ));

        Ok(Self {
            auth: AuthManager::new(&config.auth),
            config,
            config_manager,
            bucket_manager,
            multipart,
            cleanup,
        })
    }

    /// Resolve everything a request refers to and decide whether it may
    /// proceed.
    ///
    /// Unknown access keys, buckets, keys, or versions leave the matching
    /// fields empty; only store and I/O failures are errors.
    pub async fn process(&self, context: RequestContext) -> S3Result<RequestMetadata> {
        let mut md = RequestMetadata::new(context);

        if let Some(access_key) = md.context.access_key.as_deref().filter(|k| !k.is_empty()) {
            md.credential = self
                .config_manager
                .get_credential_by_access_key(access_key)
                .await?;
            if let Some(credential) = &md.credential {
                md.user = self
                    .config_manager
                    .get_user_by_guid(&credential.user_guid)
                    .await?;
            }
        }

        if let Some(name) = md.context.bucket_name.as_deref() {
            md.bucket_client = self.bucket_manager.get_client(name);
        }

        if let Some(client) = md.bucket_client.clone() {
            md.bucket = Some(client.config());
            md.bucket_acls = client.get_bucket_acls().await?;
            md.bucket_tags = client.get_bucket_tags().await?;

            if let Some(key) = md.context.key.as_deref().filter(|k| !k.is_empty()) {
                md.object = match md.context.version() {
                    Ok(None) => client.get_object_latest_metadata(key).await?,
                    Ok(Some(version)) => client.get_object_version_metadata(key, version).await?,
                    Err(raw) => {
                        debug!("Ignoring unparseable version id {:?}", raw);
                        None
                    }
                };
            }

            if let Some(object) = &md.object {
                md.object_acls = client.get_object_acls(&object.guid).await?;
                md.object_tags = client.get_object_tags(&object.guid).await?;
            }
        }

        self.auth.authorize(&mut md);
        Ok(md)
    }

    /// Stop background work.
    pub fn close(&self) {
        self.cleanup.close();
    }
}
