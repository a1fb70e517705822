//! Background expiry of abandoned multipart uploads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::S3Result;
use crate::multipart::MultipartManager;

/// Periodically removes uploads past their expiration time, deleting
/// their part files and rows.
pub struct CleanupManager {
    multipart: Arc<MultipartManager>,
    interval_seconds: u64,
    /// Flag used to signal the background task to stop.
    shutdown: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(multipart: Arc<MultipartManager>, interval_seconds: u64) -> Self {
        Self {
            multipart,
            interval_seconds,
            shutdown: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// One sweep of uploads that expired before `now`. Returns the number
    /// of uploads removed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> S3Result<usize> {
        let removed = self.multipart.expire(now).await?;
        if removed > 0 {
            info!("Cleanup removed {} expired upload(s)", removed);
        } else {
            debug!("Cleanup found no expired uploads");
        }
        Ok(removed)
    }

    /// Spawn the sweep loop. A zero interval disables it.
    ///
    /// The task runs until [`close`](Self::close) is called.
    pub fn start(self: &Arc<Self>) {
        if self.interval_seconds == 0 {
            return;
        }
        let manager = Arc::clone(self);
        let interval_secs = self.interval_seconds;

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if manager.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = manager.run_once(Utc::now()).await {
                    error!("Upload cleanup failed: {e}");
                }
            }
        });
        *self.task.lock().expect("mutex poisoned") = Some(handle);
        info!("Upload cleanup every {}s", interval_secs);
    }

    /// Stop the sweep loop without waiting for the next tick.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().expect("mutex poisoned").take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::manager::BucketManager;
    use crate::config::StorageConfig;
    use crate::config_manager::ConfigManager;
    use crate::metadata::sqlite::SqliteMetadataStore;

    #[tokio::test]
    async fn test_run_once_expires_past_uploads() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = StorageConfig {
            root_dir: dir.path().join("disk").to_string_lossy().into_owned(),
            temp_dir: dir.path().join("temp").to_string_lossy().into_owned(),
        };
        let store = SqliteMetadataStore::new(":memory:").unwrap();
        let config_manager = Arc::new(ConfigManager::new(Arc::new(store)));
        // Zero-day expiry: every upload is expired as soon as time moves on.
        let multipart = Arc::new(
            MultipartManager::new(config_manager.clone(), &storage.temp_dir, 0).unwrap(),
        );
        let buckets =
            BucketManager::load(storage, "us-west-1", config_manager, multipart.clone())
                .await
                .unwrap();
        let client = buckets.add(buckets.new_record("b1", "o")).await.unwrap();
        let upload = multipart.initiate(&client, "k", None, "o", "o").await.unwrap();

        let cleanup = CleanupManager::new(multipart.clone(), 60);
        // Expiry is strict: an upload is still live at its expiration instant.
        assert_eq!(cleanup.run_once(upload.expiration_utc).await.unwrap(), 0);
        let later = upload.expiration_utc + chrono::Duration::seconds(1);
        assert_eq!(cleanup.run_once(later).await.unwrap(), 1);
        assert_eq!(cleanup.run_once(later).await.unwrap(), 0);
        assert!(multipart.list_uploads(&client).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SqliteMetadataStore::new(":memory:").unwrap();
        let config_manager = Arc::new(ConfigManager::new(Arc::new(store)));
        let multipart =
            Arc::new(MultipartManager::new(config_manager, dir.path().join("temp"), 7).unwrap());

        let cleanup = Arc::new(CleanupManager::new(multipart, 3600));
        cleanup.start();
        assert!(cleanup.task.lock().unwrap().is_some());
        cleanup.close();
        assert!(cleanup.task.lock().unwrap().is_none());
        assert!(cleanup.shutdown.load(Ordering::Relaxed));
    }
}
