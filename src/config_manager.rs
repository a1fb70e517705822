//! CRUD over users, credentials, buckets, and multipart uploads.
//!
//! A thin layer over the [`MetadataStore`] that adds uniqueness and
//! argument checks.  Absent rows come back as `None` or `false`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::errors::{S3Error, S3Result};
use crate::metadata::store::{
    BucketRecord, CredentialRecord, MetadataStore, UploadPartRecord, UploadRecord, UserRecord,
};

/// Highest part number a multipart upload accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

fn require(value: &str, what: &str) -> S3Result<()> {
    if value.trim().is_empty() {
        return Err(S3Error::InvalidArgument {
            message: format!("{what} must not be empty"),
        });
    }
    Ok(())
}

pub struct ConfigManager {
    metadata: Arc<dyn MetadataStore>,
}

impl ConfigManager {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Create a user. Emails are unique across users.
    pub async fn add_user(&self, name: &str, email: &str) -> S3Result<UserRecord> {
        require(name, "user name")?;
        require(email, "user email")?;
        if self.metadata.get_user_by_email(email).await?.is_some() {
            return Err(S3Error::UserAlreadyExists {
                email: email.to_string(),
            });
        }

        let record = UserRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.to_string(),
            created_utc: Utc::now(),
        };
        self.metadata.insert_user(record.clone()).await?;
        info!("Added user {} ({})", record.email, record.guid);
        Ok(record)
    }

    pub async fn get_user_by_guid(&self, guid: &str) -> S3Result<Option<UserRecord>> {
        Ok(self.metadata.get_user(guid).await?)
    }

    pub async fn get_user_by_email(&self, email: &str) -> S3Result<Option<UserRecord>> {
        Ok(self.metadata.get_user_by_email(email).await?)
    }

    pub async fn get_users(&self) -> S3Result<Vec<UserRecord>> {
        Ok(self.metadata.list_users().await?)
    }

    /// Remove a user. Its credentials are left in place and stop resolving.
    pub async fn remove_user(&self, guid: &str) -> S3Result<bool> {
        if self.metadata.get_user(guid).await?.is_none() {
            return Ok(false);
        }
        self.metadata.delete_user(guid).await?;
        info!("Removed user {}", guid);
        Ok(true)
    }

    // ── Credentials ─────────────────────────────────────────────────

    /// Create a credential for an existing user. Access keys are unique.
    pub async fn add_credential(
        &self,
        user_guid: &str,
        access_key: &str,
        secret_key: &str,
        description: &str,
    ) -> S3Result<CredentialRecord> {
        require(user_guid, "user GUID")?;
        require(access_key, "access key")?;
        require(secret_key, "secret key")?;
        if self.metadata.get_user(user_guid).await?.is_none() {
            return Err(S3Error::NoSuchUser {
                user: user_guid.to_string(),
            });
        }
        if self.metadata.get_credential(access_key).await?.is_some() {
            return Err(S3Error::CredentialAlreadyExists {
                access_key: access_key.to_string(),
            });
        }

        let record = CredentialRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            user_guid: user_guid.to_string(),
            description: description.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            is_base64: false,
            created_utc: Utc::now(),
        };
        self.metadata.insert_credential(record.clone()).await?;
        info!("Added credential {} for user {}", record.access_key, user_guid);
        Ok(record)
    }

    pub async fn get_credential_by_access_key(
        &self,
        access_key: &str,
    ) -> S3Result<Option<CredentialRecord>> {
        Ok(self.metadata.get_credential(access_key).await?)
    }

    pub async fn get_credential_by_guid(&self, guid: &str) -> S3Result<Option<CredentialRecord>> {
        Ok(self.metadata.get_credential_by_guid(guid).await?)
    }

    pub async fn get_credentials_by_user(
        &self,
        user_guid: &str,
    ) -> S3Result<Vec<CredentialRecord>> {
        Ok(self.metadata.list_credentials(Some(user_guid)).await?)
    }

    pub async fn get_credentials(&self) -> S3Result<Vec<CredentialRecord>> {
        Ok(self.metadata.list_credentials(None).await?)
    }

    pub async fn remove_credential(&self, guid: &str) -> S3Result<bool> {
        if self.metadata.get_credential_by_guid(guid).await?.is_none() {
            return Ok(false);
        }
        self.metadata.delete_credential(guid).await?;
        info!("Removed credential {}", guid);
        Ok(true)
    }

    /// Ensure the configured default user and credential exist.
    ///
    /// Safe to call on every startup: an existing access key is left
    /// untouched.
    pub async fn seed_default_credential(&self, auth: &AuthConfig) -> S3Result<()> {
        if auth.access_key.is_empty() || auth.secret_key.is_empty() {
            debug!("No default credential configured, skipping seed");
            return Ok(());
        }
        if self.metadata.get_credential(&auth.access_key).await?.is_some() {
            debug!("Default credential {} already present", auth.access_key);
            return Ok(());
        }

        let user = match self.metadata.get_user_by_email(&auth.user_email).await? {
            Some(user) => user,
            None => self.add_user(&auth.user_name, &auth.user_email).await?,
        };
        self.add_credential(
            &user.guid,
            &auth.access_key,
            &auth.secret_key,
            "Default credential",
        )
        .await?;
        info!("Seeded default credential {}", auth.access_key);
        Ok(())
    }

    // ── Buckets ─────────────────────────────────────────────────────

    /// Persist a bucket row. Names are unique.
    pub async fn add_bucket(&self, record: BucketRecord) -> S3Result<()> {
        require(&record.guid, "bucket GUID")?;
        require(&record.name, "bucket name")?;
        require(&record.owner_guid, "bucket owner")?;
        if self.metadata.get_bucket(&record.name).await?.is_some() {
            return Err(S3Error::BucketAlreadyExists {
                bucket: record.name,
            });
        }
        self.metadata.insert_bucket(record).await?;
        Ok(())
    }

    pub async fn get_bucket_by_name(&self, name: &str) -> S3Result<Option<BucketRecord>> {
        Ok(self.metadata.get_bucket(name).await?)
    }

    pub async fn get_bucket_by_guid(&self, guid: &str) -> S3Result<Option<BucketRecord>> {
        Ok(self.metadata.get_bucket_by_guid(guid).await?)
    }

    pub async fn get_buckets(&self) -> S3Result<Vec<BucketRecord>> {
        Ok(self.metadata.list_buckets().await?)
    }

    pub async fn get_buckets_by_owner(&self, owner_guid: &str) -> S3Result<Vec<BucketRecord>> {
        let buckets = self.metadata.list_buckets().await?;
        Ok(buckets
            .into_iter()
            .filter(|b| b.owner_guid == owner_guid)
            .collect())
    }

    /// Overwrite a bucket's mutable settings. Returns false if it is gone.
    pub async fn update_bucket(&self, record: BucketRecord) -> S3Result<bool> {
        if self.metadata.get_bucket_by_guid(&record.guid).await?.is_none() {
            return Ok(false);
        }
        self.metadata.update_bucket(record).await?;
        Ok(true)
    }

    /// Delete a bucket row and every row scoped to it.
    pub async fn remove_bucket(&self, guid: &str) -> S3Result<bool> {
        if self.metadata.get_bucket_by_guid(guid).await?.is_none() {
            return Ok(false);
        }
        self.metadata.delete_bucket(guid).await?;
        Ok(true)
    }

    // ── Multipart uploads ───────────────────────────────────────────

    pub async fn add_upload(&self, record: UploadRecord) -> S3Result<()> {
        require(&record.guid, "upload GUID")?;
        require(&record.key, "object key")?;
        self.metadata.insert_upload(record).await?;
        Ok(())
    }

    pub async fn get_upload(&self, guid: &str) -> S3Result<Option<UploadRecord>> {
        Ok(self.metadata.get_upload(guid).await?)
    }

    pub async fn get_uploads_by_bucket(&self, bucket_guid: &str) -> S3Result<Vec<UploadRecord>> {
        Ok(self.metadata.list_uploads(bucket_guid).await?)
    }

    /// Record a part, replacing an earlier part with the same number.
    pub async fn add_upload_part(&self, record: UploadPartRecord) -> S3Result<()> {
        if record.part_number == 0 || record.part_number > MAX_PART_NUMBER {
            return Err(S3Error::InvalidArgument {
                message: format!(
                    "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
                ),
            });
        }
        self.metadata.put_upload_part(record).await?;
        Ok(())
    }

    pub async fn get_upload_parts(&self, upload_guid: &str) -> S3Result<Vec<UploadPartRecord>> {
        Ok(self.metadata.list_upload_parts(upload_guid).await?)
    }

    /// Delete an upload and its parts.
    pub async fn remove_upload(&self, guid: &str) -> S3Result<()> {
        self.metadata.delete_upload(guid).await?;
        Ok(())
    }

    pub async fn get_expired_uploads(&self, now: DateTime<Utc>) -> S3Result<Vec<UploadRecord>> {
        Ok(self.metadata.list_expired_uploads(now).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::StorageType;

    fn test_manager() -> ConfigManager {
        let store = SqliteMetadataStore::new(":memory:").expect("failed to create store");
        ConfigManager::new(Arc::new(store))
    }

    fn bucket(guid: &str, name: &str, owner: &str) -> BucketRecord {
        BucketRecord {
            guid: guid.to_string(),
            name: name.to_string(),
            owner_guid: owner.to_string(),
            region: "us-west-1".to_string(),
            storage_type: StorageType::Disk,
            disk_directory: format!("./disk/{name}/objects"),
            enable_versioning: false,
            enable_public_read: false,
            enable_public_write: false,
            created_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_email_unique() {
        let mgr = test_manager();
        let user = mgr.add_user("Alice", "alice@example.com").await.unwrap();
        let err = mgr.add_user("Alice 2", "alice@example.com").await.unwrap_err();
        assert!(matches!(err, S3Error::UserAlreadyExists { .. }));

        let found = mgr.get_user_by_email("alice@example.com").await.unwrap().unwrap();
        assert_eq!(found.guid, user.guid);
        assert_eq!(mgr.get_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let mgr = test_manager();
        let err = mgr.add_user("", "x@example.com").await.unwrap_err();
        assert!(matches!(err, S3Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_credential_requires_user_and_unique_key() {
        let mgr = test_manager();
        let err = mgr.add_credential("ghost", "ak", "sk", "").await.unwrap_err();
        assert!(matches!(err, S3Error::NoSuchUser { .. }));

        let user = mgr.add_user("Bob", "bob@example.com").await.unwrap();
        let cred = mgr.add_credential(&user.guid, "ak", "sk", "laptop").await.unwrap();
        let err = mgr.add_credential(&user.guid, "ak", "sk2", "").await.unwrap_err();
        assert!(matches!(err, S3Error::CredentialAlreadyExists { .. }));

        assert_eq!(mgr.get_credentials_by_user(&user.guid).await.unwrap().len(), 1);
        assert!(mgr.remove_credential(&cred.guid).await.unwrap());
        assert!(!mgr.remove_credential(&cred.guid).await.unwrap());
        assert!(mgr.get_credential_by_access_key("ak").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credential_outlives_user() {
        let mgr = test_manager();
        let user = mgr.add_user("Carol", "carol@example.com").await.unwrap();
        mgr.add_credential(&user.guid, "ak-c", "sk", "").await.unwrap();
        assert!(mgr.remove_user(&user.guid).await.unwrap());

        let cred = mgr.get_credential_by_access_key("ak-c").await.unwrap().unwrap();
        assert!(mgr.get_user_by_guid(&cred.user_guid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_seed_default_credential_idempotent() {
        let mgr = test_manager();
        let auth = AuthConfig::default();
        mgr.seed_default_credential(&auth).await.unwrap();
        mgr.seed_default_credential(&auth).await.unwrap();

        assert_eq!(mgr.get_users().await.unwrap().len(), 1);
        assert_eq!(mgr.get_credentials().await.unwrap().len(), 1);
        let cred = mgr
            .get_credential_by_access_key(&auth.access_key)
            .await
            .unwrap()
            .unwrap();
        let user = mgr.get_user_by_guid(&cred.user_guid).await.unwrap().unwrap();
        assert_eq!(user.email, auth.user_email);
    }

    #[tokio::test]
    async fn test_bucket_name_unique_and_owner_filter() {
        let mgr = test_manager();
        mgr.add_bucket(bucket("g1", "alpha", "u1")).await.unwrap();
        mgr.add_bucket(bucket("g2", "beta", "u2")).await.unwrap();
        let err = mgr.add_bucket(bucket("g3", "alpha", "u2")).await.unwrap_err();
        assert!(matches!(err, S3Error::BucketAlreadyExists { .. }));

        let mine = mgr.get_buckets_by_owner("u2").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "beta");

        assert!(mgr.remove_bucket("g1").await.unwrap());
        assert!(!mgr.remove_bucket("g1").await.unwrap());
        assert!(!mgr.update_bucket(bucket("g1", "alpha", "u1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_part_number_bounds() {
        let mgr = test_manager();
        let part = |n: u32| UploadPartRecord {
            guid: format!("p{n}"),
            bucket_guid: "b".to_string(),
            owner_guid: "u".to_string(),
            upload_guid: "up".to_string(),
            part_number: n,
            part_length: 1,
            md5: String::new(),
            sha1: String::new(),
            sha256: String::new(),
            created_utc: Utc::now(),
        };
        assert!(matches!(
            mgr.add_upload_part(part(0)).await.unwrap_err(),
            S3Error::InvalidArgument { .. }
        ));
        assert!(matches!(
            mgr.add_upload_part(part(MAX_PART_NUMBER + 1)).await.unwrap_err(),
            S3Error::InvalidArgument { .. }
        ));
    }
}
