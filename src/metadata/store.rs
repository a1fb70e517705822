//! Abstract metadata store trait and the records it persists.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses `async_trait`-style methods (manual desugaring with pinned
//! futures) so the managers can hold an `Arc<dyn MetadataStore>` and
//! stay agnostic of the engine underneath.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Boxed future returned by every [`MetadataStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

// ── Identity records ───────────────────────────────────────────────

/// A user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Primary key.
    pub guid: String,
    /// Display name.
    pub name: String,
    /// Email address, unique across users.
    pub email: String,
    pub created_utc: DateTime<Utc>,
}

/// An access-key/secret-key pair bound to exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Primary key.
    pub guid: String,
    /// Owning user.
    pub user_guid: String,
    pub description: String,
    /// Globally unique access key.
    pub access_key: String,
    /// Secret key, either plaintext or base64 depending on `is_base64`.
    pub secret_key: String,
    pub is_base64: bool,
    pub created_utc: DateTime<Utc>,
}

impl CredentialRecord {
    /// Decode the secret key into raw bytes, honouring `is_base64`.
    pub fn secret_bytes(&self) -> anyhow::Result<Vec<u8>> {
        use base64::Engine;

        if self.is_base64 {
            Ok(base64::engine::general_purpose::STANDARD.decode(&self.secret_key)?)
        } else {
            Ok(self.secret_key.as_bytes().to_vec())
        }
    }
}

// ── Bucket records ─────────────────────────────────────────────────

/// Where a bucket keeps its blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageType {
    #[default]
    Disk,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Disk => "Disk",
        }
    }
}

impl FromStr for StorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Disk" | "disk" => Ok(StorageType::Disk),
            other => anyhow::bail!("unknown storage type: {other}"),
        }
    }
}

/// Configuration row for a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Primary key.
    pub guid: String,
    /// Globally unique, human-facing name.
    pub name: String,
    /// Owning user.
    pub owner_guid: String,
    pub region: String,
    pub storage_type: StorageType,
    /// Root of this bucket's blob directory.
    pub disk_directory: String,
    pub enable_versioning: bool,
    pub enable_public_read: bool,
    pub enable_public_write: bool,
    pub created_utc: DateTime<Utc>,
}

// ── Object records ─────────────────────────────────────────────────

/// One version of an object.
///
/// Multiple rows share a `key`; each carries its own `guid` and
/// `blob_filename` so versions never collide in the storage driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Insertion-ordered row id, used as the enumeration cursor.
    pub id: i64,
    /// Primary key of this version.
    pub guid: String,
    pub bucket_guid: String,
    pub owner_guid: String,
    pub author_guid: String,
    pub key: String,
    pub content_type: String,
    pub content_length: u64,
    /// Monotonic per key, starting at 1.
    pub version: i64,
    pub etag: String,
    pub md5: String,
    /// Opaque handle into the storage driver; equals `guid`.
    pub blob_filename: String,
    pub is_folder: bool,
    pub delete_marker: bool,
    pub created_utc: DateTime<Utc>,
    pub last_update_utc: DateTime<Utc>,
    pub last_access_utc: DateTime<Utc>,
    pub expiration_utc: Option<DateTime<Utc>>,
}

/// Aggregate count and size over a set of object rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ObjectStatistics {
    pub objects: u64,
    pub bytes: u64,
}

/// Outcome of [`MetadataStore::insert_object_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionInsert {
    Inserted { id: i64, version: i64 },
    /// A live version exists and overwrites were not allowed.
    LiveVersionExists,
}

// ── Tags ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTagRecord {
    pub guid: String,
    pub bucket_guid: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTagRecord {
    pub guid: String,
    pub bucket_guid: String,
    pub object_guid: String,
    pub key: String,
    pub value: String,
}

// ── ACLs ───────────────────────────────────────────────────────────

/// A predefined grantee group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserGroup {
    AllUsers,
    AuthenticatedUsers,
}

impl UserGroup {
    /// Canonical group URI as used in S3 ACL documents.
    pub fn uri(&self) -> &'static str {
        match self {
            UserGroup::AllUsers => "http://acs.amazonaws.com/groups/global/AllUsers",
            UserGroup::AuthenticatedUsers => {
                "http://acs.amazonaws.com/groups/global/AuthenticatedUsers"
            }
        }
    }
}

impl FromStr for UserGroup {
    type Err = anyhow::Error;

    /// Accepts the bare group name or any URI ending in it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains("AuthenticatedUsers") {
            Ok(UserGroup::AuthenticatedUsers)
        } else if s.contains("AllUsers") {
            Ok(UserGroup::AllUsers)
        } else {
            anyhow::bail!("unknown user group: {s}")
        }
    }
}

impl fmt::Display for UserGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

/// Subject of an ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grantee {
    /// A named user, by GUID.
    User(String),
    /// A predefined group.
    Group(UserGroup),
}

impl Grantee {
    /// Split into the `(user_guid, user_group)` column pair.
    pub fn columns(&self) -> (Option<&str>, Option<&'static str>) {
        match self {
            Grantee::User(guid) => (Some(guid.as_str()), None),
            Grantee::Group(group) => (None, Some(group.uri())),
        }
    }
}

/// Permission class a request needs from an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    ReadAcp,
    WriteAcp,
}

/// The five permission flags carried by every ACL row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AclPermissions {
    pub permit_read: bool,
    pub permit_write: bool,
    pub permit_read_acp: bool,
    pub permit_write_acp: bool,
    pub full_control: bool,
}

impl AclPermissions {
    pub fn full_control() -> Self {
        Self {
            full_control: true,
            ..Self::default()
        }
    }

    pub fn read() -> Self {
        Self {
            permit_read: true,
            ..Self::default()
        }
    }

    /// Whether these flags grant `permission`. `full_control` grants all.
    pub fn permits(&self, permission: Permission) -> bool {
        self.full_control
            || match permission {
                Permission::Read => self.permit_read,
                Permission::Write => self.permit_write,
                Permission::ReadAcp => self.permit_read_acp,
                Permission::WriteAcp => self.permit_write_acp,
            }
    }
}

/// ACL entry scoped to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAclRecord {
    pub guid: String,
    pub bucket_guid: String,
    pub grantee: Grantee,
    pub issued_by_user_guid: String,
    pub permissions: AclPermissions,
    pub created_utc: DateTime<Utc>,
}

/// ACL entry scoped to one object version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAclRecord {
    pub guid: String,
    pub bucket_guid: String,
    pub object_guid: String,
    pub grantee: Grantee,
    pub issued_by_user_guid: String,
    pub permissions: AclPermissions,
    pub created_utc: DateTime<Utc>,
}

// ── Multipart ──────────────────────────────────────────────────────

/// An in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub guid: String,
    pub bucket_guid: String,
    pub owner_guid: String,
    pub author_guid: String,
    pub key: String,
    pub content_type: String,
    pub created_utc: DateTime<Utc>,
    pub last_access_utc: DateTime<Utc>,
    pub expiration_utc: DateTime<Utc>,
}

/// A single uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPartRecord {
    pub guid: String,
    pub bucket_guid: String,
    pub owner_guid: String,
    pub upload_guid: String,
    /// 1-based, at most 10000.
    pub part_number: u32,
    pub part_length: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub created_utc: DateTime<Utc>,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata store contract.
///
/// Lookups return `Ok(None)` for absent rows; errors are reserved for
/// engine failures.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Users ───────────────────────────────────────────────────────

    fn insert_user(&self, record: UserRecord) -> StoreFuture<'_, ()>;

    fn get_user(&self, guid: &str) -> StoreFuture<'_, Option<UserRecord>>;

    fn get_user_by_email(&self, email: &str) -> StoreFuture<'_, Option<UserRecord>>;

    fn list_users(&self) -> StoreFuture<'_, Vec<UserRecord>>;

    fn delete_user(&self, guid: &str) -> StoreFuture<'_, ()>;

    // ── Credentials ─────────────────────────────────────────────────

    fn insert_credential(&self, record: CredentialRecord) -> StoreFuture<'_, ()>;

    /// Look up a credential by access key.
    fn get_credential(&self, access_key: &str) -> StoreFuture<'_, Option<CredentialRecord>>;

    fn get_credential_by_guid(&self, guid: &str) -> StoreFuture<'_, Option<CredentialRecord>>;

    /// List credentials, optionally restricted to one user.
    fn list_credentials(&self, user_guid: Option<&str>)
        -> StoreFuture<'_, Vec<CredentialRecord>>;

    fn delete_credential(&self, guid: &str) -> StoreFuture<'_, ()>;

    // ── Buckets ─────────────────────────────────────────────────────

    fn insert_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()>;

    /// Get a bucket by name.
    fn get_bucket(&self, name: &str) -> StoreFuture<'_, Option<BucketRecord>>;

    fn get_bucket_by_guid(&self, guid: &str) -> StoreFuture<'_, Option<BucketRecord>>;

    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketRecord>>;

    /// Overwrite the mutable columns of a bucket row, matched by GUID.
    fn update_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()>;

    /// Delete a bucket row and everything scoped to it.
    fn delete_bucket(&self, guid: &str) -> StoreFuture<'_, ()>;

    // ── Objects ─────────────────────────────────────────────────────

    /// Insert a new version row, returning its row id.
    fn insert_object(&self, record: ObjectRecord) -> StoreFuture<'_, i64>;

    /// Insert `record` as the next version of its key, ignoring
    /// `record.version`.
    ///
    /// The conflict check and version assignment happen atomically with
    /// the insert.  Unless `allow_existing`, a live version of the key
    /// makes this a no-op returning [`VersionInsert::LiveVersionExists`].
    fn insert_object_version(
        &self,
        record: ObjectRecord,
        allow_existing: bool,
    ) -> StoreFuture<'_, VersionInsert>;

    /// Overwrite a version row, matched by GUID.
    fn update_object(&self, record: ObjectRecord) -> StoreFuture<'_, ()>;

    /// Delete a version row together with its tags and ACLs.
    fn delete_object(&self, guid: &str) -> StoreFuture<'_, ()>;

    fn get_object_by_guid(&self, guid: &str) -> StoreFuture<'_, Option<ObjectRecord>>;

    /// Highest-version row for `key` that is not a delete marker.
    fn get_latest_object(&self, bucket_guid: &str, key: &str)
        -> StoreFuture<'_, Option<ObjectRecord>>;

    /// Exact `(key, version)` row, delete markers included.
    fn get_object_version(
        &self,
        bucket_guid: &str,
        key: &str,
        version: i64,
    ) -> StoreFuture<'_, Option<ObjectRecord>>;

    /// Rows with `id >= start_id` whose key starts with `prefix`, in
    /// ascending id order, at most `limit` rows.
    ///
    /// With `latest_only`, delete markers and superseded versions are
    /// skipped so each key contributes at most its latest live version.
    fn enumerate_objects(
        &self,
        bucket_guid: &str,
        prefix: &str,
        start_id: i64,
        limit: u32,
        latest_only: bool,
    ) -> StoreFuture<'_, Vec<ObjectRecord>>;

    /// Count and total length of every row in the bucket.
    fn object_statistics(&self, bucket_guid: &str) -> StoreFuture<'_, ObjectStatistics>;

    // ── Tags ────────────────────────────────────────────────────────

    fn list_bucket_tags(&self, bucket_guid: &str) -> StoreFuture<'_, Vec<BucketTagRecord>>;

    /// Atomically delete every tag on the bucket and insert `tags`.
    fn replace_bucket_tags(
        &self,
        bucket_guid: &str,
        tags: Vec<BucketTagRecord>,
    ) -> StoreFuture<'_, ()>;

    fn list_object_tags(&self, object_guid: &str) -> StoreFuture<'_, Vec<ObjectTagRecord>>;

    /// Atomically delete every tag on the object version and insert `tags`.
    fn replace_object_tags(
        &self,
        object_guid: &str,
        tags: Vec<ObjectTagRecord>,
    ) -> StoreFuture<'_, ()>;

    // ── ACLs ────────────────────────────────────────────────────────

    fn list_bucket_acls(&self, bucket_guid: &str) -> StoreFuture<'_, Vec<BucketAclRecord>>;

    fn get_bucket_acl(
        &self,
        bucket_guid: &str,
        grantee: &Grantee,
    ) -> StoreFuture<'_, Option<BucketAclRecord>>;

    /// Insert, or update the flags of the existing row for the same grantee.
    fn upsert_bucket_acl(&self, record: BucketAclRecord) -> StoreFuture<'_, ()>;

    fn delete_bucket_acls(&self, bucket_guid: &str) -> StoreFuture<'_, ()>;

    fn list_object_acls(&self, object_guid: &str) -> StoreFuture<'_, Vec<ObjectAclRecord>>;

    fn get_object_acl(
        &self,
        object_guid: &str,
        grantee: &Grantee,
    ) -> StoreFuture<'_, Option<ObjectAclRecord>>;

    /// Insert, or update the flags of the existing row for the same grantee.
    fn upsert_object_acl(&self, record: ObjectAclRecord) -> StoreFuture<'_, ()>;

    fn delete_object_acls(&self, object_guid: &str) -> StoreFuture<'_, ()>;

    // ── Multipart uploads ───────────────────────────────────────────

    fn insert_upload(&self, record: UploadRecord) -> StoreFuture<'_, ()>;

    fn get_upload(&self, guid: &str) -> StoreFuture<'_, Option<UploadRecord>>;

    fn list_uploads(&self, bucket_guid: &str) -> StoreFuture<'_, Vec<UploadRecord>>;

    /// Uploads whose expiration is strictly before `now`.
    fn list_expired_uploads(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<UploadRecord>>;

    /// Delete an upload and all its parts.
    fn delete_upload(&self, guid: &str) -> StoreFuture<'_, ()>;

    /// Record an uploaded part, replacing any part with the same number.
    fn put_upload_part(&self, record: UploadPartRecord) -> StoreFuture<'_, ()>;

    /// Parts of an upload in ascending part-number order.
    fn list_upload_parts(&self, upload_guid: &str) -> StoreFuture<'_, Vec<UploadPartRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_control_permits_everything() {
        let perms = AclPermissions::full_control();
        assert!(perms.permits(Permission::Read));
        assert!(perms.permits(Permission::Write));
        assert!(perms.permits(Permission::ReadAcp));
        assert!(perms.permits(Permission::WriteAcp));
    }

    #[test]
    fn test_read_does_not_cover_acl_read() {
        let perms = AclPermissions::read();
        assert!(perms.permits(Permission::Read));
        assert!(!perms.permits(Permission::ReadAcp));
        assert!(!perms.permits(Permission::Write));
    }

    #[test]
    fn test_user_group_parse() {
        assert_eq!("AllUsers".parse::<UserGroup>().unwrap(), UserGroup::AllUsers);
        assert_eq!(
            UserGroup::AuthenticatedUsers.uri().parse::<UserGroup>().unwrap(),
            UserGroup::AuthenticatedUsers
        );
        assert!("Everyone".parse::<UserGroup>().is_err());
    }

    #[test]
    fn test_secret_bytes_base64() {
        let mut cred = CredentialRecord {
            guid: "c".into(),
            user_guid: "u".into(),
            description: String::new(),
            access_key: "ak".into(),
            secret_key: "c2VjcmV0".into(),
            is_base64: true,
            created_utc: Utc::now(),
        };
        assert_eq!(cred.secret_bytes().unwrap(), b"secret");
        cred.is_base64 = false;
        assert_eq!(cred.secret_bytes().unwrap(), b"c2VjcmV0");
    }
}
