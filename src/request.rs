//! Parsed-request contract between the HTTP layer and the core.
//!
//! The request layer turns an inbound S3 call into a [`RequestContext`];
//! the core enriches it into a [`RequestMetadata`] aggregate holding every
//! piece of state the authorization cascade and the handlers need.

use std::sync::Arc;

use http::HeaderMap;
use serde::Serialize;

use crate::auth::{AuthenticationResult, AuthorizationResult};
use crate::bucket::client::BucketClient;
use crate::errors::{generate_request_id, S3Error, S3Result};
use crate::metadata::store::{
    BucketAclRecord, BucketRecord, BucketTagRecord, CredentialRecord, ObjectAclRecord,
    ObjectRecord, ObjectTagRecord, Permission, UserRecord,
};

/// Which resource level a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    Service,
    Bucket,
    Object,
}

/// Every S3 operation the core can authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestType {
    ServiceListBuckets,

    BucketDelete,
    BucketDeleteTags,
    BucketExists,
    BucketRead,
    BucketReadAcl,
    BucketReadLocation,
    BucketReadMultipartUploads,
    BucketReadTags,
    BucketReadVersioning,
    BucketReadVersions,
    BucketWrite,
    BucketWriteAcl,
    BucketWriteTags,
    BucketWriteVersioning,

    ObjectDelete,
    ObjectDeleteMultiple,
    ObjectDeleteTags,
    ObjectExists,
    ObjectRead,
    ObjectReadAcl,
    ObjectReadLegalHold,
    ObjectReadRange,
    ObjectReadRetention,
    ObjectReadTags,
    ObjectWrite,
    ObjectWriteAcl,
    ObjectWriteLegalHold,
    ObjectWriteRetention,
    ObjectWriteTags,

    ObjectCreateMultipartUpload,
    ObjectUploadPart,
    ObjectCompleteMultipartUpload,
    ObjectAbortMultipartUpload,
    ObjectReadParts,
}

impl RequestType {
    pub fn scope(&self) -> RequestScope {
        use RequestType::*;
        match self {
            ServiceListBuckets => RequestScope::Service,
            BucketDelete | BucketDeleteTags | BucketExists | BucketRead | BucketReadAcl
            | BucketReadLocation | BucketReadMultipartUploads | BucketReadTags
            | BucketReadVersioning | BucketReadVersions | BucketWrite | BucketWriteAcl
            | BucketWriteTags | BucketWriteVersioning => RequestScope::Bucket,
            _ => RequestScope::Object,
        }
    }

    /// The ACL flag a grant must carry to permit this request.
    ///
    /// One table serves both the bucket and the object cascade.
    pub fn required_permission(&self) -> Permission {
        use RequestType::*;
        match self {
            BucketReadAcl | ObjectReadAcl => Permission::ReadAcp,
            BucketWriteAcl | ObjectWriteAcl => Permission::WriteAcp,

            ServiceListBuckets | BucketExists | BucketRead | BucketReadLocation
            | BucketReadMultipartUploads | BucketReadTags | BucketReadVersioning
            | BucketReadVersions | ObjectExists | ObjectRead | ObjectReadLegalHold
            | ObjectReadRange | ObjectReadRetention | ObjectReadTags | ObjectReadParts => {
                Permission::Read
            }

            BucketDelete | BucketDeleteTags | BucketWrite | BucketWriteTags
            | BucketWriteVersioning | ObjectDelete | ObjectDeleteMultiple | ObjectDeleteTags
            | ObjectWrite | ObjectWriteLegalHold | ObjectWriteRetention | ObjectWriteTags
            | ObjectCreateMultipartUpload | ObjectUploadPart | ObjectCompleteMultipartUpload
            | ObjectAbortMultipartUpload => Permission::Write,
        }
    }

    /// Which public-access flag of the bucket opens this request, if any.
    ///
    /// `Some(Read)` is gated by `enable_public_read`, `Some(Write)` by
    /// `enable_public_write`.  ACL reads and writes are never public.
    pub fn public_access_class(&self) -> Option<Permission> {
        use RequestType::*;
        match self.scope() {
            RequestScope::Service => None,
            RequestScope::Bucket => match self {
                BucketExists | BucketRead | BucketReadVersioning | BucketReadVersions => {
                    Some(Permission::Read)
                }
                BucketDeleteTags | BucketWriteTags | BucketWriteVersioning => {
                    Some(Permission::Write)
                }
                _ => None,
            },
            RequestScope::Object => match self.required_permission() {
                Permission::Read => Some(Permission::Read),
                Permission::Write => Some(Permission::Write),
                Permission::ReadAcp | Permission::WriteAcp => None,
            },
        }
    }

    /// Object requests that act on a version which must already exist.
    pub fn targets_existing_object(&self) -> bool {
        use RequestType::*;
        matches!(
            self,
            ObjectDeleteTags
                | ObjectExists
                | ObjectRead
                | ObjectReadAcl
                | ObjectReadLegalHold
                | ObjectReadRange
                | ObjectReadRetention
                | ObjectReadTags
                | ObjectWriteAcl
                | ObjectWriteLegalHold
                | ObjectWriteRetention
                | ObjectWriteTags
        )
    }

    /// Requests that bring a new object version into existence.
    ///
    /// Object-level ACLs are not consulted for these: the version being
    /// written has no ACL of its own yet.
    pub fn creates_object(&self) -> bool {
        matches!(
            self,
            RequestType::ObjectWrite
                | RequestType::ObjectCreateMultipartUpload
                | RequestType::ObjectUploadPart
                | RequestType::ObjectCompleteMultipartUpload
        )
    }
}

/// Identifying fields of one inbound request, as parsed by the HTTP layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_type: RequestType,
    pub bucket_name: Option<String>,
    pub key: Option<String>,
    /// Absent means "latest".
    pub version_id: Option<String>,
    /// Access key presented by the caller, already signature-verified.
    pub access_key: Option<String>,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            bucket_name: None,
            key: None,
            version_id: None,
            access_key: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket_name = Some(bucket.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version_id = Some(version.into());
        self
    }

    pub fn with_access_key(mut self, access_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Parse `version_id` as a numeric version.
    ///
    /// `Ok(None)` when no version was requested; `Err` carries the raw
    /// string when one was requested but is not a valid version.
    pub fn version(&self) -> Result<Option<i64>, String> {
        match self.version_id.as_deref() {
            None | Some("") | Some("null") => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|v| *v >= 1)
                .map(Some)
                .ok_or_else(|| raw.to_string()),
        }
    }
}

/// Everything known about a request once the core has resolved it.
///
/// The ACL and tag lists are snapshots taken once per request.
#[derive(Clone)]
pub struct RequestMetadata {
    /// 16-character hex ID for log correlation and error bodies.
    pub request_id: String,
    pub context: RequestContext,
    pub user: Option<UserRecord>,
    pub credential: Option<CredentialRecord>,
    pub bucket: Option<BucketRecord>,
    pub bucket_client: Option<Arc<BucketClient>>,
    pub bucket_acls: Vec<BucketAclRecord>,
    pub bucket_tags: Vec<BucketTagRecord>,
    pub object: Option<ObjectRecord>,
    pub object_acls: Vec<ObjectAclRecord>,
    pub object_tags: Vec<ObjectTagRecord>,
    pub authentication: AuthenticationResult,
    pub authorization: AuthorizationResult,
}

impl RequestMetadata {
    pub fn new(context: RequestContext) -> Self {
        Self {
            request_id: generate_request_id(),
            context,
            user: None,
            credential: None,
            bucket: None,
            bucket_client: None,
            bucket_acls: Vec::new(),
            bucket_tags: Vec::new(),
            object: None,
            object_acls: Vec::new(),
            object_tags: Vec::new(),
            authentication: AuthenticationResult::NotAuthenticated,
            authorization: AuthorizationResult::NotAuthorized,
        }
    }

    /// The S3 error the request should be answered with, if any.
    ///
    /// A denial wins over a missing bucket or key, so callers without
    /// access learn nothing about which names exist.
    pub fn check(&self) -> S3Result<()> {
        let request_type = self.context.request_type;
        if !self.authorization.is_permitted() {
            return Err(S3Error::AccessDenied {
                message: format!("{request_type:?} not permitted"),
            });
        }
        if let Some(name) = &self.context.bucket_name {
            if self.bucket.is_none() && request_type != RequestType::BucketWrite {
                return Err(S3Error::NoSuchBucket {
                    bucket: name.clone(),
                });
            }
        }
        if request_type.targets_existing_object() && self.object.is_none() {
            let key = self.context.key.clone().unwrap_or_default();
            return Err(match self.context.version() {
                Ok(None) => S3Error::NoSuchKey { key },
                _ => S3Error::NoSuchVersion {
                    key,
                    version: self.context.version_id.clone().unwrap_or_default(),
                },
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for RequestMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMetadata")
            .field("request_id", &self.request_id)
            .field("request_type", &self.context.request_type)
            .field("bucket", &self.bucket.as_ref().map(|b| &b.name))
            .field("key", &self.context.key)
            .field("user", &self.user.as_ref().map(|u| &u.guid))
            .field("authentication", &self.authentication)
            .field("authorization", &self.authorization)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_requests_map_to_acp_flags() {
        assert_eq!(
            RequestType::BucketReadAcl.required_permission(),
            Permission::ReadAcp
        );
        assert_eq!(
            RequestType::ObjectWriteAcl.required_permission(),
            Permission::WriteAcp
        );
        assert_eq!(RequestType::ObjectReadAcl.public_access_class(), None);
        assert_eq!(RequestType::BucketWriteAcl.public_access_class(), None);
    }

    #[test]
    fn test_bucket_public_classes() {
        assert_eq!(
            RequestType::BucketReadVersions.public_access_class(),
            Some(Permission::Read)
        );
        assert_eq!(
            RequestType::BucketWriteTags.public_access_class(),
            Some(Permission::Write)
        );
        // Listing uploads and deleting the bucket stay private.
        assert_eq!(RequestType::BucketReadMultipartUploads.public_access_class(), None);
        assert_eq!(RequestType::BucketDelete.public_access_class(), None);
    }

    #[test]
    fn test_object_public_classes() {
        assert_eq!(
            RequestType::ObjectReadRange.public_access_class(),
            Some(Permission::Read)
        );
        assert_eq!(
            RequestType::ObjectDeleteMultiple.public_access_class(),
            Some(Permission::Write)
        );
    }

    #[test]
    fn test_scope() {
        assert_eq!(RequestType::ServiceListBuckets.scope(), RequestScope::Service);
        assert_eq!(RequestType::BucketWrite.scope(), RequestScope::Bucket);
        assert_eq!(RequestType::ObjectReadParts.scope(), RequestScope::Object);
    }

    #[test]
    fn test_version_parsing() {
        let ctx = RequestContext::new(RequestType::ObjectRead);
        assert_eq!(ctx.version(), Ok(None));
        assert_eq!(ctx.clone().with_version("2").version(), Ok(Some(2)));
        assert_eq!(ctx.clone().with_version("null").version(), Ok(None));
        assert_eq!(
            ctx.clone().with_version("abc").version(),
            Err("abc".to_string())
        );
        assert_eq!(ctx.with_version("0").version(), Err("0".to_string()));
    }

    #[test]
    fn test_check_maps_outcome_to_error() {
        let ctx = RequestContext::new(RequestType::ObjectRead)
            .with_bucket("b1")
            .with_key("a.txt");

        let md = RequestMetadata::new(ctx.clone());
        assert!(matches!(md.check(), Err(S3Error::AccessDenied { .. })));

        let mut md = RequestMetadata::new(ctx.clone());
        md.authorization = AuthorizationResult::AdminAuthorized;
        assert!(matches!(md.check(), Err(S3Error::NoSuchBucket { .. })));

        let create = RequestContext::new(RequestType::BucketWrite).with_bucket("new");
        let mut md = RequestMetadata::new(create);
        md.authorization = AuthorizationResult::AdminAuthorized;
        assert!(md.check().is_ok());

        let mut md = RequestMetadata::new(ctx.with_version("7"));
        md.authorization = AuthorizationResult::AdminAuthorized;
        md.bucket = Some(crate::metadata::store::BucketRecord {
            guid: "g".to_string(),
            name: "b1".to_string(),
            owner_guid: "o".to_string(),
            region: "us-west-1".to_string(),
            storage_type: crate::metadata::store::StorageType::Disk,
            disk_directory: "/tmp/b1".to_string(),
            enable_versioning: false,
            enable_public_read: false,
            enable_public_write: false,
            created_utc: chrono::Utc::now(),
        });
        match md.check() {
            Err(S3Error::NoSuchVersion { key, version }) => {
                assert_eq!((key.as_str(), version.as_str()), ("a.txt", "7"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
