//! End-to-end scenarios through `AppState::process` and the bucket engine.

use std::collections::HashSet;
use std::sync::Arc;

use lessd::auth::{AuthenticationResult, AuthorizationResult};
use lessd::bucket::client::{BucketClient, EnumerationQuery, ObjectWrite};
use lessd::config::Config;
use lessd::errors::S3Error;
use lessd::metadata::store::{AclPermissions, Grantee, ObjectRecord, UserGroup, UserRecord};
use lessd::request::{RequestContext, RequestType};
use lessd::storage::backend::BlobReader;
use lessd::AppState;
use tokio::io::AsyncReadExt;

const ADMIN_KEY: &str = "admin-secret";
const USER_KEY: &str = "AKUSER";

struct Harness {
    _dir: tempfile::TempDir,
    state: AppState,
    user: UserRecord,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = Config::default();
    config.metadata.sqlite.path = dir.path().join("meta/lessd.db").to_string_lossy().into_owned();
    config.storage.root_dir = dir.path().join("disk").to_string_lossy().into_owned();
    config.storage.temp_dir = dir.path().join("temp").to_string_lossy().into_owned();
    config.auth.admin_api_key = ADMIN_KEY.to_string();

    let state = AppState::open(config).await.unwrap();
    let user = state
        .config_manager
        .add_user("Uma", "uma@example.com")
        .await
        .unwrap();
    state
        .config_manager
        .add_credential(&user.guid, USER_KEY, "secret", "test key")
        .await
        .unwrap();
    Harness {
        _dir: dir,
        state,
        user,
    }
}

impl Harness {
    async fn bucket(&self, name: &str, versioning: bool) -> Arc<BucketClient> {
        let mut record = self.state.bucket_manager.new_record(name, &self.user.guid);
        record.enable_versioning = versioning;
        self.state.bucket_manager.add(record).await.unwrap()
    }

    async fn put(&self, client: &BucketClient, key: &str, data: &[u8]) -> ObjectRecord {
        let write = ObjectWrite {
            key: key.to_string(),
            owner_guid: self.user.guid.clone(),
            author_guid: self.user.guid.clone(),
            content_length: Some(data.len() as u64),
            ..ObjectWrite::default()
        };
        client.add_object(write, body(data)).await.unwrap()
    }

    async fn authorize(&self, ctx: RequestContext) -> AuthorizationResult {
        self.state.process(ctx).await.unwrap().authorization
    }
}

fn body(data: &[u8]) -> BlobReader {
    Box::pin(std::io::Cursor::new(data.to_vec()))
}

fn anonymous(request_type: RequestType, bucket: &str) -> RequestContext {
    RequestContext::new(request_type).with_bucket(bucket)
}

#[tokio::test]
async fn scenario_a_public_read_toggle() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    let obj = h.put(&client, "a.txt", b"hello").await;
    assert_eq!(obj.version, 1);

    let md = h
        .state
        .process(anonymous(RequestType::ObjectRead, "b1").with_key("a.txt"))
        .await
        .unwrap();
    assert_eq!(md.authentication, AuthenticationResult::NoMaterialSupplied);
    assert_eq!(md.authorization, AuthorizationResult::NotAuthorized);
    assert_eq!(md.object.as_ref().map(|o| o.version), Some(1));

    let owner = h
        .authorize(
            anonymous(RequestType::ObjectRead, "b1")
                .with_key("a.txt")
                .with_access_key(USER_KEY),
        )
        .await;
    assert_eq!(owner, AuthorizationResult::PermitBucketOwnership);

    let mut record = client.config();
    record.enable_public_read = true;
    assert!(h.state.bucket_manager.update(record).await.unwrap());

    let result = h
        .authorize(anonymous(RequestType::ObjectRead, "b1").with_key("a.txt"))
        .await;
    assert_eq!(result, AuthorizationResult::PermitBucketGlobalConfig);

    // Public read does not open writes.
    let result = h
        .authorize(anonymous(RequestType::ObjectWrite, "b1").with_key("b.txt"))
        .await;
    assert_eq!(result, AuthorizationResult::NotAuthorized);
}

#[tokio::test]
async fn scenario_b_versioned_delete() {
    let h = harness().await;
    let client = h.bucket("b1", true).await;
    let v1 = h.put(&client, "a.txt", b"first").await;
    let v2 = h.put(&client, "a.txt", b"second").await;
    assert_eq!((v1.version, v2.version), (1, 2));
    assert_ne!(v1.guid, v2.guid);
    assert_ne!(v1.blob_filename, v2.blob_filename);

    assert!(client.delete_latest_object("a.txt").await.unwrap());
    let v2_row = client
        .get_object_version_metadata("a.txt", 2)
        .await
        .unwrap()
        .unwrap();
    assert!(v2_row.delete_marker);
    let v1_row = client
        .get_object_version_metadata("a.txt", 1)
        .await
        .unwrap()
        .unwrap();
    assert!(!v1_row.delete_marker);

    let md = h
        .state
        .process(
            anonymous(RequestType::ObjectRead, "b1")
                .with_key("a.txt")
                .with_version("1")
                .with_access_key(USER_KEY),
        )
        .await
        .unwrap();
    assert!(md.authorization.is_permitted());
    assert_eq!(md.object.as_ref().map(|o| o.version), Some(1));

    let mut stream = client
        .get_object_stream("a.txt", Some(1))
        .await
        .unwrap()
        .unwrap();
    let mut out = Vec::new();
    stream.reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"first");
}

#[tokio::test]
async fn scenario_c_all_users_read_grant() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    h.put(&client, "a.txt", b"x").await;
    client
        .add_bucket_acl(
            Grantee::Group(UserGroup::AllUsers),
            &h.user.guid,
            AclPermissions::read(),
        )
        .await
        .unwrap();

    let result = h.authorize(anonymous(RequestType::BucketReadAcl, "b1")).await;
    assert_eq!(result, AuthorizationResult::NotAuthorized);

    let result = h.authorize(anonymous(RequestType::BucketRead, "b1")).await;
    assert_eq!(result, AuthorizationResult::PermitBucketAllUsersAcl);

    let result = h
        .authorize(anonymous(RequestType::ObjectRead, "b1").with_key("a.txt"))
        .await;
    assert_eq!(result, AuthorizationResult::PermitBucketAllUsersAcl);
}

#[tokio::test]
async fn p1_versioning_monotonicity() {
    let h = harness().await;
    let versioned = h.bucket("versioned", true).await;
    for expected in 1..=5 {
        let obj = h.put(&versioned, "k", format!("v{expected}").as_bytes()).await;
        assert_eq!(obj.version, expected);
    }

    let plain = h.bucket("plain", false).await;
    h.put(&plain, "k", b"one").await;
    let write = ObjectWrite {
        key: "k".to_string(),
        owner_guid: h.user.guid.clone(),
        author_guid: h.user.guid.clone(),
        ..ObjectWrite::default()
    };
    let err = plain.add_object(write, body(b"two")).await.unwrap_err();
    assert!(matches!(err, S3Error::ObjectExists { .. }));
    let rows = plain.enumerate_versions("k", 0, 0).await.unwrap();
    assert_eq!(rows.objects.len(), 1);
}

#[tokio::test]
async fn p2_delete_marker_vs_physical_delete() {
    let h = harness().await;
    let versioned = h.bucket("versioned", true).await;
    let obj = h.put(&versioned, "k", b"data").await;
    assert!(versioned.delete_latest_object("k").await.unwrap());
    let row = versioned
        .get_object_metadata_by_guid(&obj.guid)
        .await
        .unwrap()
        .unwrap();
    assert!(row.delete_marker);
    assert!(versioned.storage().exists(&obj.blob_filename).await.unwrap());

    let plain = h.bucket("plain", false).await;
    let obj = h.put(&plain, "k", b"data").await;
    assert!(plain.delete_latest_object("k").await.unwrap());
    assert!(plain.get_object_metadata_by_guid(&obj.guid).await.unwrap().is_none());
    assert!(!plain.storage().exists(&obj.blob_filename).await.unwrap());
    assert!(plain.get_object_latest("k").await.unwrap().is_none());
}

#[tokio::test]
async fn p3_admin_header_always_wins() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    h.put(&client, "a.txt", b"x").await;

    for request_type in [
        RequestType::ServiceListBuckets,
        RequestType::BucketDelete,
        RequestType::BucketWriteAcl,
        RequestType::ObjectDelete,
        RequestType::ObjectReadAcl,
    ] {
        let ctx = anonymous(request_type, "b1")
            .with_key("a.txt")
            .with_header("X-API-KEY", ADMIN_KEY);
        assert_eq!(h.authorize(ctx).await, AuthorizationResult::AdminAuthorized);
    }

    let wrong = anonymous(RequestType::ObjectDelete, "b1")
        .with_key("a.txt")
        .with_header("x-api-key", "nope");
    assert_eq!(h.authorize(wrong).await, AuthorizationResult::NotAuthorized);
}

#[tokio::test]
async fn p4_acl_upsert_by_grantee() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    let grantee = Grantee::User("someone".to_string());
    client
        .add_bucket_acl(grantee.clone(), &h.user.guid, AclPermissions::read())
        .await
        .unwrap();
    let write = AclPermissions {
        permit_write: true,
        ..AclPermissions::default()
    };
    client
        .add_bucket_acl(grantee, &h.user.guid, write)
        .await
        .unwrap();

    let acls = client.get_bucket_acls().await.unwrap();
    assert_eq!(acls.len(), 1);
    assert_eq!(acls[0].permissions, write);
}

#[tokio::test]
async fn p5_tag_replace() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    client
        .add_bucket_tags(vec![
            ("env".to_string(), "dev".to_string()),
            ("team".to_string(), "a".to_string()),
        ])
        .await
        .unwrap();
    client
        .add_bucket_tags(vec![("env".to_string(), "prod".to_string())])
        .await
        .unwrap();

    let tags: Vec<_> = client
        .get_bucket_tags()
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.key, t.value))
        .collect();
    assert_eq!(tags, vec![("env".to_string(), "prod".to_string())]);
}

#[tokio::test]
async fn p6_pagination_has_no_gaps_or_overlap() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    for i in 0..7 {
        h.put(&client, &format!("obj-{i}"), b"x").await;
    }

    let mut seen = Vec::new();
    let mut cursor = 0;
    let mut pages = 0;
    loop {
        let page = client
            .enumerate(EnumerationQuery {
                start_index: cursor,
                max_results: 3,
                ..EnumerationQuery::default()
            })
            .await
            .unwrap();
        pages += 1;
        if page.is_truncated {
            assert_eq!(page.objects.len(), 3);
        }
        seen.extend(page.objects.into_iter().map(|o| o.key));
        cursor = page.next_start_index;
        if !page.is_truncated {
            break;
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 7);
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), 7);
}

#[tokio::test]
async fn p7_range_past_end_is_rejected() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    h.put(&client, "r", b"0123456789").await;

    let err = client.get_object_range("r", None, 5, 6).await.unwrap_err();
    assert!(matches!(err, S3Error::InvalidRange));

    let stream = client.get_object_range("r", None, 5, 5).await.unwrap().unwrap();
    assert_eq!(stream.length, 5);
}

#[tokio::test]
async fn unknown_inputs_resolve_to_empty_fields() {
    let h = harness().await;
    h.bucket("b1", false).await;

    let md = h
        .state
        .process(
            anonymous(RequestType::ObjectRead, "missing")
                .with_key("a.txt")
                .with_access_key("NOPE"),
        )
        .await
        .unwrap();
    assert_eq!(md.authentication, AuthenticationResult::AccessKeyNotFound);
    assert!(md.bucket.is_none());
    assert!(md.object.is_none());
    assert_eq!(md.authorization, AuthorizationResult::NotAuthorized);

    let md = h
        .state
        .process(
            anonymous(RequestType::ObjectRead, "b1")
                .with_key("a.txt")
                .with_version("not-a-number")
                .with_access_key(USER_KEY),
        )
        .await
        .unwrap();
    assert_eq!(md.authentication, AuthenticationResult::Authenticated);
    assert!(md.bucket.is_some());
    assert!(md.object.is_none());
}

#[tokio::test]
async fn service_listing_needs_identity() {
    let h = harness().await;
    let anon = h
        .authorize(RequestContext::new(RequestType::ServiceListBuckets))
        .await;
    assert_eq!(anon, AuthorizationResult::NotAuthorized);

    let seeded = h
        .authorize(RequestContext::new(RequestType::ServiceListBuckets).with_access_key("default"))
        .await;
    assert_eq!(seeded, AuthorizationResult::PermitService);
}

#[tokio::test]
async fn resolved_requests_map_to_s3_errors() {
    let h = harness().await;
    let client = h.bucket("b1", false).await;
    h.put(&client, "a.txt", b"hello").await;

    let md = h
        .state
        .process(anonymous(RequestType::ObjectRead, "b1").with_key("a.txt"))
        .await
        .unwrap();
    assert!(matches!(md.check(), Err(S3Error::AccessDenied { .. })));

    let admin = |ctx: RequestContext| ctx.with_header("X-API-KEY", ADMIN_KEY);
    let md = h
        .state
        .process(admin(anonymous(RequestType::ObjectRead, "b1").with_key("a.txt")))
        .await
        .unwrap();
    assert!(md.check().is_ok());

    let md = h
        .state
        .process(admin(anonymous(RequestType::ObjectRead, "b1").with_key("zzz")))
        .await
        .unwrap();
    assert!(matches!(md.check(), Err(S3Error::NoSuchKey { .. })));

    let md = h
        .state
        .process(admin(anonymous(RequestType::BucketRead, "missing")))
        .await
        .unwrap();
    assert!(matches!(md.check(), Err(S3Error::NoSuchBucket { .. })));
}

#[tokio::test]
async fn non_empty_bucket_survives_removal() {
    use lessd::bucket::manager::BucketRemoval;

    let h = harness().await;
    let client = h.bucket("b1", true).await;
    h.put(&client, "a.txt", b"hello").await;

    let manager = &h.state.bucket_manager;
    assert_eq!(manager.remove("b1", false).await.unwrap(), BucketRemoval::NotEmpty);
    let md = h
        .state
        .process(anonymous(RequestType::ObjectRead, "b1").with_key("a.txt"))
        .await
        .unwrap();
    assert!(md.object.is_some());

    assert_eq!(manager.remove("b1", true).await.unwrap(), BucketRemoval::Destroyed);
    assert!(!manager.exists("b1"));
}
