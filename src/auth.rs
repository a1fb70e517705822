//! Authentication and the authorization cascade.
//!
//! Authorization is evaluated as an ordered list of tiers.  Each tier is a
//! pure function over an [`AuthContext`] that either returns a verdict or
//! passes; the first verdict wins.  Service, bucket, and object requests
//! each have their own tier list:
//!
//! - service: admin key, authenticated caller
//! - bucket: bucket creation, admin key, public flags, AllUsers ACL,
//!   identity gate, ownership, AuthenticatedUsers ACL, named-user ACL
//! - object: as bucket, with the object-scope check following each
//!   bucket-scope check from the AllUsers tier onward
//!
//! All state is fetched by the caller beforehand; nothing here performs I/O.

use http::HeaderMap;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::AuthConfig;
use crate::metadata::store::{
    AclPermissions, BucketAclRecord, BucketRecord, CredentialRecord, Grantee, ObjectAclRecord,
    ObjectRecord, Permission, UserGroup, UserRecord,
};
use crate::request::{RequestMetadata, RequestScope, RequestType};

// ── Results ─────────────────────────────────────────────────────────

/// Outcome of resolving the caller's access key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthenticationResult {
    NoMaterialSupplied,
    AccessKeyNotFound,
    UserNotFound,
    Authenticated,
    NotAuthenticated,
}

/// Outcome of the authorization cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthorizationResult {
    AdminAuthorized,
    PermitService,
    PermitBucketGlobalConfig,
    PermitBucketAllUsersAcl,
    PermitBucketAuthUserAcl,
    PermitBucketUserAcl,
    PermitBucketOwnership,
    PermitObjectAllUsersAcl,
    PermitObjectAuthUserAcl,
    PermitObjectUserAcl,
    PermitObjectOwnership,
    NotAuthorized,
}

impl AuthorizationResult {
    pub fn is_permitted(&self) -> bool {
        !matches!(self, AuthorizationResult::NotAuthorized)
    }
}

// ── Cascade input ───────────────────────────────────────────────────

/// Borrowed view of the state a tier may inspect.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub request_type: RequestType,
    /// Whether the request carried the configured admin key.
    pub admin: bool,
    pub user: Option<&'a UserRecord>,
    pub credential: Option<&'a CredentialRecord>,
    pub bucket: Option<&'a BucketRecord>,
    pub bucket_acls: &'a [BucketAclRecord],
    pub object: Option<&'a ObjectRecord>,
    pub object_acls: &'a [ObjectAclRecord],
}

impl<'a> AuthContext<'a> {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            admin: false,
            user: None,
            credential: None,
            bucket: None,
            bucket_acls: &[],
            object: None,
            object_acls: &[],
        }
    }

    fn identity(&self) -> Option<&'a UserRecord> {
        self.credential.and(self.user)
    }

    fn permission(&self) -> Permission {
        self.request_type.required_permission()
    }

    fn object_acls_apply(&self) -> bool {
        !self.request_type.creates_object()
    }
}

/// A single step of the cascade.
pub type Tier = fn(&AuthContext<'_>) -> Option<AuthorizationResult>;

const SERVICE_TIERS: &[Tier] = &[admin_key, service_identity];

const BUCKET_TIERS: &[Tier] = &[
    bucket_creation,
    admin_key,
    bucket_global_config,
    bucket_all_users_acl,
    identity_required,
    bucket_ownership,
    bucket_auth_users_acl,
    bucket_user_acl,
];

const OBJECT_TIERS: &[Tier] = &[
    admin_key,
    bucket_global_config,
    bucket_all_users_acl,
    object_all_users_acl,
    identity_required,
    bucket_ownership,
    object_ownership,
    bucket_auth_users_acl,
    object_auth_users_acl,
    bucket_user_acl,
    object_user_acl,
];

fn evaluate(tiers: &[Tier], ctx: &AuthContext<'_>) -> AuthorizationResult {
    tiers
        .iter()
        .find_map(|tier| tier(ctx))
        .unwrap_or(AuthorizationResult::NotAuthorized)
}

// ── Tiers ───────────────────────────────────────────────────────────

fn admin_key(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    ctx.admin.then_some(AuthorizationResult::AdminAuthorized)
}

fn service_identity(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    ctx.identity().map(|_| AuthorizationResult::PermitService)
}

/// Any authenticated caller may create a bucket it will own.
fn bucket_creation(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    (ctx.request_type == RequestType::BucketWrite && ctx.identity().is_some())
        .then_some(AuthorizationResult::PermitBucketOwnership)
}

fn bucket_global_config(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    let bucket = ctx.bucket?;
    let open = match ctx.request_type.public_access_class()? {
        Permission::Read => bucket.enable_public_read,
        Permission::Write => bucket.enable_public_write,
        Permission::ReadAcp | Permission::WriteAcp => false,
    };
    open.then_some(AuthorizationResult::PermitBucketGlobalConfig)
}

/// Unauthenticated callers stop here.
fn identity_required(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    match ctx.identity() {
        Some(_) => None,
        None => Some(AuthorizationResult::NotAuthorized),
    }
}

fn bucket_ownership(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    let (bucket, user) = (ctx.bucket?, ctx.identity()?);
    (bucket.owner_guid == user.guid).then_some(AuthorizationResult::PermitBucketOwnership)
}

fn object_ownership(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    let (object, user) = (ctx.object?, ctx.identity()?);
    (object.owner_guid == user.guid).then_some(AuthorizationResult::PermitObjectOwnership)
}

fn grants<'a>(
    mut acls: impl Iterator<Item = (&'a Grantee, &'a AclPermissions)>,
    grantee: &Grantee,
    permission: Permission,
) -> bool {
    acls.any(|(g, p)| g == grantee && p.permits(permission))
}

fn bucket_acl_grants(ctx: &AuthContext<'_>, grantee: &Grantee) -> bool {
    ctx.bucket.is_some()
        && grants(
            ctx.bucket_acls.iter().map(|a| (&a.grantee, &a.permissions)),
            grantee,
            ctx.permission(),
        )
}

fn object_acl_grants(ctx: &AuthContext<'_>, grantee: &Grantee) -> bool {
    ctx.object_acls_apply()
        && ctx.object.is_some()
        && grants(
            ctx.object_acls.iter().map(|a| (&a.grantee, &a.permissions)),
            grantee,
            ctx.permission(),
        )
}

fn bucket_all_users_acl(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    bucket_acl_grants(ctx, &Grantee::Group(UserGroup::AllUsers))
        .then_some(AuthorizationResult::PermitBucketAllUsersAcl)
}

fn object_all_users_acl(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    object_acl_grants(ctx, &Grantee::Group(UserGroup::AllUsers))
        .then_some(AuthorizationResult::PermitObjectAllUsersAcl)
}

fn bucket_auth_users_acl(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    bucket_acl_grants(ctx, &Grantee::Group(UserGroup::AuthenticatedUsers))
        .then_some(AuthorizationResult::PermitBucketAuthUserAcl)
}

fn object_auth_users_acl(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    object_acl_grants(ctx, &Grantee::Group(UserGroup::AuthenticatedUsers))
        .then_some(AuthorizationResult::PermitObjectAuthUserAcl)
}

fn bucket_user_acl(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    let user = ctx.identity()?;
    bucket_acl_grants(ctx, &Grantee::User(user.guid.clone()))
        .then_some(AuthorizationResult::PermitBucketUserAcl)
}

fn object_user_acl(ctx: &AuthContext<'_>) -> Option<AuthorizationResult> {
    let user = ctx.identity()?;
    object_acl_grants(ctx, &Grantee::User(user.guid.clone()))
        .then_some(AuthorizationResult::PermitObjectUserAcl)
}

// ── Manager ─────────────────────────────────────────────────────────

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Resolves authentication and authorization verdicts for requests.
#[derive(Debug, Clone)]
pub struct AuthManager {
    header_api_key: String,
    admin_api_key: String,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            header_api_key: config.header_api_key.to_ascii_lowercase(),
            admin_api_key: config.admin_api_key.clone(),
        }
    }

    /// Whether `headers` carry the configured admin key.
    ///
    /// Always false when no admin key is configured.
    pub fn is_admin(&self, headers: &HeaderMap) -> bool {
        if self.admin_api_key.is_empty() {
            return false;
        }
        headers
            .get(self.header_api_key.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| constant_time_eq(v, &self.admin_api_key))
            .unwrap_or(false)
    }

    /// Classify the caller from its access key and the rows it resolved to.
    pub fn authenticate(
        &self,
        access_key: Option<&str>,
        credential: Option<&CredentialRecord>,
        user: Option<&UserRecord>,
    ) -> AuthenticationResult {
        match (access_key.filter(|k| !k.is_empty()), credential, user) {
            (None, _, _) => AuthenticationResult::NoMaterialSupplied,
            (Some(_), None, _) => AuthenticationResult::AccessKeyNotFound,
            (Some(_), Some(_), None) => AuthenticationResult::UserNotFound,
            (Some(_), Some(_), Some(_)) => AuthenticationResult::Authenticated,
        }
    }

    pub fn authorize_service(&self, ctx: &AuthContext<'_>) -> AuthorizationResult {
        evaluate(SERVICE_TIERS, ctx)
    }

    pub fn authorize_bucket(&self, ctx: &AuthContext<'_>) -> AuthorizationResult {
        evaluate(BUCKET_TIERS, ctx)
    }

    pub fn authorize_object(&self, ctx: &AuthContext<'_>) -> AuthorizationResult {
        evaluate(OBJECT_TIERS, ctx)
    }

    /// Fill in `authentication` and `authorization` on a resolved request.
    ///
    /// User and credential only count towards authorization when
    /// authentication succeeded.
    pub fn authorize(&self, md: &mut RequestMetadata) -> AuthorizationResult {
        md.authentication = self.authenticate(
            md.context.access_key.as_deref(),
            md.credential.as_ref(),
            md.user.as_ref(),
        );
        let authenticated = md.authentication == AuthenticationResult::Authenticated;

        let ctx = AuthContext {
            request_type: md.context.request_type,
            admin: self.is_admin(&md.context.headers),
            user: md.user.as_ref().filter(|_| authenticated),
            credential: md.credential.as_ref().filter(|_| authenticated),
            bucket: md.bucket.as_ref(),
            bucket_acls: &md.bucket_acls,
            object: md.object.as_ref(),
            object_acls: &md.object_acls,
        };

        let result = match md.context.request_type.scope() {
            RequestScope::Service => self.authorize_service(&ctx),
            RequestScope::Bucket => self.authorize_bucket(&ctx),
            RequestScope::Object => self.authorize_object(&ctx),
        };

        debug!(
            request_id = %md.request_id,
            request_type = ?md.context.request_type,
            authentication = ?md.authentication,
            authorization = ?result,
            "Authorization evaluated"
        );
        md.authorization = result;
        result
    }
}

// ── Tests ───────────────────────────────────────────────────────────
