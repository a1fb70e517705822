//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code and HTTP status so
//! the request layer in front of the core can render it directly.
//! Absence of a bucket, key, or version is reported through `Option`
//! and `bool` returns; these variants exist for the calls where absence
//! blocks the operation itself, and for
//! [`RequestMetadata::check`](crate::request::RequestMetadata::check),
//! which turns a resolved request into the error to send back.

use http::StatusCode;
use thiserror::Error;

/// Result type used by the managers.
pub type S3Result<T> = Result<T, S3Error>;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The resource you requested does not exist")]
    NoSuchKey { key: String },

    /// The specified version does not exist.
    #[error("The specified version does not exist")]
    NoSuchVersion { key: String, version: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A bucket with the requested name already exists.
    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    /// The bucket you tried to delete is not empty.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// Write to an existing key while versioning is disabled.
    #[error("An object with this key already exists and versioning is disabled")]
    ObjectExists { key: String },

    /// A user with the requested email already exists.
    #[error("A user with this email already exists")]
    UserAlreadyExists { email: String },

    /// A credential with the requested access key already exists.
    #[error("A credential with this access key already exists")]
    CredentialAlreadyExists { access_key: String },

    /// The referenced user does not exist.
    #[error("The specified user does not exist")]
    NoSuchUser { user: String },

    /// Access denied.
    #[error("Access Denied")]
    AccessDenied { message: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// An invalid bucket name was provided.
    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    /// Invalid part in multipart upload.
    #[error("{message}")]
    InvalidPart { message: String },

    /// Invalid range request.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchVersion { .. } => "NoSuchVersion",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::ObjectExists { .. } => "InvalidRequest",
            S3Error::UserAlreadyExists { .. } => "InvalidRequest",
            S3Error::CredentialAlreadyExists { .. } => "InvalidRequest",
            S3Error::NoSuchUser { .. } => "InvalidRequest",
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchVersion { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::BucketAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::ObjectExists { .. } => StatusCode::CONFLICT,
            S3Error::UserAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::CredentialAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::NoSuchUser { .. } => StatusCode::BAD_REQUEST,
            S3Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
