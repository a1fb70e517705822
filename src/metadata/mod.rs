//! Metadata storage layer.
//!
//! The metadata store keeps track of users, credentials, buckets,
//! object versions, tags, ACLs, and multipart uploads.  The
//! [`store::MetadataStore`] trait defines the interface;
//! [`sqlite::SqliteMetadataStore`] is the default implementation.

pub mod sqlite;
pub mod store;
