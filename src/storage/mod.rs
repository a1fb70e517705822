//! Blob storage drivers.
//!
//! The [`backend::StorageDriver`] trait abstracts over where bytes
//! physically live.  [`disk::DiskStorageDriver`] keeps one flat
//! directory of blob files per bucket.

pub mod backend;
pub mod disk;
