//! Configuration loading and types for lessd.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: region, authentication, metadata persistence, blob storage,
//! background cleanup, and logging.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server identity settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication / authorization settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Multipart upload expiration sweep.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Region assigned to new buckets (e.g. `us-west-1`).
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Authentication settings.
///
/// `header_api_key` names the request header that carries the admin key;
/// a request presenting `admin_api_key` in that header bypasses every
/// other authorization check.  An empty admin key disables the bypass.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Admin API key header name (case-insensitive).
    #[serde(default = "default_header_api_key")]
    pub header_api_key: String,

    /// Admin API key value.
    #[serde(default)]
    pub admin_api_key: String,

    /// Access key of the credential seeded on first start.
    #[serde(alias = "access_key_id", default = "default_access_key")]
    pub access_key: String,

    /// Secret key of the credential seeded on first start.
    #[serde(alias = "secret_access_key", default = "default_secret_key")]
    pub secret_key: String,

    /// Display name of the user seeded on first start.
    #[serde(default = "default_seed_user_name")]
    pub user_name: String,

    /// Email of the user seeded on first start.
    #[serde(default = "default_seed_user_email")]
    pub user_email: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header_api_key: default_header_api_key(),
            admin_api_key: String::new(),
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            user_name: default_seed_user_name(),
            user_email: default_seed_user_email(),
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetadataConfig {
    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Parent directory of every bucket's storage root.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,

    /// Directory for multipart upload part files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl StorageConfig {
    /// Storage root of a bucket: `{root_dir}/{name}`.
    pub fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        Path::new(&self.root_dir).join(bucket_name)
    }

    /// Blob directory of a bucket: `{root_dir}/{name}/objects`.
    pub fn bucket_objects_dir(&self, bucket_name: &str) -> PathBuf {
        self.bucket_root(bucket_name).join("objects")
    }
}

/// Multipart upload cleanup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between expiration sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub interval_seconds: u64,

    /// Days an upload may stay incomplete before it is expired.
    #[serde(default = "default_upload_expiration_days")]
    pub upload_expiration_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_cleanup_interval(),
            upload_expiration_days: default_upload_expiration_days(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_region() -> String {
    "us-west-1".to_string()
}

fn default_header_api_key() -> String {
    "x-api-key".to_string()
}

fn default_access_key() -> String {
    "default".to_string()
}

fn default_secret_key() -> String {
    "default".to_string()
}

fn default_seed_user_name() -> String {
    "Default user".to_string()
}

fn default_seed_user_email() -> String {
    "default@default.com".to_string()
}

fn default_metadata_path() -> String {
    "./data/lessd.db".to_string()
}

fn default_storage_root() -> String {
    "./disk".to_string()
}

fn default_temp_dir() -> String {
    "./temp".to_string()
}

fn default_cleanup_interval() -> u64 {
    600
}

fn default_upload_expiration_days() -> i64 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.region, "us-west-1");
        assert_eq!(config.auth.header_api_key, "x-api-key");
        assert!(config.auth.admin_api_key.is_empty());
        assert_eq!(config.cleanup.upload_expiration_days, 7);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
auth:
  admin_api_key: "letmein"
  access_key_id: "AKIA"
storage:
  root_dir: "/srv/lessd"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.auth.admin_api_key, "letmein");
        assert_eq!(config.auth.access_key, "AKIA");
        assert_eq!(config.auth.secret_key, "default");
        assert_eq!(config.storage.temp_dir, "./temp");
        assert_eq!(
            config.storage.bucket_objects_dir("b1"),
            PathBuf::from("/srv/lessd/b1/objects")
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lessd.yaml");
        std::fs::write(&path, "cleanup:\n  interval_seconds: 5\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.cleanup.interval_seconds, 5);
        assert!(load_config(dir.path().join("missing.yaml")).is_err());
    }
}
