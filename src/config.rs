//! Configuration loading and types for bleepdisk.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every entry under `disks` describes one logical
//! storage target (bucket or directory, optional base path, credentials);
//! [`crate::storage::registry::DiskRegistry`] builds one driver per entry.
//!
//! ```yaml
//! default_disk: uploads
//! disks:
//!   uploads:
//!     driver: s3
//!     base_path: uploads
//!     s3:
//!       bucket: my-bucket
//!       region: eu-west-1
//!       profile: deploy
//!   scratch:
//!     driver: local
//!     local:
//!       root_dir: ./data/scratch
//!     signing:
//!       base_url: http://localhost:9012/files
//!       key: change-me
//! ```

use garde::Validate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::errors::StorageError;

/// Smallest part S3 accepts for every multipart part except the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Disk used when the caller does not name one.
    #[serde(default)]
    pub default_disk: Option<String>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named disks.
    #[serde(default)]
    pub disks: BTreeMap<String, DiskConfig>,
}

impl Config {
    /// Check every disk and the default disk reference.
    pub fn validate(&self) -> Result<(), StorageError> {
        for (name, disk) in &self.disks {
            disk.problems()
                .map_err(|e| StorageError::InvalidConfig(format!("disk '{name}': {e}")))?;
        }
        if let Some(default) = &self.default_disk {
            if !self.disks.contains_key(default) {
                return Err(StorageError::InvalidConfig(format!(
                    "default_disk '{default}' is not listed under disks"
                )));
            }
        }
        Ok(())
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

/// Which backend a disk talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// S3 or any S3-compatible endpoint.
    S3,
    /// A directory on the local filesystem.
    #[default]
    Local,
    /// Process memory; contents vanish with the driver.
    Memory,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::S3 => f.write_str("s3"),
            DriverKind::Local => f.write_str("local"),
            DriverKind::Memory => f.write_str("memory"),
        }
    }
}

/// One logical storage target.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct DiskConfig {
    /// Backend type: `s3`, `local` or `memory`.
    #[serde(default)]
    #[garde(skip)]
    pub driver: DriverKind,

    /// Prefix prepended to every logical path before it reaches the backend.
    #[serde(default)]
    #[garde(skip)]
    pub base_path: Option<String>,

    /// S3 settings (required when `driver: s3`).
    #[serde(default)]
    #[garde(dive)]
    pub s3: Option<S3DiskConfig>,

    /// Local filesystem settings.
    #[serde(default)]
    #[garde(skip)]
    pub local: LocalDiskConfig,

    /// In-memory settings.
    #[serde(default)]
    #[garde(skip)]
    pub memory: MemoryDiskConfig,

    /// URL signing settings for drivers without native presigning.
    #[serde(default)]
    #[garde(skip)]
    pub signing: SigningConfig,
}

impl DiskConfig {
    /// An in-memory disk with default signing settings.
    pub fn memory() -> Self {
        Self {
            driver: DriverKind::Memory,
            ..Self::default()
        }
    }

    /// A local disk rooted at `root_dir`.
    pub fn local(root_dir: impl Into<String>) -> Self {
        Self {
            driver: DriverKind::Local,
            local: LocalDiskConfig {
                root_dir: root_dir.into(),
            },
            ..Self::default()
        }
    }

    /// An S3 disk.
    pub fn s3(s3: S3DiskConfig) -> Self {
        Self {
            driver: DriverKind::S3,
            s3: Some(s3),
            ..Self::default()
        }
    }

    /// Set the base path prefix.
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Set the URL signing settings.
    pub fn with_signing(mut self, base_url: impl Into<String>, key: impl Into<String>) -> Self {
        self.signing = SigningConfig {
            base_url: base_url.into(),
            key: key.into(),
        };
        self
    }

    /// The configured base path with surrounding separators removed, or
    /// `None` when no (or an empty) base path is configured.
    pub fn base_path(&self) -> Option<&str> {
        self.base_path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
    }

    /// Structural validation plus the driver/section cross-check.
    pub fn check(&self) -> Result<(), StorageError> {
        self.problems().map_err(StorageError::InvalidConfig)
    }

    fn problems(&self) -> Result<(), String> {
        self.validate().map_err(|report| report.to_string())?;
        if self.driver == DriverKind::S3 && self.s3.is_none() {
            return Err("driver is 's3' but the s3 config section is missing".to_string());
        }
        Ok(())
    }
}

/// S3 disk configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct S3DiskConfig {
    /// Bucket name: 3-63 lowercase alphanumeric characters, dots, and hyphens.
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    pub bucket: String,

    /// AWS region.
    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub region: String,

    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    #[garde(skip)]
    pub endpoint_url: Option<String>,

    /// Force path-style URL addressing.
    #[serde(default)]
    #[garde(skip)]
    pub use_path_style: bool,

    /// Credential strategy, read from the flat `profile` / `access_key` /
    /// `secret_key` keys.
    #[serde(flatten)]
    #[garde(skip)]
    pub credentials: CredentialStrategy,

    /// Bulk upload tuning.
    #[serde(default)]
    #[garde(dive)]
    pub multipart: MultipartConfig,
}

impl S3DiskConfig {
    /// Minimal configuration for `bucket` in `region` using the default
    /// credential chain.
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint_url: None,
            use_path_style: false,
            credentials: CredentialStrategy::Default,
            multipart: MultipartConfig::default(),
        }
    }
}

/// How the S3 client obtains credentials.  Exactly one strategy is active.
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "CredentialFields")]
pub enum CredentialStrategy {
    /// Named profile from the shared AWS config/credentials files.
    Profile { name: String },
    /// Explicit static key pair.
    KeyPair {
        access_key: String,
        secret_key: String,
    },
    /// Whatever the SDK's default chain resolves (env, profile, instance role).
    #[default]
    Default,
}

impl CredentialStrategy {
    /// Strategy name for logs; never includes secrets.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStrategy::Profile { .. } => "profile",
            CredentialStrategy::KeyPair { .. } => "key_pair",
            CredentialStrategy::Default => "default",
        }
    }
}

impl fmt::Debug for CredentialStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStrategy::Profile { name } => {
                f.debug_struct("Profile").field("name", name).finish()
            }
            CredentialStrategy::KeyPair { access_key, .. } => f
                .debug_struct("KeyPair")
                .field("access_key", access_key)
                .field("secret_key", &"<redacted>")
                .finish(),
            CredentialStrategy::Default => f.write_str("Default"),
        }
    }
}

/// Flat credential keys as they appear in YAML.
#[derive(Debug, Default, Deserialize)]
struct CredentialFields {
    #[serde(default)]
    profile: Option<String>,
    #[serde(default, alias = "access_key_id")]
    access_key: Option<String>,
    #[serde(default, alias = "secret_access_key")]
    secret_key: Option<String>,
}

impl From<CredentialFields> for CredentialStrategy {
    fn from(fields: CredentialFields) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        if let Some(name) = non_empty(fields.profile) {
            return CredentialStrategy::Profile { name };
        }
        match (non_empty(fields.access_key), non_empty(fields.secret_key)) {
            (Some(access_key), Some(secret_key)) => CredentialStrategy::KeyPair {
                access_key,
                secret_key,
            },
            _ => CredentialStrategy::Default,
        }
    }
}

/// Multipart upload tuning for the S3 driver.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MultipartConfig {
    /// Bytes per uploaded part.  Payloads that fit in one part are sent
    /// with a single PutObject.
    #[serde(default = "default_part_size")]
    #[garde(range(min = 5_242_880, max = 5_368_709_120))]
    pub part_size: u64,

    /// Maximum number of parts in flight at once.
    #[serde(default = "default_queue_size")]
    #[garde(range(min = 1, max = 64))]
    pub queue_size: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            queue_size: default_queue_size(),
        }
    }
}

/// Local filesystem disk configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalDiskConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

impl Default for LocalDiskConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
        }
    }
}

/// In-memory disk configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryDiskConfig {
    /// Cap on total stored bytes.  0 means unlimited.
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// HMAC URL signing settings used by the local and memory drivers.
#[derive(Clone, Deserialize)]
pub struct SigningConfig {
    /// Origin (and optional path) the objects are served from.
    #[serde(default = "default_signing_base_url")]
    pub base_url: String,

    /// HMAC key.
    #[serde(default)]
    pub key: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            base_url: default_signing_base_url(),
            key: String::new(),
        }
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("base_url", &self.base_url)
            .field("key", &"<redacted>")
            .finish()
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_queue_size() -> usize {
    4
}

fn default_root_dir() -> String {
    "./data/disks".to_string()
}

fn default_signing_base_url() -> String {
    "http://localhost:9012".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
default_disk: uploads
logging:
  level: debug
  format: json
disks:
  uploads:
    driver: s3
    base_path: uploads
    s3:
      bucket: my-bucket
      region: eu-west-1
      endpoint_url: http://localhost:9000
      use_path_style: true
      access_key: AKID
      secret_key: SECRET
      multipart:
        part_size: 10485760
        queue_size: 8
  scratch:
    driver: local
    local:
      root_dir: /tmp/scratch
    signing:
      base_url: http://localhost:9012/files
      key: k
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.default_disk.as_deref(), Some("uploads"));
        assert_eq!(config.logging.format, "json");

        let uploads = &config.disks["uploads"];
        assert_eq!(uploads.driver, DriverKind::S3);
        assert_eq!(uploads.base_path(), Some("uploads"));
        let s3 = uploads.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "my-bucket");
        assert_eq!(s3.region, "eu-west-1");
        assert!(s3.use_path_style);
        assert_eq!(
            s3.credentials,
            CredentialStrategy::KeyPair {
                access_key: "AKID".to_string(),
                secret_key: "SECRET".to_string(),
            }
        );
        assert_eq!(s3.multipart.part_size, 10 * 1024 * 1024);
        assert_eq!(s3.multipart.queue_size, 8);

        let scratch = &config.disks["scratch"];
        assert_eq!(scratch.driver, DriverKind::Local);
        assert_eq!(scratch.local.root_dir, "/tmp/scratch");
        assert_eq!(scratch.signing.base_url, "http://localhost:9012/files");
    }

    #[test]
    fn test_defaults() {
        let config = parse_config("disks:\n  tmp:\n    driver: memory\n").unwrap();
        let tmp = &config.disks["tmp"];
        assert_eq!(tmp.driver, DriverKind::Memory);
        assert_eq!(tmp.base_path(), None);
        assert_eq!(tmp.signing.base_url, "http://localhost:9012");
        assert_eq!(tmp.memory.max_size_bytes, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_profile_takes_precedence_over_key_pair() {
        let yaml = r#"
disks:
  a:
    driver: s3
    s3:
      bucket: my-bucket
      profile: deploy
      access_key: AKID
      secret_key: SECRET
"#;
        let config = parse_config(yaml).unwrap();
        let s3 = config.disks["a"].s3.as_ref().unwrap();
        assert_eq!(
            s3.credentials,
            CredentialStrategy::Profile {
                name: "deploy".to_string()
            }
        );
        assert_eq!(s3.region, "us-east-1");
    }

    #[test]
    fn test_half_key_pair_falls_back_to_default_chain() {
        let yaml = r#"
disks:
  a:
    driver: s3
    s3:
      bucket: my-bucket
      access_key_id: AKID
"#;
        let config = parse_config(yaml).unwrap();
        let s3 = config.disks["a"].s3.as_ref().unwrap();
        assert_eq!(s3.credentials, CredentialStrategy::Default);
    }

    #[test]
    fn test_base_path_is_trimmed() {
        let disk = DiskConfig::memory().with_base_path("/uploads/");
        assert_eq!(disk.base_path(), Some("uploads"));
        let disk = DiskConfig::memory().with_base_path("/");
        assert_eq!(disk.base_path(), None);
    }

    #[test]
    fn test_s3_driver_requires_section() {
        let err = parse_config("disks:\n  a:\n    driver: s3\n").unwrap_err();
        assert!(err.to_string().contains("s3 config section is missing"));
    }

    #[test]
    fn test_invalid_bucket_name_rejected() {
        let yaml = "disks:\n  a:\n    driver: s3\n    s3:\n      bucket: Bad_Bucket\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_part_size_below_minimum_rejected() {
        let yaml = r#"
disks:
  a:
    driver: s3
    s3:
      bucket: my-bucket
      multipart:
        part_size: 1024
"#;
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_unknown_default_disk_rejected() {
        let yaml = "default_disk: nope\ndisks:\n  a:\n    driver: memory\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = CredentialStrategy::KeyPair {
            access_key: "AKID".to_string(),
            secret_key: "SECRET".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("SECRET"));

        let signing = SigningConfig {
            base_url: "http://x".to_string(),
            key: "hunter2".to_string(),
        };
        assert!(!format!("{signing:?}").contains("hunter2"));
    }
}
