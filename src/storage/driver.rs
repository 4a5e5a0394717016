//! The storage driver: one disk's contract surface.
//!
//! [`StorageDriver`] turns caller-facing logical paths into physical keys
//! (see [`StorageDriver::get_path`]), resolves MIME types, and applies the
//! two error policies of the contract:
//!
//! - `put`, `url`, `signed_url`, `copy` and `move_to` raise [`StorageError`].
//! - `get`, `meta`, `exists`, `missing` and `delete` never raise.  Absence
//!   and failure both collapse to a sentinel (`None`, an empty
//!   [`MetaResponse`], `false`); failures are logged at `warn` first.
//!
//! `move_to` is a copy followed by a delete and is **not atomic**: when the
//! delete fails after a successful copy, both objects stay live and the
//! call still succeeds.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::aws::S3Backend;
use super::backend::{Lookup, ObjectBackend, ObjectHead, PutParams};
use super::body::ObjectBody;
use super::local::LocalBackend;
use super::memory::MemoryBackend;
use super::signing::{SignatureError, UrlSigner};
use crate::config::{DiskConfig, DriverKind};
use crate::errors::{StorageError, StorageResult, MAX_EXPIRY_MINUTES};
use crate::metrics::{record_operation, STATUS_ERROR, STATUS_NOT_FOUND, STATUS_OK};

/// Lifetime of a signed URL when the caller does not pick one.
pub const DEFAULT_SIGNED_URL_MINUTES: u64 = 20;

/// Per-call write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOptions {
    /// Explicit MIME type.  Inferred from the path's extension when absent.
    pub mime_type: Option<String>,
    /// User metadata stored with the object.
    pub metadata: HashMap<String, String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    /// Canned ACL such as `public-read` (S3 only).
    pub acl: Option<String>,
}

impl FileOptions {
    /// Set the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutResponse {
    /// Physical path the object was written to.
    pub path: String,
    /// Canonical (unsigned) URL of the object.
    pub url: String,
}

/// Result of a successful `copy` or `move_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameResponse {
    /// Physical path of the destination.
    pub path: String,
    /// Canonical (unsigned) URL of the destination.
    pub url: String,
}

/// Object metadata.  All fields `None` means "not found or lookup failed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl MetaResponse {
    /// Whether this is the empty "not found" sentinel.
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.content_type.is_none()
            && self.content_length.is_none()
            && self.last_modified.is_none()
            && self.etag.is_none()
    }

    fn found(path: String, head: ObjectHead) -> Self {
        Self {
            path: Some(path),
            content_type: head.content_type,
            content_length: Some(head.content_length),
            last_modified: head.last_modified,
            etag: head.etag,
        }
    }
}

/// MIME type for a write: the explicit one, else inferred from `path`.
pub fn resolve_mime_type(path: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(mime) if !mime.is_empty() => mime.to_string(),
        _ => mime_guess::from_path(path).first_or_octet_stream().to_string(),
    }
}

/// Drop the query (signature, expiry) and fragment from a signed URL.
pub fn strip_signature(signed_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(signed_url)?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Storage driver for one disk.
pub struct StorageDriver {
    disk: String,
    config: DiskConfig,
    backend: Arc<dyn ObjectBackend>,
    signer: Option<UrlSigner>,
}

impl StorageDriver {
    /// Build the driver for `disk` from its configuration.
    ///
    /// Prepares the backend client only.  For S3 disks credentials are
    /// not resolved until the first request.
    pub async fn new(disk: impl Into<String>, config: DiskConfig) -> StorageResult<Self> {
        let disk = disk.into();
        config.check().map_err(|e| match e {
            StorageError::InvalidConfig(msg) => {
                StorageError::InvalidConfig(format!("disk '{disk}': {msg}"))
            }
            other => other,
        })?;

        let (backend, signer): (Arc<dyn ObjectBackend>, Option<UrlSigner>) = match config.driver {
            DriverKind::S3 => {
                let s3 = config.s3.as_ref().ok_or_else(|| {
                    StorageError::InvalidConfig(format!("disk '{disk}': missing s3 section"))
                })?;
                let backend = S3Backend::new(s3)
                    .await
                    .map_err(|e| StorageError::InvalidConfig(format!("disk '{disk}': {e}")))?;
                (Arc::new(backend), None)
            }
            DriverKind::Local => {
                let signer = UrlSigner::new(&config.signing)?;
                let backend = LocalBackend::new(&config.local.root_dir, signer.clone())
                    .map_err(|e| StorageError::InvalidConfig(format!("disk '{disk}': {e}")))?;
                (Arc::new(backend), Some(signer))
            }
            DriverKind::Memory => {
                let signer = UrlSigner::new(&config.signing)?;
                let backend = MemoryBackend::new(config.memory.max_size_bytes, signer.clone());
                (Arc::new(backend), Some(signer))
            }
        };

        info!(
            disk = %disk,
            driver = %config.driver,
            base_path = config.base_path().unwrap_or(""),
            "Storage driver initialized"
        );

        Ok(Self {
            disk,
            config,
            backend,
            signer,
        })
    }

    /// Build a driver around an existing backend.  Signed URLs issued by
    /// such a driver cannot be checked with [`verify_signed_url`].
    ///
    /// [`verify_signed_url`]: StorageDriver::verify_signed_url
    pub fn with_backend(
        disk: impl Into<String>,
        config: DiskConfig,
        backend: Arc<dyn ObjectBackend>,
    ) -> Self {
        Self {
            disk: disk.into(),
            config,
            backend,
            signer: None,
        }
    }

    /// Disk name.
    pub fn disk(&self) -> &str {
        &self.disk
    }

    /// Disk configuration.
    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Underlying backend.
    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// Physical key for a logical `path`: `{base_path}/{path}` when a base
    /// path is configured, `path` otherwise.
    pub fn get_path(&self, path: &str) -> String {
        match self.config.base_path() {
            Some(base) => format!("{base}/{path}"),
            None => path.to_string(),
        }
    }

    // -- Writes ------------------------------------------------------------

    /// Write `content` to `path` with inferred MIME type.
    pub async fn put(
        &self,
        path: &str,
        content: impl Into<ObjectBody>,
    ) -> StorageResult<PutResponse> {
        self.put_with_options(path, content, FileOptions::default()).await
    }

    /// Write `content` to `path`.
    pub async fn put_with_options(
        &self,
        path: &str,
        content: impl Into<ObjectBody>,
        options: FileOptions,
    ) -> StorageResult<PutResponse> {
        let started = Instant::now();
        let result = self.put_inner(path, content.into(), options).await;
        self.finish("put", started, result)
    }

    async fn put_inner(
        &self,
        path: &str,
        content: ObjectBody,
        options: FileOptions,
    ) -> StorageResult<PutResponse> {
        let key = self.get_path(path);
        let params = PutParams {
            content_type: resolve_mime_type(&key, options.mime_type.as_deref()),
            metadata: options.metadata,
            cache_control: options.cache_control,
            content_disposition: options.content_disposition,
            content_encoding: options.content_encoding,
            acl: options.acl,
        };
        debug!(disk = %self.disk, key = %key, content_type = %params.content_type, "put");

        self.backend
            .put_object(&key, content, params)
            .await
            .map_err(|e| StorageError::backend("put", key.clone(), e))?;

        let url = self.canonical_url("put", &key).await?;
        Ok(PutResponse { path: key, url })
    }

    // -- Reads -------------------------------------------------------------

    /// Full contents of `path`, or `None` when it is absent or unreadable.
    pub async fn get(&self, path: &str) -> Option<Bytes> {
        let started = Instant::now();
        let key = self.get_path(path);
        let lookup = self.backend.get_object(&key).await;
        self.settle("get", &key, started, lookup)
    }

    /// Metadata of `path`; empty when it is absent or the lookup failed.
    pub async fn meta(&self, path: &str) -> MetaResponse {
        let started = Instant::now();
        let key = self.get_path(path);
        let lookup = self
            .backend
            .head_object(&key)
            .await
            .map(|head| MetaResponse::found(key.clone(), head));
        self.settle("meta", &key, started, lookup).unwrap_or_default()
    }

    /// Whether `path` exists.  Always the complement of [`missing`].
    ///
    /// [`missing`]: StorageDriver::missing
    pub async fn exists(&self, path: &str) -> bool {
        !self.meta(path).await.is_empty()
    }

    /// Whether `path` is absent (or its lookup failed).
    pub async fn missing(&self, path: &str) -> bool {
        self.meta(path).await.is_empty()
    }

    // -- URLs --------------------------------------------------------------

    /// Canonical URL of `path`: the signed URL without its signature and
    /// expiry parameters.  Not necessarily publicly readable.
    pub async fn url(&self, path: &str) -> StorageResult<String> {
        let started = Instant::now();
        let key = self.get_path(path);
        let result = self.canonical_url("url", &key).await;
        self.finish("url", started, result)
    }

    /// Time-limited signed URL for `path`, valid for `expire_in_minutes`
    /// (default 20, at most 7 days).
    pub async fn signed_url(
        &self,
        path: &str,
        expire_in_minutes: Option<u64>,
    ) -> StorageResult<String> {
        let started = Instant::now();
        let result = self.signed_url_inner(path, expire_in_minutes).await;
        self.finish("signed_url", started, result)
    }

    async fn signed_url_inner(
        &self,
        path: &str,
        expire_in_minutes: Option<u64>,
    ) -> StorageResult<String> {
        let minutes = expire_in_minutes.unwrap_or(DEFAULT_SIGNED_URL_MINUTES);
        if minutes == 0 || minutes > MAX_EXPIRY_MINUTES {
            return Err(StorageError::InvalidExpiry { minutes });
        }
        let key = self.get_path(path);
        self.backend
            .presign_get(&key, Duration::from_secs(minutes * 60))
            .await
            .map_err(|e| StorageError::backend("signed_url", key, e))
    }

    /// Check a URL produced by [`signed_url`] on a local or memory disk and
    /// return the physical key it grants access to.
    ///
    /// [`signed_url`]: StorageDriver::signed_url
    pub fn verify_signed_url(&self, signed_url: &str) -> Result<String, SignatureError> {
        let signer = self.signer.as_ref().ok_or(SignatureError::Unsupported)?;
        signer.verify(signed_url, Utc::now().timestamp())
    }

    async fn canonical_url(&self, operation: &'static str, key: &str) -> StorageResult<String> {
        let expires = Duration::from_secs(DEFAULT_SIGNED_URL_MINUTES * 60);
        let signed = self
            .backend
            .presign_get(key, expires)
            .await
            .map_err(|e| StorageError::backend(operation, key, e))?;
        strip_signature(&signed).map_err(|e| StorageError::backend(operation, key, e))
    }

    // -- Delete, copy, move ------------------------------------------------

    /// Delete `path`.  `true` on success (including an already absent
    /// object), `false` on any failure.  Never raises.
    pub async fn delete(&self, path: &str) -> bool {
        let started = Instant::now();
        let key = self.get_path(path);
        match self.backend.delete_object(&key).await {
            Ok(()) => {
                record_operation(&self.disk, "delete", STATUS_OK, started.elapsed());
                true
            }
            Err(e) => {
                record_operation(&self.disk, "delete", STATUS_ERROR, started.elapsed());
                warn!(disk = %self.disk, key = %key, error = %e, "delete failed, reporting false");
                false
            }
        }
    }

    /// Server-side copy of `path` to `new_path`.  Returns once the backend
    /// has confirmed the copy.
    pub async fn copy(&self, path: &str, new_path: &str) -> StorageResult<RenameResponse> {
        let started = Instant::now();
        let result = self.copy_inner("copy", path, new_path).await;
        self.finish("copy", started, result)
    }

    /// Copy `path` to `new_path`, then delete `path`.
    ///
    /// Not atomic.  A failed copy raises and leaves the source untouched.
    /// A failed delete after a successful copy is logged and the move still
    /// returns the destination, so both objects exist afterwards.
    pub async fn move_to(&self, path: &str, new_path: &str) -> StorageResult<RenameResponse> {
        let started = Instant::now();
        let result = self.move_inner(path, new_path).await;
        self.finish("move", started, result)
    }

    async fn copy_inner(
        &self,
        operation: &'static str,
        path: &str,
        new_path: &str,
    ) -> StorageResult<RenameResponse> {
        let src = self.get_path(path);
        let dst = self.get_path(new_path);
        debug!(disk = %self.disk, src = %src, dst = %dst, operation, "copy");

        self.backend
            .copy_object(&src, &dst)
            .await
            .map_err(|e| StorageError::backend(operation, src.clone(), e))?;

        let url = self.canonical_url(operation, &dst).await?;
        Ok(RenameResponse { path: dst, url })
    }

    async fn move_inner(&self, path: &str, new_path: &str) -> StorageResult<RenameResponse> {
        let src = self.get_path(path);

        // Copying onto itself and then deleting would lose the object.
        if src == self.get_path(new_path) {
            return match self.backend.head_object(&src).await {
                Lookup::Found(_) => {
                    let url = self.canonical_url("move", &src).await?;
                    Ok(RenameResponse { path: src, url })
                }
                Lookup::NotFound => Err(StorageError::backend(
                    "move",
                    src,
                    anyhow::anyhow!("source object not found"),
                )),
                Lookup::Failed(e) => Err(StorageError::backend("move", src, e)),
            };
        }

        let response = self.copy_inner("move", path, new_path).await?;
        if let Err(e) = self.backend.delete_object(&src).await {
            warn!(
                disk = %self.disk,
                src = %src,
                dst = %response.path,
                error = %e,
                "move copied the object but could not delete the source; both now exist"
            );
        }
        Ok(response)
    }

    // -- Bookkeeping -------------------------------------------------------

    /// Record a raise-on-failure operation.
    fn finish<T>(
        &self,
        operation: &'static str,
        started: Instant,
        result: StorageResult<T>,
    ) -> StorageResult<T> {
        let status = match &result {
            Ok(_) => STATUS_OK,
            Err(e) => e.code(),
        };
        record_operation(&self.disk, operation, status, started.elapsed());
        result
    }

    /// Collapse a lookup into the sentinel `None`, logging failures.
    fn settle<T>(
        &self,
        operation: &'static str,
        key: &str,
        started: Instant,
        lookup: Lookup<T>,
    ) -> Option<T> {
        let status = match &lookup {
            Lookup::Found(_) => STATUS_OK,
            Lookup::NotFound => {
                debug!(disk = %self.disk, key = %key, operation, "object not found");
                STATUS_NOT_FOUND
            }
            Lookup::Failed(e) => {
                warn!(
                    disk = %self.disk,
                    key = %key,
                    operation,
                    error = %e,
                    "lookup failed, treating object as absent"
                );
                STATUS_ERROR
            }
        };
        record_operation(&self.disk, operation, status, started.elapsed());
        lookup.found()
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S3DiskConfig;

    async fn memory_driver(base_path: Option<&str>) -> StorageDriver {
        let mut config =
            DiskConfig::memory().with_signing("http://localhost:9012", "unit-test-key");
        if let Some(base) = base_path {
            config = config.with_base_path(base);
        }
        StorageDriver::new("unit", config).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_path_with_and_without_base() {
        assert_eq!(memory_driver(None).await.get_path("a.png"), "a.png");
        let driver = memory_driver(Some("/uploads/")).await;
        assert_eq!(driver.get_path("a.png"), "uploads/a.png");
        assert_eq!(driver.get_path("x/y.txt"), "uploads/x/y.txt");
    }

    #[test]
    fn test_resolve_mime_type() {
        assert_eq!(resolve_mime_type("a.png", None), "image/png");
        assert_eq!(resolve_mime_type("notes.txt", None), "text/plain");
        assert_eq!(resolve_mime_type("blob", None), "application/octet-stream");
        assert_eq!(resolve_mime_type("a.png", Some("image/webp")), "image/webp");
        assert_eq!(resolve_mime_type("a.png", Some("")), "image/png");
    }

    #[test]
    fn test_strip_signature() {
        let signed = "https://my-bucket.s3.eu-west-1.amazonaws.com/uploads/a.png?X-Amz-Expires=1200&X-Amz-Signature=abc#frag";
        assert_eq!(
            strip_signature(signed).unwrap(),
            "https://my-bucket.s3.eu-west-1.amazonaws.com/uploads/a.png"
        );
        assert!(strip_signature("not a url").is_err());
    }

    #[test]
    fn test_meta_response_emptiness() {
        assert!(MetaResponse::default().is_empty());
        let meta = MetaResponse {
            content_length: Some(0),
            ..MetaResponse::default()
        };
        assert!(!meta.is_empty());
    }

    #[test]
    fn test_meta_response_serializes_camel_case() {
        let meta = MetaResponse {
            path: Some("a.txt".to_string()),
            content_type: Some("text/plain".to_string()),
            content_length: Some(3),
            ..MetaResponse::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["contentType"], "text/plain");
        assert_eq!(json["contentLength"], 3);
        assert!(json.get("etag").is_none());
        assert_eq!(serde_json::to_string(&MetaResponse::default()).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_put_applies_options() {
        let driver = memory_driver(Some("uploads")).await;
        let options = FileOptions::default()
            .with_mime_type("application/x-custom")
            .with_metadata("owner", "ops");
        let response = driver
            .put_with_options("data.bin", "payload", options)
            .await
            .unwrap();
        assert_eq!(response.path, "uploads/data.bin");
        assert_eq!(response.url, "http://localhost:9012/uploads/data.bin");

        let meta = driver.meta("data.bin").await;
        assert_eq!(meta.path.as_deref(), Some("uploads/data.bin"));
        assert_eq!(meta.content_type.as_deref(), Some("application/x-custom"));
        assert_eq!(meta.content_length, Some(7));
    }

    #[tokio::test]
    async fn test_signed_url_expiry_bounds() {
        let driver = memory_driver(None).await;
        for minutes in [0, MAX_EXPIRY_MINUTES + 1] {
            let err = driver.signed_url("a.txt", Some(minutes)).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidExpiry { .. }));
        }
        assert!(driver.signed_url("a.txt", Some(MAX_EXPIRY_MINUTES)).await.is_ok());
        assert!(driver.signed_url("a.txt", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_signed_url_roundtrip() {
        let driver = memory_driver(Some("uploads")).await;
        let signed = driver.signed_url("a b.png", Some(5)).await.unwrap();
        assert_eq!(driver.verify_signed_url(&signed).unwrap(), "uploads/a b.png");
    }

    #[tokio::test]
    async fn test_move_onto_itself_keeps_object() {
        let driver = memory_driver(None).await;
        driver.put("same.txt", "keep me").await.unwrap();
        let response = driver.move_to("same.txt", "same.txt").await.unwrap();
        assert_eq!(response.path, "same.txt");
        assert_eq!(driver.get("same.txt").await, Some(Bytes::from("keep me")));

        assert!(driver.move_to("ghost.txt", "ghost.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_s3_disk_requires_section() {
        let config = DiskConfig {
            driver: DriverKind::S3,
            ..DiskConfig::default()
        };
        let err = StorageDriver::new("broken", config).await.err().unwrap();
        assert_eq!(err.code(), "InvalidConfig");
        assert!(err.to_string().contains("disk 'broken'"));
    }

    #[tokio::test]
    async fn test_s3_url_is_stripped_presign() {
        let mut s3 = S3DiskConfig::new("my-bucket", "us-east-1");
        s3.endpoint_url = Some("http://localhost:9000".to_string());
        s3.use_path_style = true;
        s3.credentials = crate::config::CredentialStrategy::KeyPair {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
        };
        let driver = StorageDriver::new("s3", DiskConfig::s3(s3).with_base_path("uploads"))
            .await
            .unwrap();

        let url = driver.url("a.png").await.unwrap();
        assert_eq!(url, "http://localhost:9000/my-bucket/uploads/a.png");

        let signed = driver.signed_url("a.png", None).await.unwrap();
        assert!(signed.starts_with(&format!("{url}?")));
        assert!(signed.contains("X-Amz-Expires=1200"));
        assert_eq!(driver.verify_signed_url(&signed), Err(SignatureError::Unsupported));
    }
}
