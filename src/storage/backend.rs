//! Abstract object backend trait.
//!
//! Every backend must implement [`ObjectBackend`].  The trait works on
//! **physical** keys (base path already applied) and keeps "not found"
//! apart from genuine failures through [`Lookup`], so the driver can log
//! the difference before collapsing both into the contract's sentinels.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::body::ObjectBody;

/// Outcome of a read-style backend call.
#[derive(Debug)]
pub enum Lookup<T> {
    /// The object exists.
    Found(T),
    /// The backend reported the object as absent.
    NotFound,
    /// The call failed for another reason (network, permissions, ...).
    Failed(anyhow::Error),
}

impl<T> Lookup<T> {
    /// The found value, if any.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound | Lookup::Failed(_) => None,
        }
    }

    /// Map the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(err) => Lookup::Failed(err),
        }
    }
}

/// Reject keys that a URL path cannot carry verbatim: empty keys, a
/// leading `/`, and `.` or `..` segments.
pub fn check_key(key: &str) -> anyhow::Result<()> {
    if key.is_empty() {
        anyhow::bail!("Empty storage key");
    }
    if key.starts_with('/') {
        anyhow::bail!("Absolute storage key: {}", key);
    }
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        anyhow::bail!("Dot segment in storage key: {}", key);
    }
    Ok(())
}

/// Object attributes returned by a head-style request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    /// Stored MIME type.
    pub content_type: Option<String>,
    /// Size in bytes.
    pub content_length: u64,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Entity tag, quoted as S3 returns it.
    pub etag: Option<String>,
}

/// Attributes attached to an object on write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutParams {
    /// Resolved MIME type.
    pub content_type: String,
    /// User metadata (`x-amz-meta-*` on S3).
    pub metadata: HashMap<String, String>,
    /// `Cache-Control` to store with the object.
    pub cache_control: Option<String>,
    /// `Content-Disposition` to store with the object.
    pub content_disposition: Option<String>,
    /// `Content-Encoding` to store with the object.
    pub content_encoding: Option<String>,
    /// Canned ACL (S3 only).
    pub acl: Option<String>,
}

/// Async object storage primitives.
pub trait ObjectBackend: Send + Sync + 'static {
    /// Short backend name for logs and metrics (`s3`, `local`, `memory`).
    fn kind(&self) -> &'static str;

    /// Write `body` to `key`.  Large payloads are uploaded in parts.
    fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        params: PutParams,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read the full object at `key`.
    fn get_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<Bytes>> + Send + '_>>;

    /// Fetch the attributes of the object at `key`.
    fn head_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<ObjectHead>> + Send + '_>>;

    /// Delete the object at `key`.  Deleting an absent key succeeds.
    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Server-side copy from `src_key` to `dst_key`.  Resolves only once
    /// the destination is complete.
    fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Produce a URL granting read access to `key` for `expires`.
    fn presign_get(
        &self,
        key: &str,
        expires: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_found() {
        let lookup = Lookup::Found(3).map(|n| n * 2);
        assert!(matches!(lookup, Lookup::Found(6)));
        assert_eq!(lookup.found(), Some(6));
    }

    #[test]
    fn test_lookup_failure_and_absence_collapse_to_none() {
        let missing: Lookup<u8> = Lookup::NotFound;
        assert_eq!(missing.found(), None);

        let failed: Lookup<u8> = Lookup::Failed(anyhow::anyhow!("boom"));
        assert!(matches!(failed, Lookup::Failed(_)));
        assert_eq!(failed.map(|n| n + 1).found(), None);
    }
}
