//! In-memory storage backend.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>` and vanish
//! with the backend.  A configurable memory limit (`max_size_bytes`) caps
//! total stored bytes.  URLs are signed with the disk's [`UrlSigner`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::backend::{check_key, Lookup, ObjectBackend, ObjectHead, PutParams};
use super::body::ObjectBody;
use super::signing::UrlSigner;

/// One stored object.
#[derive(Debug, Clone)]
struct MemoryObject {
    data: Bytes,
    content_type: String,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<String, MemoryObject>,
    /// Total bytes currently stored.
    current_size: u64,
}

impl MemoryState {
    /// Insert `object` at `key`, enforcing `max_size_bytes` (0 = unlimited).
    fn insert(
        &mut self,
        key: String,
        object: MemoryObject,
        max_size_bytes: u64,
    ) -> anyhow::Result<()> {
        let replaced = self.objects.get(&key).map_or(0, |o| o.data.len() as u64);
        let new_size = self.current_size - replaced + object.data.len() as u64;
        if max_size_bytes > 0 && new_size > max_size_bytes {
            anyhow::bail!(
                "memory limit exceeded: {} + {} bytes > {} bytes",
                self.current_size - replaced,
                object.data.len(),
                max_size_bytes
            );
        }
        self.current_size = new_size;
        self.objects.insert(key, object);
        Ok(())
    }

    fn remove(&mut self, key: &str) {
        if let Some(object) = self.objects.remove(key) {
            self.current_size -= object.data.len() as u64;
        }
    }
}

/// In-memory storage backend.
pub struct MemoryBackend {
    state: tokio::sync::RwLock<MemoryState>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
    signer: UrlSigner,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new(max_size_bytes: u64, signer: UrlSigner) -> Self {
        Self {
            state: tokio::sync::RwLock::new(MemoryState::default()),
            max_size_bytes,
            signer,
        }
    }

    /// Total bytes currently stored.
    pub async fn current_size(&self) -> u64 {
        self.state.read().await.current_size
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    /// Whether no objects are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Compute the quoted MD5 hex ETag of `data`.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }
}

impl ObjectBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        params: PutParams,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            check_key(&key)?;
            let data = body.collect().await?;
            let object = MemoryObject {
                etag: Self::compute_etag(&data),
                content_type: params.content_type,
                last_modified: Utc::now(),
                data,
            };
            tracing::debug!(key = %key, size = object.data.len(), "Memory put");
            self.state.write().await.insert(key, object, self.max_size_bytes)
        })
    }

    fn get_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<Bytes>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            if let Err(e) = check_key(&key) {
                return Lookup::Failed(e);
            }
            match self.state.read().await.objects.get(&key) {
                Some(object) => Lookup::Found(object.data.clone()),
                None => Lookup::NotFound,
            }
        })
    }

    fn head_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<ObjectHead>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            if let Err(e) = check_key(&key) {
                return Lookup::Failed(e);
            }
            match self.state.read().await.objects.get(&key) {
                Some(object) => Lookup::Found(ObjectHead {
                    content_type: Some(object.content_type.clone()),
                    content_length: object.data.len() as u64,
                    last_modified: Some(object.last_modified),
                    etag: Some(object.etag.clone()),
                }),
                None => Lookup::NotFound,
            }
        })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            check_key(&key)?;
            self.state.write().await.remove(&key);
            Ok(())
        })
    }

    fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            check_key(&src_key)?;
            check_key(&dst_key)?;
            let mut state = self.state.write().await;
            let mut object = state
                .objects
                .get(&src_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Source object not found: {}", src_key))?;
            object.last_modified = Utc::now();
            state.insert(dst_key, object, self.max_size_bytes)
        })
    }

    fn presign_get(
        &self,
        key: &str,
        expires: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let url = check_key(key).map(|()| self.signer.sign(key, expires));
        Box::pin(async move { url })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningConfig;

    fn test_backend_with_limit(max_bytes: u64) -> MemoryBackend {
        let signer = UrlSigner::new(&SigningConfig {
            base_url: "http://localhost:9012".to_string(),
            key: "memory-test-key".to_string(),
        })
        .unwrap();
        MemoryBackend::new(max_bytes, signer)
    }

    fn test_backend() -> MemoryBackend {
        test_backend_with_limit(0)
    }

    fn params(content_type: &str) -> PutParams {
        PutParams {
            content_type: content_type.to_string(),
            ..PutParams::default()
        }
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let backend = test_backend();
        backend
            .put_object("a/key.txt", ObjectBody::from("hello world"), params("text/plain"))
            .await
            .unwrap();

        let data = backend.get_object("a/key.txt").await.found().unwrap();
        assert_eq!(data, Bytes::from("hello world"));
        assert_eq!(backend.current_size().await, 11);
    }

    #[tokio::test]
    async fn test_head_reports_stored_attributes() {
        let backend = test_backend();
        backend
            .put_object("empty", ObjectBody::from(Vec::new()), params("application/json"))
            .await
            .unwrap();

        let head = backend.head_object("empty").await.found().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("application/json"));
        assert_eq!(head.content_length, 0);
        // Known MD5 of the empty string.
        assert_eq!(head.etag.as_deref(), Some("\"d41d8cd98f00b204e9800998ecf8427e\""));
        assert!(head.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let backend = test_backend();
        assert!(matches!(backend.get_object("nope").await, Lookup::NotFound));
        assert!(matches!(backend.head_object("nope").await, Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_put_overwrites_and_tracks_size() {
        let backend = test_backend();
        backend
            .put_object("k", ObjectBody::from("version 1"), params("text/plain"))
            .await
            .unwrap();
        backend
            .put_object("k", ObjectBody::from("v2"), params("text/plain"))
            .await
            .unwrap();

        assert_eq!(backend.get_object("k").await.found().unwrap(), Bytes::from("v2"));
        assert_eq!(backend.current_size().await, 2);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = test_backend();
        backend
            .put_object("k", ObjectBody::from("data"), params("text/plain"))
            .await
            .unwrap();
        backend.delete_object("k").await.unwrap();
        backend.delete_object("k").await.unwrap();
        assert!(backend.is_empty().await);
        assert_eq!(backend.current_size().await, 0);
    }

    #[tokio::test]
    async fn test_copy_object() {
        let backend = test_backend();
        backend
            .put_object("src.txt", ObjectBody::from("copy me"), params("text/plain"))
            .await
            .unwrap();
        backend.copy_object("src.txt", "dst.txt").await.unwrap();

        assert_eq!(
            backend.get_object("dst.txt").await.found().unwrap(),
            Bytes::from("copy me")
        );
        assert!(matches!(backend.head_object("src.txt").await, Lookup::Found(_)));
        let head = backend.head_object("dst.txt").await.found().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let backend = test_backend();
        assert!(backend.copy_object("nope", "dst").await.is_err());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_limit_enforced() {
        let backend = test_backend_with_limit(10);
        backend
            .put_object("a", ObjectBody::from("12345678"), params("text/plain"))
            .await
            .unwrap();
        let err = backend
            .put_object("b", ObjectBody::from("12345"), params("text/plain"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("memory limit exceeded"));

        // Replacing an object only counts the difference.
        backend
            .put_object("a", ObjectBody::from("0123456789"), params("text/plain"))
            .await
            .unwrap();
        assert_eq!(backend.current_size().await, 10);
    }

    #[tokio::test]
    async fn test_streamed_body_is_collected() {
        let backend = test_backend();
        let body = ObjectBody::from_stream(futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("part one, ")),
            Ok(Bytes::from("part two")),
        ]));
        backend.put_object("s", body, params("text/plain")).await.unwrap();
        assert_eq!(
            backend.get_object("s").await.found().unwrap(),
            Bytes::from("part one, part two")
        );
    }

    #[tokio::test]
    async fn test_dot_segment_keys_rejected() {
        let backend = test_backend();
        for key in ["a/../b.txt", "./b.txt", "a/.", "/abs.txt", ""] {
            let result = backend
                .put_object(key, ObjectBody::from("x"), params("text/plain"))
                .await;
            assert!(result.is_err(), "key {key:?} should be rejected");
            assert!(backend
                .presign_get(key, Duration::from_secs(60))
                .await
                .is_err());
        }
        assert!(backend.is_empty().await);
        assert!(matches!(backend.get_object("a/../b.txt").await, Lookup::Failed(_)));
        assert!(matches!(backend.head_object("a/./b.txt").await, Lookup::Failed(_)));
        assert!(backend.copy_object("a/../b.txt", "c.txt").await.is_err());

        // Dots inside a segment are ordinary characters.
        backend
            .put_object("a/..b/.hidden", ObjectBody::from("x"), params("text/plain"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_presign_get_is_signed() {
        let backend = test_backend();
        let url = backend
            .presign_get("uploads/a.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:9012/uploads/a.png?"));
        assert!(url.contains("X-Bleep-Signature="));
    }
}
