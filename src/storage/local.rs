//! Local filesystem storage backend.
//!
//! Objects are stored as flat files under a configurable root directory.
//! The physical key is used directly as a relative path (e.g. "uploads/a.png").
//! Content type, ETag and user metadata live in a JSON sidecar under
//! `.meta/`, mirroring the object's relative path.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::backend::{check_key, Lookup, ObjectBackend, ObjectHead, PutParams};
use super::body::ObjectBody;
use super::signing::UrlSigner;

const TMP_DIR: &str = ".tmp";
const META_DIR: &str = ".meta";

/// Attributes persisted next to each object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    etag: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
}

/// Stores objects on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored objects.
    root: PathBuf,
    signer: UrlSigner,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>, signer: UrlSigner) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        std::fs::create_dir_all(root.join(META_DIR))?;
        Ok(Self { root, signer })
    }

    /// Root directory of the disk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a physical key to an absolute file path.
    ///
    /// Rejects keys that would escape the root or land in the backend's
    /// own `.tmp`/`.meta` directories.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        check_key(key)?;
        let relative = Path::new(key);
        for (i, component) in relative.components().enumerate() {
            match component {
                Component::Normal(name) => {
                    if i == 0 && (name == TMP_DIR || name == META_DIR) {
                        anyhow::bail!("Reserved storage key: {}", key);
                    }
                }
                Component::CurDir
                | Component::ParentDir
                | Component::RootDir
                | Component::Prefix(_) => {
                    anyhow::bail!("Path traversal detected in storage key: {}", key);
                }
            }
        }
        Ok(self.root.join(relative))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{}", id))
    }

    /// Stream `body` into a temp file, fsync it and rename it over
    /// `final_path`.  Returns the quoted MD5 ETag of what was written.
    async fn write_atomic(&self, final_path: &Path, body: ObjectBody) -> anyhow::Result<String> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut hasher = Md5::new();
        let mut stream = body.into_stream();

        let written: io::Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, final_path).await {
            // A concurrent delete may have pruned the parent directory.
            let retried = match (e.kind(), final_path.parent()) {
                (io::ErrorKind::NotFound, Some(parent)) => {
                    tokio::fs::create_dir_all(parent).await?;
                    tokio::fs::rename(&tmp_path, final_path).await
                }
                _ => Err(e),
            };
            if let Err(e) = retried {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        }
        Ok(format!("\"{}\"", hex::encode(hasher.finalize())))
    }

    async fn read_sidecar(&self, key: &str) -> Option<Sidecar> {
        let raw = tokio::fs::read(self.sidecar_path(key)).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ignoring unreadable metadata sidecar");
                None
            }
        }
    }

    async fn write_sidecar(&self, key: &str, sidecar: &Sidecar) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(sidecar)?;
        self.write_atomic(&self.sidecar_path(key), ObjectBody::from(raw))
            .await?;
        Ok(())
    }
}

/// Remove `path`, treating an absent file as success.
/// Remove the empty directories between `path` and `stop`, deepest first.
/// `stop` itself is kept.
async fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == stop || !current.starts_with(stop) {
            break;
        }
        // Fails on the first directory that still has entries.
        if tokio::fs::remove_dir(current).await.is_err() {
            break;
        }
        dir = current.parent();
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl ObjectBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        params: PutParams,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&key)?;
            let etag = self.write_atomic(&final_path, body).await?;
            tracing::debug!(key = %key, etag = %etag, "Local put");

            let sidecar = Sidecar {
                content_type: params.content_type,
                etag,
                metadata: params.metadata,
                cache_control: params.cache_control,
                content_disposition: params.content_disposition,
                content_encoding: params.content_encoding,
            };
            self.write_sidecar(&key, &sidecar).await
        })
    }

    fn get_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<Bytes>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = match self.resolve(&key) {
                Ok(path) => path,
                Err(e) => return Lookup::Failed(e),
            };
            match tokio::fs::read(&path).await {
                Ok(data) => Lookup::Found(Bytes::from(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Lookup::NotFound,
                Err(e) => Lookup::Failed(e.into()),
            }
        })
    }

    fn head_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<ObjectHead>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = match self.resolve(&key) {
                Ok(path) => path,
                Err(e) => return Lookup::Failed(e),
            };
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => m,
                Ok(_) => return Lookup::NotFound,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Lookup::NotFound,
                Err(e) => return Lookup::Failed(e.into()),
            };

            let sidecar = self.read_sidecar(&key).await;
            let content_type = match &sidecar {
                Some(s) => s.content_type.clone(),
                None => mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string(),
            };
            Lookup::Found(ObjectHead {
                content_type: Some(content_type),
                content_length: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                etag: sidecar.map(|s| s.etag),
            })
        })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            let sidecar = self.sidecar_path(&key);
            // Idempotent: if the file doesn't exist, that's fine.
            remove_if_exists(&path).await?;
            remove_if_exists(&sidecar).await?;
            prune_empty_parents(&path, &self.root).await;
            prune_empty_parents(&sidecar, &self.root.join(META_DIR)).await;
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
            let src_path = self.resolve(&src_key)?;
            let dst_path = self.resolve(&dst_key)?;
            let source = match tokio::fs::File::open(&src_path).await {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    anyhow::bail!("Source object not found at storage key: {}", src_key)
                }
                Err(e) => return Err(e.into()),
            };

            let etag = self
                .write_atomic(&dst_path, ObjectBody::from_reader(source))
                .await?;

            let mut sidecar = self.read_sidecar(&src_key).await.unwrap_or_else(|| Sidecar {
                content_type: mime_guess::from_path(&src_path)
                    .first_or_octet_stream()
                    .to_string(),
                ..Sidecar::default()
            });
            sidecar.etag = etag;
            self.write_sidecar(&dst_key, &sidecar).await
        })
    }

    fn presign_get(
        &self,
        key: &str,
        expires: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let url = self.resolve(key).map(|_| self.signer.sign(key, expires));
        Box::pin(async move { url })
    }
}

// -- Tests -------------------------------------------------------------------
