//! AWS S3 storage backend.
//!
//! Talks to one S3 (or S3-compatible) bucket through `aws-sdk-s3`.  Keys are
//! used as-is; the driver has already applied the disk's base path.
//!
//! Credentials follow the disk's [`CredentialStrategy`]: a named profile,
//! an explicit key pair, or the standard AWS credential chain (env vars,
//! `~/.aws/credentials`, IAM role, etc.).  Nothing is resolved until the
//! first request.
//!
//! Writes larger than one part go through a native multipart upload with
//! at most `queue_size` parts in flight.

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::backend::{Lookup, ObjectBackend, ObjectHead, PutParams};
use super::body::{ObjectBody, PartReader};
use crate::config::{CredentialStrategy, S3DiskConfig};

/// S3 rejects multipart uploads with more parts than this.
pub const MAX_PARTS: i32 = 10_000;

/// Characters escaped in the `x-amz-copy-source` header: everything except
/// RFC 3986 unreserved characters and the path separator.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// How a body goes to S3, decided from its first two parts.
enum UploadPlan {
    /// At most one part: a single `PutObject`.
    Single(Bytes),
    /// Two or more parts: a multipart upload starting with `leading`.
    Multipart {
        leading: [Bytes; 2],
        rest: PartReader,
    },
}

/// Read up to two parts of `body` and pick the upload method.
///
/// Empty bodies, bodies shorter than one part and bodies of exactly one
/// full part go out as one request.
async fn plan_upload(body: ObjectBody, part_size: usize) -> std::io::Result<UploadPlan> {
    let mut reader = PartReader::new(body, part_size);

    let Some(first) = reader.next_part().await? else {
        return Ok(UploadPlan::Single(Bytes::new()));
    };
    if first.len() < reader.part_size() {
        return Ok(UploadPlan::Single(first));
    }
    let Some(second) = reader.next_part().await? else {
        return Ok(UploadPlan::Single(first));
    };

    Ok(UploadPlan::Multipart {
        leading: [first, second],
        rest: reader,
    })
}

/// Fail early when a body of known length cannot fit in `MAX_PARTS` parts.
fn check_fits(known_len: Option<u64>, part_size: usize) -> anyhow::Result<()> {
    let limit = part_size as u64 * MAX_PARTS as u64;
    match known_len {
        Some(len) if len > limit => anyhow::bail!(
            "object of {len} bytes needs more than {MAX_PARTS} parts at part_size {part_size}"
        ),
        _ => Ok(()),
    }
}

/// Fail once a streamed body runs past `MAX_PARTS` parts.
fn check_part_number(part_number: i32, part_size: usize) -> anyhow::Result<()> {
    if part_number > MAX_PARTS {
        anyhow::bail!("object needs more than {MAX_PARTS} parts at part_size {part_size}");
    }
    Ok(())
}

/// Backend that stores objects in a single S3 bucket.
pub struct S3Backend {
    /// AWS S3 SDK client.
    client: Client,
    /// Target bucket.
    bucket: String,
    /// Multipart part size in bytes.
    part_size: usize,
    /// Maximum parts uploaded concurrently.
    queue_size: usize,
}

impl S3Backend {
    /// Create a new S3 backend for `config`.
    ///
    /// Builds the SDK client only; no network I/O happens here.  Missing or
    /// invalid credentials surface on the first request.
    pub async fn new(config: &S3DiskConfig) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        // Exactly one credential source is attached.
        match &config.credentials {
            CredentialStrategy::Profile { name } => {
                config_loader = config_loader.profile_name(name);
            }
            CredentialStrategy::KeyPair {
                access_key,
                secret_key,
            } => {
                let creds = aws_sdk_s3::config::Credentials::new(
                    access_key,
                    secret_key,
                    None, // session_token
                    None, // expiry
                    "bleepdisk-config",
                );
                config_loader = config_loader.credentials_provider(creds);
            }
            CredentialStrategy::Default => {}
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            credentials = config.credentials.label(),
            "S3 backend initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            part_size: usize::try_from(config.multipart.part_size)?,
            queue_size: config.multipart.queue_size.max(1),
        })
    }

    /// The SDK client, for callers that need operations outside the contract.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Target bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }

    /// Single-request upload of a payload that fits in one part.
    async fn put_single(&self, key: &str, data: Bytes, params: &PutParams) -> anyhow::Result<()> {
        debug!(bucket = %self.bucket, key = %key, size = data.len(), "AWS put_object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(&params.content_type)
            .set_metadata(metadata_of(params))
            .set_cache_control(params.cache_control.clone())
            .set_content_disposition(params.content_disposition.clone())
            .set_content_encoding(params.content_encoding.clone())
            .set_acl(canned_acl(params))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("put_object", e.into_service_error()))?;

        Ok(())
    }

    /// Multipart upload of the two `leading` parts and whatever `reader`
    /// still yields.  The upload is aborted on any failure.
    async fn put_multipart(
        &self,
        key: &str,
        leading: [Bytes; 2],
        reader: PartReader,
        params: &PutParams,
    ) -> anyhow::Result<()> {
        let create_resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&params.content_type)
            .set_metadata(metadata_of(params))
            .set_cache_control(params.cache_control.clone())
            .set_content_disposition(params.content_disposition.clone())
            .set_content_encoding(params.content_encoding.clone())
            .set_acl(canned_acl(params))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("create_multipart_upload", e.into_service_error()))?;

        let upload_id = create_resp
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("AWS did not return upload ID"))?
            .to_string();

        debug!(
            bucket = %self.bucket,
            key = %key,
            upload_id = %upload_id,
            part_size = self.part_size,
            queue_size = self.queue_size,
            "AWS multipart upload started"
        );

        match self.upload_parts(key, &upload_id, leading, reader).await {
            Ok(parts) => {
                let part_count = parts.len();
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                let completed = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| {
                        Self::map_sdk_error("complete_multipart_upload", e.into_service_error())
                    });

                match completed {
                    Ok(_) => {
                        debug!(key = %key, parts = part_count, "AWS multipart upload completed");
                        Ok(())
                    }
                    Err(e) => {
                        self.abort_upload(key, &upload_id, &e).await;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.abort_upload(key, &upload_id, &e).await;
                Err(e)
            }
        }
    }

    /// Upload every part, keeping at most `queue_size` requests in flight.
    /// Returns the completed parts ordered by part number.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        leading: [Bytes; 2],
        mut reader: PartReader,
    ) -> anyhow::Result<Vec<CompletedPart>> {
        let mut leading = leading.into_iter();
        let mut uploads = JoinSet::new();
        let mut completed = Vec::new();
        let mut part_number: i32 = 0;

        loop {
            while uploads.len() < self.queue_size {
                let next = match leading.next() {
                    Some(part) => Some(part),
                    None => reader.next_part().await?,
                };
                let Some(data) = next else { break };

                part_number += 1;
                check_part_number(part_number, self.part_size)?;
                uploads.spawn(upload_part(
                    self.client.clone(),
                    self.bucket.clone(),
                    key.to_string(),
                    upload_id.to_string(),
                    part_number,
                    data,
                ));
            }

            match uploads.join_next().await {
                Some(joined) => {
                    let part = joined
                        .map_err(|e| anyhow::anyhow!("upload_part task failed: {e}"))??;
                    completed.push(part);
                }
                None => break,
            }
        }

        completed.sort_by_key(|p| p.part_number());
        Ok(completed)
    }

    async fn abort_upload(&self, key: &str, upload_id: &str, cause: &anyhow::Error) {
        warn!(
            "Aborting AWS multipart upload {} due to error: {}",
            upload_id, cause
        );
        if let Err(abort_err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!("Failed to abort AWS multipart upload: {}", abort_err);
        }
    }
}

/// Upload one part.  Owns its inputs so it can run as a spawned task.
async fn upload_part(
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    data: Bytes,
) -> anyhow::Result<CompletedPart> {
    debug!(
        key = %key,
        upload_id = %upload_id,
        part_number,
        size = data.len(),
        "AWS upload_part"
    );

    let resp = client
        .upload_part()
        .bucket(&bucket)
        .key(&key)
        .upload_id(&upload_id)
        .part_number(part_number)
        .body(ByteStream::from(data))
        .send()
        .await
        .map_err(|e| S3Backend::map_sdk_error("upload_part", e.into_service_error()))?;

    Ok(CompletedPart::builder()
        .set_e_tag(resp.e_tag().map(str::to_string))
        .part_number(part_number)
        .build())
}

/// User metadata for the request, or `None` when there is none.
fn metadata_of(params: &PutParams) -> Option<std::collections::HashMap<String, String>> {
    (!params.metadata.is_empty()).then(|| params.metadata.clone())
}

fn canned_acl(params: &PutParams) -> Option<ObjectCannedAcl> {
    params.acl.as_deref().map(ObjectCannedAcl::from)
}

/// Value of the `x-amz-copy-source` header for `key` in `bucket`.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, utf8_percent_encode(key, COPY_SOURCE))
}

/// Convert an SDK timestamp.
fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

impl ObjectBackend for S3Backend {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        params: PutParams,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            check_fits(body.known_len(), self.part_size)?;
            match plan_upload(body, self.part_size).await? {
                UploadPlan::Single(data) => self.put_single(&key, data, &params).await,
                UploadPlan::Multipart { leading, rest } => {
                    self.put_multipart(&key, leading, rest, &params).await
                }
            }
        })
    }

    fn get_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<Bytes>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!(bucket = %self.bucket, key = %key, "AWS get_object");

            let resp = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        return Lookup::NotFound;
                    }
                    return Lookup::Failed(Self::map_sdk_error("get_object", service_err));
                }
            };

            match resp.body.collect().await {
                Ok(aggregated) => Lookup::Found(aggregated.into_bytes()),
                Err(e) => Lookup::Failed(Self::map_sdk_error("get_object body", e)),
            }
        })
    }

    fn head_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Lookup<ObjectHead>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!(bucket = %self.bucket, key = %key, "AWS head_object");

            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(resp) => Lookup::Found(ObjectHead {
                    content_type: resp.content_type().map(str::to_string),
                    content_length: resp.content_length().unwrap_or(0).max(0) as u64,
                    last_modified: resp.last_modified().and_then(to_chrono),
                    etag: resp.e_tag().map(str::to_string),
                }),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Lookup::NotFound
                    } else {
                        Lookup::Failed(Self::map_sdk_error("head_object", service_err))
                    }
                }
            }
        })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!(bucket = %self.bucket, key = %key, "AWS delete_object");

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e.into_service_error()))?;

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
            debug!(
                bucket = %self.bucket,
                src = %src_key,
                dst = %dst_key,
                "AWS copy_object"
            );

            // Server-side copy; the response arrives once the copy is done.
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .key(&dst_key)
                .copy_source(copy_source(&self.bucket, &src_key))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("copy_object", e.into_service_error()))?;

            Ok(())
        })
    }

    fn presign_get(
        &self,
        key: &str,
        expires: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let presigning = PresigningConfig::expires_in(expires)
                .map_err(|e| Self::map_sdk_error("presigning config", e))?;

            let request = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;

            Ok(request.uri().to_string())
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MultipartConfig;

    fn local_minio_config() -> S3DiskConfig {
        let mut config = S3DiskConfig::new("my-bucket", "us-east-1");
        config.endpoint_url = Some("http://localhost:9000".to_string());
        config.use_path_style = true;
        config.credentials = CredentialStrategy::KeyPair {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
        };
        config
    }

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(copy_source("b", "uploads/a.png"), "b/uploads/a.png");
        assert_eq!(
            copy_source("b", "uploads/my photo+1.png"),
            "b/uploads/my%20photo%2B1.png"
        );
        assert_eq!(copy_source("b", "dir/ü.txt"), "b/dir/%C3%BC.txt");
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs_and_nanos(1_700_000_000, 500);
        let converted = to_chrono(&dt).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 500);
    }

    #[test]
    fn test_request_attributes() {
        let mut params = PutParams {
            content_type: "image/png".to_string(),
            acl: Some("public-read".to_string()),
            ..PutParams::default()
        };
        assert_eq!(metadata_of(&params), None);
        assert_eq!(canned_acl(&params), Some(ObjectCannedAcl::PublicRead));

        params.metadata.insert("owner".to_string(), "ops".to_string());
        assert_eq!(metadata_of(&params).unwrap()["owner"], "ops");
    }

    #[tokio::test]
    async fn test_new_does_not_touch_network() {
        let mut config = local_minio_config();
        config.multipart = MultipartConfig {
            part_size: 8 * 1024 * 1024,
            queue_size: 2,
        };
        let backend = S3Backend::new(&config).await.unwrap();
        assert_eq!(backend.bucket(), "my-bucket");
        assert_eq!(backend.part_size, 8 * 1024 * 1024);
        assert_eq!(backend.queue_size, 2);
        assert_eq!(backend.kind(), "s3");
    }

    #[tokio::test]
    async fn test_presign_get_offline() {
        let backend = S3Backend::new(&local_minio_config()).await.unwrap();
        let url = backend
            .presign_get("uploads/a.png", Duration::from_secs(20 * 60))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/my-bucket/uploads/a.png?"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=1200"));
        assert!(url.contains("AKIDEXAMPLE"));
    }

    #[tokio::test]
    async fn test_presign_rejects_expiry_over_a_week() {
        let backend = S3Backend::new(&local_minio_config()).await.unwrap();
        let result = backend
            .presign_get("a.png", Duration::from_secs(8 * 24 * 60 * 60))
            .await;
        assert!(result.is_err());
    }

    fn chunked(chunks: &[&'static str]) -> ObjectBody {
        let chunks: Vec<std::io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        ObjectBody::from_stream(futures::stream::iter(chunks))
    }

    async fn single(body: ObjectBody, part_size: usize) -> Bytes {
        match plan_upload(body, part_size).await.unwrap() {
            UploadPlan::Single(data) => data,
            UploadPlan::Multipart { .. } => panic!("expected a single PutObject"),
        }
    }

    #[tokio::test]
    async fn test_plan_empty_body_is_single() {
        assert!(single(ObjectBody::from(""), 4).await.is_empty());
        assert!(single(chunked(&[]), 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_plan_short_body_is_single() {
        assert_eq!(single(ObjectBody::from("abc"), 4).await, Bytes::from("abc"));
        assert_eq!(single(chunked(&["a", "b"]), 4).await, Bytes::from("ab"));
    }

    #[tokio::test]
    async fn test_plan_exactly_one_part_is_single() {
        assert_eq!(single(ObjectBody::from("abcd"), 4).await, Bytes::from("abcd"));
        assert_eq!(single(chunked(&["ab", "cd"]), 4).await, Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn test_plan_one_byte_over_is_multipart() {
        match plan_upload(ObjectBody::from("abcde"), 4).await.unwrap() {
            UploadPlan::Multipart { leading, mut rest } => {
                assert_eq!(leading, [Bytes::from("abcd"), Bytes::from("e")]);
                assert_eq!(rest.next_part().await.unwrap(), None);
            }
            UploadPlan::Single(_) => panic!("expected a multipart upload"),
        }
    }

    #[tokio::test]
    async fn test_plan_keeps_remaining_parts_for_upload() {
        let body = chunked(&["abc", "defgh", "ijk"]);
        match plan_upload(body, 4).await.unwrap() {
            UploadPlan::Multipart { leading, mut rest } => {
                assert_eq!(leading, [Bytes::from("abcd"), Bytes::from("efgh")]);
                assert_eq!(rest.next_part().await.unwrap(), Some(Bytes::from("ijk")));
                assert_eq!(rest.next_part().await.unwrap(), None);
            }
            UploadPlan::Single(_) => panic!("expected a multipart upload"),
        }
    }

    #[test]
    fn test_check_fits_part_limit() {
        let part_size = 5 * 1024 * 1024;
        let limit = part_size as u64 * MAX_PARTS as u64;
        assert!(check_fits(None, part_size).is_ok());
        assert!(check_fits(Some(0), part_size).is_ok());
        assert!(check_fits(Some(limit), part_size).is_ok());
        let err = check_fits(Some(limit + 1), part_size).unwrap_err();
        assert!(err.to_string().contains("more than 10000 parts"));
    }

    #[test]
    fn test_check_part_number_limit() {
        assert!(check_part_number(1, 4).is_ok());
        assert!(check_part_number(MAX_PARTS, 4).is_ok());
        assert!(check_part_number(MAX_PARTS + 1, 4).is_err());
    }

    #[tokio::test]
    async fn test_put_rejects_oversized_body_before_any_request() {
        let mut config = local_minio_config();
        // Nothing listens here, so any request would fail differently.
        config.endpoint_url = Some("http://127.0.0.1:9".to_string());
        let backend = S3Backend {
            part_size: 1,
            ..S3Backend::new(&config).await.unwrap()
        };
        let body = ObjectBody::from(vec![0u8; MAX_PARTS as usize + 1]);
        let err = backend
            .put_object("big.bin", body, PutParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("needs more than 10000 parts"));
    }
}
