//! HMAC-SHA256 signed URLs for disks without a native presigning facility.
//!
//! A signed URL has the shape
//! `{base_url}/{encoded key}?X-Bleep-Expires=<unix>&X-Bleep-Signature=<hex>`
//! where the signature is `HMAC-SHA256(key, "GET\n{url path}\n{expires}")`.
//! Whatever serves the files checks it with [`UrlSigner::verify`].

use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use url::Url;

use crate::config::SigningConfig;
use crate::errors::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Query parameter carrying the expiry timestamp (unix seconds).
pub const EXPIRES_PARAM: &str = "X-Bleep-Expires";

/// Query parameter carrying the hex signature.
pub const SIGNATURE_PARAM: &str = "X-Bleep-Signature";

/// Why a signed URL was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signed URL: {0}")]
    Malformed(String),

    #[error("signed URL expired at {0}")]
    Expired(i64),

    #[error("signature does not match")]
    Mismatch,

    #[error("disk does not issue HMAC-signed URLs")]
    Unsupported,
}

/// Signs and verifies object URLs under one base URL.
#[derive(Clone)]
pub struct UrlSigner {
    base: Url,
    key: Vec<u8>,
}

impl UrlSigner {
    /// Build a signer from a disk's signing section.
    ///
    /// An empty key is replaced by a random per-process key, so URLs signed
    /// before a restart stop verifying afterwards.
    pub fn new(config: &SigningConfig) -> StorageResult<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            StorageError::InvalidConfig(format!("signing base_url '{}': {e}", config.base_url))
        })?;
        if base.cannot_be_a_base() {
            return Err(StorageError::InvalidConfig(format!(
                "signing base_url '{}' cannot carry object paths",
                config.base_url
            )));
        }

        let key = if config.key.is_empty() {
            tracing::warn!(
                base_url = %config.base_url,
                "No signing key configured, using an ephemeral key"
            );
            format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
                .into_bytes()
        } else {
            config.key.clone().into_bytes()
        };

        Ok(Self { base, key })
    }

    /// Unsigned URL of `key` under the base URL.
    pub fn canonical_url(&self, key: &str) -> String {
        self.object_url(key).to_string()
    }

    /// Signed URL of `key`, valid for `expires` from now.
    pub fn sign(&self, key: &str, expires: Duration) -> String {
        let expires_at = chrono::Utc::now().timestamp() + expires.as_secs() as i64;
        self.sign_at(key, expires_at)
    }

    /// Signed URL of `key` that expires at the unix timestamp `expires_at`.
    pub fn sign_at(&self, key: &str, expires_at: i64) -> String {
        let mut url = self.object_url(key);
        let signature = self.signature(url.path(), expires_at);
        url.query_pairs_mut()
            .append_pair(EXPIRES_PARAM, &expires_at.to_string())
            .append_pair(SIGNATURE_PARAM, &signature);
        url.to_string()
    }

    /// Check `signed_url` at unix time `now` and return the object key it
    /// grants access to.
    pub fn verify(&self, signed_url: &str, now: i64) -> Result<String, SignatureError> {
        let url = Url::parse(signed_url).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        if url.origin() != self.base.origin() {
            return Err(SignatureError::Malformed("foreign origin".to_string()));
        }

        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                EXPIRES_PARAM => expires = Some(value.into_owned()),
                SIGNATURE_PARAM => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let expires_at: i64 = expires
            .ok_or_else(|| SignatureError::Malformed(format!("missing {EXPIRES_PARAM}")))?
            .parse()
            .map_err(|_| SignatureError::Malformed(format!("invalid {EXPIRES_PARAM}")))?;
        let signature = signature
            .ok_or_else(|| SignatureError::Malformed(format!("missing {SIGNATURE_PARAM}")))?;

        let expected = self.signature(url.path(), expires_at);
        if !constant_time_eq(&expected, &signature) {
            return Err(SignatureError::Mismatch);
        }
        if now > expires_at {
            return Err(SignatureError::Expired(expires_at));
        }

        let prefix = self.base.path().trim_end_matches('/');
        let encoded_key = url
            .path()
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| SignatureError::Malformed("path outside base URL".to_string()))?;
        percent_decode_str(encoded_key)
            .decode_utf8()
            .map(|key| key.into_owned())
            .map_err(|e| SignatureError::Malformed(e.to_string()))
    }

    fn object_url(&self, key: &str) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        // Checked in `new`: the base can always carry path segments.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(key.split('/'));
        }
        url
    }

    fn signature(&self, path: &str, expires_at: i64) -> String {
        let string_to_sign = format!("GET\n{path}\n{expires_at}");
        hex::encode(hmac_sha256(&self.key, string_to_sign.as_bytes()))
    }
}

/// Compute HMAC-SHA256.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never takes the fallback.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compare two signature strings in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// -- Tests -------------------------------------------------------------------
