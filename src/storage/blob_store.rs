//! Blob Store Layer: upload (and, for administrative tooling, list/download)
//! byte objects to one of several interchangeable storage providers.
//!
//! Provider configuration is read from environment variables named
//! `{STORE}_{PROVIDER}_{VAR}` — e.g. `ARCHIVE_S3_BUCKET`,
//! `ARCHIVE_S3_ACCESS_KEY_ID` — so several logical stores (archive, raw
//! dumps, ...) can each have their own provider set active at once.
//!
//! Exactly one concrete provider is implemented here (S3-compatible, via a
//! hand-signed SigV4 HTTP client over `reqwest`), sufficient to exercise the
//! trait; the registry is built so a second provider is a pure addition.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// A byte-object store bound to one bucket/prefix.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `local_path` to `remote_key` within this store's
    /// bucket.
    async fn upload_file(&self, local_path: &Path, remote_key: &str) -> Result<()>;

    /// List object keys under `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    /// Download `key` to `local_path`.
    async fn download_file(&self, key: &str, local_path: &Path) -> Result<()>;

    /// Human-readable tag for this provider, used in log lines and the
    /// per-store label on upload counters (e.g. `"S3"`).
    fn provider_tag(&self) -> &'static str;
}

/// One provider's required environment variables, keyed by the `{VAR}`
/// suffix of `{STORE}_{PROVIDER}_{VAR}`.
struct EnvConfig {
    bucket: Option<String>,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint: String,
    prefix: String,
}

fn env_var(store: &str, provider: &str, var: &str) -> Option<String> {
    std::env::var(format!("{store}_{provider}_{var}")).ok()
}

fn read_env_config(store: &str, provider: &str) -> Option<EnvConfig> {
    let access_key_id = env_var(store, provider, "ACCESS_KEY_ID")?;
    let secret_access_key = env_var(store, provider, "SECRET_ACCESS_KEY")?;
    Some(EnvConfig {
        bucket: env_var(store, provider, "BUCKET"),
        region: env_var(store, provider, "REGION").unwrap_or_else(|| "us-east-1".to_string()),
        access_key_id,
        secret_access_key,
        endpoint: env_var(store, provider, "ENDPOINT")
            .unwrap_or_else(|| "https://s3.amazonaws.com".to_string()),
        prefix: env_var(store, provider, "PREFIX").unwrap_or_default(),
    })
}

/// Returns every provider for which complete environment configuration
/// exists for logical store `store_name` (e.g. `"ARCHIVE"`). Missing
/// configuration for a provider is not fatal — it's simply skipped.
pub fn blobstores(store_name: &str) -> Vec<std::sync::Arc<dyn BlobStore>> {
    let mut stores: Vec<std::sync::Arc<dyn BlobStore>> = Vec::new();
    for provider in PROVIDERS {
        match read_env_config(store_name, provider) {
            Some(cfg) => match cfg.bucket.clone() {
                Some(bucket) => {
                    log::info!("blob store {store_name}/{provider} configured for bucket {bucket}");
                    stores.push(std::sync::Arc::new(S3Store::new(bucket, cfg)));
                }
                None => {
                    log::debug!(
                        "blob store {store_name}/{provider} has credentials but no bucket; skipping"
                    );
                }
            },
            None => {
                log::debug!("blob store {store_name}/{provider} not configured; skipping");
            }
        }
    }
    stores
}

const PROVIDERS: &[&str] = &["S3"];

/// Resolves a `scheme://bucket/key_or_prefix` URL to a provider bound to
/// that bucket. Credentials still come from `{STORE}_{PROVIDER}_{VAR}`
/// env vars; the bucket name comes from the URL instead of `..._BUCKET`.
pub fn blobstore_by_url(store_name: &str, url: &str) -> Result<std::sync::Arc<dyn BlobStore>> {
    let parsed = url::Url::parse(url).with_context(|| format!("parsing blob store URL {url}"))?;
    let provider = parsed.scheme().to_ascii_uppercase();
    if !PROVIDERS.contains(&provider.as_str()) {
        bail!("unknown blob store provider scheme {provider}");
    }
    let bucket = parsed
        .host_str()
        .with_context(|| format!("blob store URL {url} missing bucket (host component)"))?
        .to_string();
    let mut cfg = read_env_config(store_name, &provider)
        .with_context(|| format!("no {store_name}_{provider}_* credentials configured"))?;
    cfg.bucket = Some(bucket.clone());
    Ok(std::sync::Arc::new(S3Store::new(bucket, cfg)))
}

/// S3-compatible object store, signed with AWS Signature Version 4.
/// Works against real S3 and any S3-compatible endpoint (MinIO, etc) by
/// overriding `{STORE}_S3_ENDPOINT`.
pub struct S3Store {
    client: reqwest::Client,
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint: String,
    prefix: String,
}

impl S3Store {
    fn new(bucket: String, cfg: EnvConfig) -> Self {
        S3Store {
            client: reqwest::Client::new(),
            bucket,
            region: cfg.region,
            access_key_id: cfg.access_key_id,
            secret_access_key: cfg.secret_access_key,
            endpoint: cfg.endpoint,
            prefix: cfg.prefix,
        }
    }

    fn key_with_prefix(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key.trim_start_matches('/'))
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            key
        )
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let url = if query.is_empty() {
            self.object_url(key)
        } else {
            format!("{}?{}", self.object_url(key), query)
        };
        let host = url::Url::parse(&url)?
            .host_str()
            .context("object URL missing host")?
            .to_string();
        let amz_date = amz_date_now();
        let date_stamp = &amz_date[..8];
        let payload_hash = hex_sha256(&body);

        let canonical_uri = format!("/{}/{key}", self.bucket);
        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = self.signing_key(date_stamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        );

        let resp = self
            .client
            .request(method, &url)
            .header("host", host)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .with_context(|| format!("S3 request to {url}"))?;
        Ok(resp)
    }

    /// `HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), "s3"), "aws4_request")`.
    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        hmac_sha256(&k_service, b"aws4_request")
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn upload_file(&self, local_path: &Path, remote_key: &str) -> Result<()> {
        let body = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;
        let key = self.key_with_prefix(remote_key);
        let resp = self
            .signed_request(reqwest::Method::PUT, &key, "", body)
            .await?;
        if !resp.status().is_success() {
            bail!("S3 PUT {key} failed: {}", resp.status());
        }
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = self.key_with_prefix(prefix);
        let query = format!("list-type=2&prefix={}", urlencode(&prefix));
        let resp = self
            .signed_request(reqwest::Method::GET, "", &query, Vec::new())
            .await?;
        if !resp.status().is_success() {
            bail!("S3 ListObjectsV2 failed: {}", resp.status());
        }
        let body = resp.text().await?;
        Ok(parse_list_objects_keys(&body))
    }

    async fn download_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let full_key = self.key_with_prefix(key);
        let resp = self
            .signed_request(reqwest::Method::GET, &full_key, "", Vec::new())
            .await?;
        if !resp.status().is_success() {
            bail!("S3 GET {full_key} failed: {}", resp.status());
        }
        let bytes = resp.bytes().await?;
        tokio::fs::write(local_path, &bytes)
            .await
            .with_context(|| format!("writing {}", local_path.display()))?;
        Ok(())
    }

    fn provider_tag(&self) -> &'static str {
        "S3"
    }
}

fn amz_date_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let iso = crate::app::humantime_iso8601(secs);
    // "2021-01-01T00:00:00Z" -> "20210101T000000Z"
    iso.chars().filter(|c| *c != '-' && *c != ':').collect()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Pulls `<Key>...</Key>` text out of an S3 `ListObjectsV2` XML response.
/// A minimal, dependency-free scan rather than a full XML parser, since
/// the only structure this crate needs out of the response is the key list.
fn parse_list_objects_keys(xml: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Key>") {
        let after = &rest[start + "<Key>".len()..];
        let Some(end) = after.find("</Key>") else {
            break;
        };
        keys.push(after[..end].to_string());
        rest = &after[end + "</Key>".len()..];
    }
    keys
}
