//! Object-storage backend over the GCS JSON API
//!
//! Keys are prefixed under `bucket/prefix`. `create_if_absent` uses the
//! `ifGenerationMatch=0` precondition, which the service evaluates
//! atomically; a `412 Precondition Failed` means the object already
//! existed.
//!
//! History trimming is intentionally not supported here: operators are
//! expected to configure bucket lifecycle rules for retention instead.
//!
//! Authentication: a bearer token read from `GCS_TOKEN`. Requests without
//! a token are still attempted (public buckets, emulators).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{StoreError, StoreResult};
use crate::store::ArtifactStore;

const STORAGE_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

/// Artifact store backed by a GCS bucket under an optional key prefix.
pub struct GcsStore {
    bucket: String,
    prefix: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsStore {
    /// Create a store for `bucket` with keys nested under `prefix`.
    pub fn new(bucket: &str, prefix: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fleetflow-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            token: std::env::var("GCS_TOKEN").ok(),
            client,
        }
    }

    fn full_key(&self, key: &str) -> String {
        let normalized = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            normalized.to_string()
        } else {
            format!("{}/{}", self.prefix, normalized)
        }
    }

    fn strip_prefix<'a>(&self, full_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(&format!("{}/", self.prefix))
            .unwrap_or(full_key)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{STORAGE_BASE}/b/{}/o/{}",
            self.bucket,
            encode_component(&self.full_key(key))
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn download(&self, key: &str) -> StoreResult<Vec<u8>> {
        let url = format!("{}?alt=media", self.object_url(key));
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(&self, key: &str, data: &[u8], if_absent: bool) -> StoreResult<bool> {
        let mut url = format!(
            "{UPLOAD_BASE}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            encode_component(&self.full_key(key))
        );
        if if_absent {
            url.push_str("&ifGenerationMatch=0");
        }
        let response = self
            .authorize(self.client.post(&url))
            .body(data.to_vec())
            .send()
            .await?;
        if if_absent && response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        response
            .error_for_status()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn list_full_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let search_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{STORAGE_BASE}/b/{}/o?prefix={}",
                self.bucket,
                encode_component(&search_prefix)
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", encode_component(token)));
            }
            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await?
                .error_for_status()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let page: ObjectList = response.json().await?;
            for item in page.items {
                // Pseudo-directory markers end with a slash
                if !item.name.ends_with('/') {
                    keys.push(item.name);
                }
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl ArtifactStore for GcsStore {
    async fn read_text(&self, key: &str) -> StoreResult<String> {
        let bytes = self.download(key).await?;
        String::from_utf8(bytes).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn write_text(&self, key: &str, text: &str) -> StoreResult<()> {
        self.upload(key, text.as_bytes(), false).await.map(|_| ())
    }

    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.download(key).await
    }

    async fn write_bytes(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.upload(key, data, false).await.map(|_| ())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let response = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response
            .error_for_status()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let keys = self.list_full_keys(prefix).await?;
        Ok(keys
            .iter()
            .map(|k| self.strip_prefix(k).to_string())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        for full_key in self.list_full_keys(prefix).await? {
            let url = format!(
                "{STORAGE_BASE}/b/{}/o/{}",
                self.bucket,
                encode_component(&full_key)
            );
            let response = self.authorize(self.client.delete(&url)).send().await?;
            if response.status() != StatusCode::NOT_FOUND {
                response
                    .error_for_status()
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, data: &[u8]) -> StoreResult<bool> {
        self.upload(key, data, true).await
    }

    fn uri_for_key(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, self.full_key(key))
    }

    async fn list_runs(&self) -> StoreResult<Vec<String>> {
        let mut runs: Vec<String> = self
            .list("")
            .await?
            .iter()
            .filter_map(|k| k.split_once('/').map(|(run, _)| run.to_string()))
            .collect();
        runs.sort();
        runs.dedup();
        Ok(runs)
    }
}

/// Percent-encode a URL component (path segment or query value).
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
