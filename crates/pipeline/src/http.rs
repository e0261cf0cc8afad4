//! reqwest-backed provider client, media fetcher and object storage.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::client::{ProviderClient, ProviderStatus};
use crate::provider::{MediaFetcher, ObjectStorage, ProviderError, object_key};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn build_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Request(e.to_string()))
}

/// Queue-style HTTP provider API.
///
/// - `POST {base}/{endpoint}` → `{ "request_id": ... }`
/// - `GET {base}/{endpoint}/requests/{id}/status` → [`ProviderStatus`]
/// - `GET {base}/{endpoint}/requests/{id}` → result document
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, endpoint: &str, suffix: &str) -> String {
        format!("{}/{}{}", self.base_url, endpoint.trim_matches('/'), suffix)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!("{status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResult(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn submit(&self, endpoint: &str, input: &serde_json::Value) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(self.url(endpoint, ""))
            .header("Authorization", format!("Key {}", self.api_key))
            .json(input)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let submitted: SubmitResponse = Self::read_json(resp).await?;
        Ok(submitted.request_id)
    }

    async fn status(&self, endpoint: &str, request_id: &str) -> Result<ProviderStatus, ProviderError> {
        let resp = self
            .client
            .get(self.url(endpoint, &format!("/requests/{request_id}/status")))
            .header("Authorization", format!("Key {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Self::read_json(resp).await
    }

    async fn result(&self, endpoint: &str, request_id: &str) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .client
            .get(self.url(endpoint, &format!("/requests/{request_id}")))
            .header("Authorization", format!("Key {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Self::read_json(resp).await
    }
}

/// Downloads produced media.
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ProviderError::Request(format!(
                "fetch {url}: {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        debug!(url, len = bytes.len(), "media fetched");
        Ok(bytes.to_vec())
    }
}

/// Object storage behind an HTTP `PUT` endpoint (S3-compatible presigned gateway).
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: reqwest::Client,
    upload_base: String,
    public_base: String,
    token: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(
        upload_base: impl Into<String>,
        public_base: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_hash: &str,
        content_type: &str,
    ) -> Result<String, ProviderError> {
        let key = object_key(path, content_hash, content_type);
        let mut req = self
            .client
            .put(format!("{}/{}", self.upload_base, key))
            .header("Content-Type", content_type)
            .body(bytes);

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Storage(e.to_string()))?;

        // 409/412: the object already exists under this hash.
        let status = resp.status();
        if !(status.is_success()
            || status == reqwest::StatusCode::CONFLICT
            || status == reqwest::StatusCode::PRECONDITION_FAILED)
        {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Storage(format!("{status}: {body}")));
        }

        Ok(format!("{}/{}", self.public_base, key))
    }
}
