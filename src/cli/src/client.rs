//! HTTP client for the Keel server.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Envelope used by the admin routes.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// Headers attached to write requests.
#[derive(Debug, Clone)]
pub struct WriteHeaders {
    pub correlation_id: String,
    pub idempotency_key: Option<String>,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and fail on a non-2xx status, keeping the body text.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("{} failed", what))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }
        Ok(resp)
    }

    async fn unwrap_envelope<T: DeserializeOwned>(resp: Response, url: &str) -> Result<T> {
        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        if api_resp.success {
            api_resp
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
        } else {
            Err(anyhow::anyhow!(
                "API error: {}",
                api_resp.error.unwrap_or_else(|| "Unknown error".into())
            ))
        }
    }

    /// GET an enveloped admin route.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .send(self.client.get(&url), &format!("GET {}", url))
            .await?;
        Self::unwrap_envelope(resp, &url).await
    }

    /// GET an enveloped admin route with query parameters.
    pub async fn get_with_query<Q: Serialize, T: DeserializeOwned>(&self, path: &str, query: &Q) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .send(self.client.get(&url).query(query), &format!("GET {}", url))
            .await?;
        Self::unwrap_envelope(resp, &url).await
    }

    /// POST to an enveloped admin route with no body.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .send(self.client.post(&url), &format!("POST {}", url))
            .await?;
        Self::unwrap_envelope(resp, &url).await
    }

    /// DELETE an enveloped admin route with query parameters.
    pub async fn delete<Q: Serialize, T: DeserializeOwned>(&self, path: &str, query: &Q) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .send(self.client.delete(&url).query(query), &format!("DELETE {}", url))
            .await?;
        Self::unwrap_envelope(resp, &url).await
    }

    /// POST a write with the governor headers and return the raw JSON body.
    pub async fn write<B: Serialize>(
        &self,
        path: &str,
        headers: &WriteHeaders,
        body: &B,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        let mut request = self
            .client
            .post(&url)
            .header("X-Correlation-ID", &headers.correlation_id)
            .json(body);
        if let Some(key) = &headers.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let resp = self.send(request, &format!("POST {}", url)).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// GET a route that is not enveloped (`/health`, `/status`).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .send(self.client.get(&url), &format!("GET {}", url))
            .await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}
