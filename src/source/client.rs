// src/source/client.rs
use crate::config::ScraperConfig;
use crate::source::rate_gate::RateGate;
use crate::source::retry::{with_retry, RetryPolicy};
use crate::utils::error::FetchError;
use reqwest::header;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// HTTP access to the source site for one job (or one standalone lookup).
///
/// Every request goes through the shared [`RateGate`] and carries the
/// configured timeout. A request that has not passed the gate when `cancel`
/// fires is never sent; one that has is allowed to finish.
#[derive(Debug, Clone)]
pub struct SiteClient {
    http: reqwest::Client,
    base_url: Url,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl SiteClient {
    /// `delay` is both the spacing between requests and the retry base delay.
    pub fn new(
        config: &ScraperConfig,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, FetchError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            http,
            base_url,
            gate: Arc::new(RateGate::new(delay)),
            retry: RetryPolicy::new(config.max_attempts, delay),
            cancel,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves a site-relative path (or absolute URL) against the base URL.
    pub fn url(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Fetches an HTML page.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.send(url, "text/html,application/xhtml+xml,*/*;q=0.8").await?;
        let body = response.text().await?;
        tracing::debug!("Fetched {} bytes of HTML from {}", body.len(), url);
        Ok(body)
    }

    /// Fetches and decodes a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.send(url, "application/json").await?;
        Ok(response.json::<T>().await?)
    }

    /// Fetches a binary document in full.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.send(url, "application/pdf,application/octet-stream,*/*").await?;
        let body = response.bytes().await?;
        tracing::debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body.to_vec())
    }

    pub async fn get_text_with_retry(&self, url: &str) -> Result<String, FetchError> {
        with_retry(&self.retry, &self.cancel, || self.get_text(url)).await
    }

    pub async fn get_bytes_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        with_retry(&self.retry, &self.cancel, || self.get_bytes(url)).await
    }

    async fn send(&self, url: &str, accept: &str) -> Result<reqwest::Response, FetchError> {
        let url = self.url(url)?;

        if !self.gate.wait(&self.cancel).await {
            return Err(FetchError::Cancelled);
        }

        let response = self
            .http
            .get(url.clone())
            .header(header::ACCEPT, accept)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!("Server error {} for {}", status, url);
            return Err(FetchError::Server(status));
        }

        tracing::debug!("Request rejected with {} for {}", status, url);
        Err(FetchError::Client(status))
    }
}
