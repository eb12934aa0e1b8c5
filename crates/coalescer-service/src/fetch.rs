//! An executor fetching URLs over HTTP.
//!
//! [`HttpFetcher`] is the canonical expensive operation to put behind a
//! [`RequestCoordinator`](crate::coordinator::RequestCoordinator): concurrent fetches of the same
//! URL are coalesced into one request, and responses are cached in the configured store.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Url, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FetchConfig;

/// A fetched response.
///
/// Responses with an error status are still responses, so they are cached like any other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// The final URL, after following redirects.
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Fetches URLs with a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;

        Ok(Self { client })
    }

    /// Fetches `url` and reads the full response body.
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let url = Url::parse(url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        tracing::debug!(%url, "Fetching");

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "*/*")
            .send()
            .await?;

        let url = response.url().to_string();
        let status = response.status().as_u16();
        let body = response.text().await?;

        metric!(counter("coalescer.fetch.response") += 1, "status" => &status.to_string());

        Ok(FetchResponse { url, status, body })
    }

    /// Turns the fetcher into an executor function for a coordinator.
    pub fn into_executor(
        self,
    ) -> impl Fn(String) -> BoxFuture<'static, Result<FetchResponse, FetchError>>
    + Send
    + Sync
    + 'static {
        let fetcher = Arc::new(self);
        move |url| {
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch(&url).await }.boxed()
        }
    }
}
