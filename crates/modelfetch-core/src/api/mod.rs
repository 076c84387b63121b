//! Catalog API client
//!
//! Every call goes through the client's [`RateLimiter`] and, for GET
//! requests, its [`ResponseCache`]. Failures are retried according to the
//! client's retry policy.

mod cache;
mod pagination;
mod rate_limiter;

pub use cache::{cache_key, ResponseCache};
pub use pagination::MAX_PAGES;
pub use rate_limiter::RateLimiter;

use crate::config::ApiConfig;
use crate::error::{retry_after, FetchError};
use crate::retry::{classify_default, RetryExecutor, RetryPolicy};
use modelfetch_types::{Model, SearchPage, SearchParams, SearchResponse};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Typed client for the search, model and download endpoints
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Build a client with its own limiter and cache
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let rate_limiter = RateLimiter::new(config.min_interval(), config.rate_limit_floor());
        let cache = ResponseCache::new(config.cache_ttl());
        Self::with_parts(config, rate_limiter, cache)
    }

    /// Build a client around an injected limiter and cache
    pub fn with_parts(
        config: &ApiConfig,
        rate_limiter: RateLimiter,
        cache: ResponseCache,
    ) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            rate_limiter,
            cache,
            retry: RetryPolicy::from_settings(&config.retry),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Fetch one page of search results
    pub async fn search(
        &self,
        params: &SearchParams,
        cursor: Option<&str>,
    ) -> Result<SearchPage, FetchError> {
        let mut pairs = params.to_pairs();
        if let Some(cursor) = cursor {
            pairs.push(("cursor".to_string(), cursor.to_string()));
        }

        let response: SearchResponse = self.get_typed("/search", pairs).await?;
        Ok(response.into())
    }

    pub async fn get_model(&self, model_id: u64) -> Result<Model, FetchError> {
        self.get_typed(&format!("/models/{}", model_id), Vec::new())
            .await
    }

    /// Resolve the signed URL a file download currently redirects to
    ///
    /// Signed URLs expire, so the result is never cached.
    pub async fn resolve_download_url(&self, file_id: &str) -> Result<String, FetchError> {
        let url = format!("{}/download/{}", self.base_url, file_id);

        let outcome = RetryExecutor::new(&self.retry)
            .execute(|_| self.head_once(&url), classify_default)
            .await;

        let resolved = outcome.result?;
        info!("Resolved download URL for file {}", file_id);
        Ok(resolved)
    }

    async fn head_once(&self, url: &str) -> Result<String, FetchError> {
        self.rate_limiter.acquire().await;

        let response = self
            .authorized(self.http.head(url))
            .send()
            .await
            .map_err(FetchError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.reject(status, retry_after(response.headers()), String::new()).await);
        }

        self.rate_limiter.relax().await;
        Ok(response.url().to_string())
    }

    async fn get_typed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, FetchError> {
        let value = self.get_json(path, params).await?;
        serde_json::from_value(value).map_err(|e| FetchError::Parse(format!("{}: {}", path, e)))
    }

    /// GET a JSON document with rate limiting, caching and retries
    async fn get_json(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, FetchError> {
        let key = cache_key(path, &params);
        let key = &key;
        let params = &params;

        RetryExecutor::new(&self.retry)
            .execute(move |_| self.get_once(path, key, params), classify_default)
            .await
            .result
    }

    async fn get_once(
        &self,
        path: &str,
        key: &str,
        params: &[(String, String)],
    ) -> Result<Value, FetchError> {
        self.rate_limiter.acquire().await;

        if let Some(value) = self.cache.get(key) {
            debug!("Cache hit: {}", key);
            return Ok(value);
        }

        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", key);

        let response = self
            .authorized(self.http.get(&url).query(params))
            .send()
            .await
            .map_err(FetchError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(self.reject(status, after, body).await);
        }

        let bytes = response.bytes().await.map_err(FetchError::from_transport)?;
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        self.rate_limiter.relax().await;
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn reject(
        &self,
        status: reqwest::StatusCode,
        retry_after: Option<Duration>,
        body: String,
    ) -> FetchError {
        let error = FetchError::from_status(status, retry_after, body);
        if let FetchError::RateLimited { retry_after } = &error {
            self.rate_limiter.widen(*retry_after).await;
        }
        error
    }
}
