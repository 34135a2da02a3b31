use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Burst of `capacity` requests, then one per `refill_every`.
///
/// Partial refill progress carries over between calls, and a drained bucket
/// sleeps only until the next token is due.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut TokenBucketState, now: Instant) {
        if self.refill_every.is_zero() {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let earned = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos()).unwrap_or(u32::MAX);
        if earned == 0 {
            return;
        }
        state.tokens = state.tokens.saturating_add(earned).min(self.capacity);
        state.last_refill = if state.tokens == self.capacity {
            now
        } else {
            state.last_refill + self.refill_every * earned
        };
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                (state.last_refill + self.refill_every).saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not JSON: {message}")]
    Decode { url: String, message: String },
}

/// JSON-over-HTTP client shared by providers.
///
/// Calls to one provider are serialized and paced by the optional token bucket.
/// Failed requests are returned, never retried: a rerun of the job is the retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            per_provider: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    async fn provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    pub async fn get_json(
        &self,
        provider: &str,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let semaphore = self.provider_semaphore(provider).await;
        // The semaphore is never closed, so acquiring only fails if that invariant breaks.
        let _permit = semaphore.acquire_owned().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", provider, url);
        async {
            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, value);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), "provider returned non-success status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
                url: final_url,
                message: e.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}
