//! Signed HTTP client for Bedrock Runtime with retry and timeouts.

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::EndpointResolver;
use crate::error::{GatewayError, Result};
use crate::event_stream::FrameStream;
use crate::models::{CancelToken, Credentials};
use crate::signer::sign;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

const CONTENT_TYPE_JSON: &str = "application/json";
const ACCEPT_EVENT_STREAM: &str = "application/vnd.amazon.eventstream";

/// Retry schedule for one HTTP call: an initial attempt plus up to `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// Throttling (HTTP 429) backs off exponentially with up to 10% jitter;
    /// every other retryable failure backs off linearly.
    pub fn delay_for(&self, attempt: u32, err: &GatewayError) -> Duration {
        let attempt = attempt.max(1);
        if err.is_rate_limited() {
            let exp = self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            let jitter = exp.mul_f64(rand::thread_rng().gen_range(0.0..=0.1));
            exp + jitter
        } else {
            self.base_delay.saturating_mul(attempt)
        }
    }
}

/// Bedrock Runtime client. Cheap to clone; shares the underlying connection pool.
#[derive(Clone)]
pub struct BedrockClient {
    http: reqwest::Client,
    credentials: Arc<Credentials>,
    resolver: EndpointResolver,
    retry: RetryPolicy,
    timeout: Duration,
}

impl BedrockClient {
    /// Fails with `Config` when the credentials are incomplete.
    pub fn new(
        http: reqwest::Client,
        credentials: Credentials,
        resolver: EndpointResolver,
    ) -> Result<Self> {
        credentials.validate()?;
        Ok(Self {
            http,
            credentials: Arc::new(credentials),
            resolver,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn resolver(&self) -> &EndpointResolver {
        &self.resolver
    }

    /// Non-streaming invoke; returns the parsed JSON response body.
    pub async fn invoke(&self, model_id: &str, body: &Value, cancel: &CancelToken) -> Result<Value> {
        let response = self.send_with_retry(model_id, body, false, cancel).await?;
        let secs = self.timeout.as_secs();
        let bytes = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| GatewayError::Timeout(secs))?
            .map_err(|e| GatewayError::from_reqwest(e, secs))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Parse(format!("invalid response body: {e}")))
    }

    /// Streaming invoke; returns a lazy stream of decoded frames.
    pub async fn invoke_stream(
        &self,
        model_id: &str,
        body: &Value,
        cancel: &CancelToken,
    ) -> Result<FrameStream> {
        let response = self.send_with_retry(model_id, body, true, cancel).await?;
        Ok(FrameStream::from_response(response, self.timeout))
    }

    async fn send_with_retry(
        &self,
        model_id: &str,
        body: &Value,
        streaming: bool,
        cancel: &CancelToken,
    ) -> Result<reqwest::Response> {
        let url = self.resolver.resolve(model_id, streaming)?;
        let payload = serde_json::to_vec(body).map_err(|e| GatewayError::Encoding(e.to_string()))?;

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            match self.send_once(&url, &payload, streaming).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt, &err);
                    tracing::warn!(
                        model = model_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying Bedrock request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One signed attempt. The signature is recomputed with the current time on every call.
    async fn send_once(
        &self,
        url: &str,
        payload: &[u8],
        streaming: bool,
    ) -> Result<reqwest::Response> {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), CONTENT_TYPE_JSON.to_string());
        if streaming {
            headers.insert("accept".to_string(), ACCEPT_EVENT_STREAM.to_string());
            headers.insert(
                "x-amzn-bedrock-accept".to_string(),
                CONTENT_TYPE_JSON.to_string(),
            );
        } else {
            headers.insert("accept".to_string(), CONTENT_TYPE_JSON.to_string());
        }

        let signed = sign("POST", url, &headers, payload, &self.credentials, Utc::now())?;

        let mut request = self.http.post(url);
        for (name, value) in &signed {
            // reqwest derives Host from the URL.
            if name == "host" {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        let secs = self.timeout.as_secs();
        let response = tokio::time::timeout(self.timeout, request.body(payload.to_vec()).send())
            .await
            .map_err(|_| GatewayError::Timeout(secs))?
            .map_err(|e| GatewayError::from_reqwest(e, secs))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read Bedrock error body: {}", e);
                String::new()
            }
            Err(_) => {
                tracing::warn!("Timed out reading Bedrock error body after {}s", secs);
                String::new()
            }
        };
        tracing::debug!("Bedrock returned HTTP {}: {}", status.as_u16(), body);
        Err(GatewayError::Http {
            status: status.as_u16(),
            body,
        })
    }
}
