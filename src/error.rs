//! Error taxonomy for the gateway.
//!
//! Errors fall into two groups: turn-fatal errors that abort the current
//! conversation turn and are reported to the caller, and tool-scoped errors
//! that are folded back into the conversation as an error tool result.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing or invalid credentials, region or model id.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request body could not be serialized.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The model id matched no known model family.
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// Non-success status from the inference API.
    #[error("Bedrock returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A response body or event frame could not be decoded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Tool arguments failed validation against the tool schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A proxied tool call failed or returned an unexpected status.
    #[error("Upstream tool call failed with HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Tool round-trip limit of {0} reached")]
    ToolLimit(usize),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Whether the network layer may retry the HTTP call that produced this error.
    ///
    /// Of the HTTP statuses only throttling, request timeouts and 5xx are retried;
    /// any other 4xx fails on the first response.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Timeout(_) => true,
            GatewayError::Http { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Whether the error is scoped to a single tool call.
    ///
    /// Network failures count as tool-scoped here because this is only
    /// consulted for errors raised while executing a tool.
    pub fn is_tool_scoped(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation(_)
                | GatewayError::Upstream { .. }
                | GatewayError::Network(_)
                | GatewayError::Timeout(_)
        )
    }

    /// HTTP 429 from the inference API.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GatewayError::Http { status: 429, .. })
    }

    /// Stable snake_case tag, used in stream error events and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Encoding(_) => "encoding",
            GatewayError::UnsupportedModel(_) => "unsupported_model",
            GatewayError::Network(_) => "network",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Http { .. } => "http",
            GatewayError::Parse(_) => "parse",
            GatewayError::Validation(_) => "validation",
            GatewayError::Upstream { .. } => "upstream",
            GatewayError::Cancelled => "cancelled",
            GatewayError::ToolLimit(_) => "tool_limit",
        }
    }

    /// Map a reqwest failure, keeping timeouts distinct from other network errors.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(timeout_secs)
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Encoding(err.to_string())
    }
}
