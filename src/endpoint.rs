//! Bedrock Runtime endpoint resolution.

use crate::error::{GatewayError, Result};
use crate::signer::uri_encode;

const ENDPOINT_PREFIX: &str = "bedrock-runtime";
const INVOKE: &str = "invoke";
const INVOKE_STREAM: &str = "invoke-with-response-stream";

/// Builds `https://bedrock-runtime.<region>.amazonaws.com/model/<id>/<action>` URLs.
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    region: String,
    base_url: Option<String>,
}

impl EndpointResolver {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            base_url: None,
        }
    }

    /// Override the scheme/host part, e.g. for VPC endpoints or a local test double.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let url = base_url.into();
        let trimmed = url.trim().trim_end_matches('/').to_string();
        self.base_url = (!trimmed.is_empty()).then_some(trimmed);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{ENDPOINT_PREFIX}.{}.amazonaws.com", self.region))
    }

    /// Resolve the invoke URL for a model.
    ///
    /// The model id is encoded as a single path segment: `.` `-` `_` `~` stay
    /// literal, `:` becomes `%3A` and a `/` inside an ARN becomes `%2F`.
    pub fn resolve(&self, model_id: &str, streaming: bool) -> Result<String> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(GatewayError::Config("model id is required".into()));
        }
        let action = if streaming { INVOKE_STREAM } else { INVOKE };
        Ok(format!(
            "{}/model/{}/{action}",
            self.base_url(),
            uri_encode(model_id)
        ))
    }
}
