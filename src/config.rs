//! Environment-driven configuration for the gateway and its HTTP front-end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{
    BedrockClient, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY, DEFAULT_TIMEOUT,
};
use crate::endpoint::EndpointResolver;
use crate::error::{GatewayError, Result};
use crate::gateway::{Gateway, TurnSettings, DEFAULT_MAX_TOOL_HOPS};
use crate::models::Credentials;
use crate::tool_catalog::ToolCatalog;
use crate::tool_proxy::ToolProxy;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8088";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub credentials: Credentials,
    pub endpoint_url: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_tool_hops: usize,
    pub tool_catalog: Option<PathBuf>,
    pub bind_addr: String,
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parse_u64 = |key: &str, default: u64| match get(key) {
            Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
                tracing::warn!("Ignoring malformed {}={:?}", key, raw);
                default
            }),
            None => default,
        };

        let region = get("AWS_REGION")
            .or_else(|| get("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let mut credentials = Credentials::new(
            get("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            get("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            region,
        );
        if let Some(token) = get("AWS_SESSION_TOKEN") {
            credentials = credentials.with_session_token(token);
        }

        let max_retries = parse_u64("BEDROCK_MAX_RETRIES", DEFAULT_MAX_RETRIES as u64);

        Self {
            credentials,
            endpoint_url: get("BEDROCK_ENDPOINT_URL"),
            timeout: Duration::from_secs(parse_u64(
                "BEDROCK_TIMEOUT_SECONDS",
                DEFAULT_TIMEOUT.as_secs(),
            )),
            retry: RetryPolicy {
                max_retries: u32::try_from(max_retries).unwrap_or(u32::MAX),
                base_delay: Duration::from_millis(parse_u64(
                    "BEDROCK_RETRY_BASE_DELAY_MS",
                    DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
                )),
            },
            max_tool_hops: parse_u64("BEDROCK_MAX_TOOL_HOPS", DEFAULT_MAX_TOOL_HOPS as u64)
                as usize,
            tool_catalog: get("BEDROCK_TOOL_CATALOG").map(PathBuf::from),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        }
    }

    pub fn resolver(&self) -> EndpointResolver {
        let resolver = EndpointResolver::new(self.credentials.region.clone());
        match &self.endpoint_url {
            Some(url) => resolver.with_base_url(url.clone()),
            None => resolver,
        }
    }

    /// Fails with `Config` when the access key or secret is missing.
    pub fn build_client(&self, http: reqwest::Client) -> Result<BedrockClient> {
        Ok(
            BedrockClient::new(http, self.credentials.clone(), self.resolver())?
                .with_retry_policy(self.retry)
                .with_timeout(self.timeout),
        )
    }

    /// Load the configured tool catalog, or an empty one when none is set.
    pub fn load_catalog(&self) -> Result<ToolCatalog> {
        match &self.tool_catalog {
            Some(path) => ToolCatalog::load_from_file(path),
            None => {
                tracing::info!("No tool catalog configured; tools are disabled");
                Ok(ToolCatalog::empty())
            }
        }
    }

    pub fn build_tool_proxy(&self, http: reqwest::Client, catalog: Arc<ToolCatalog>) -> ToolProxy {
        ToolProxy::new(http, catalog).with_timeout(self.timeout)
    }

    /// Wire client, catalog and tool proxy into a gateway.
    pub fn build_gateway(
        &self,
        http: reqwest::Client,
        catalog: Arc<ToolCatalog>,
    ) -> Result<(Gateway, ToolProxy)> {
        if self.max_tool_hops == 0 {
            return Err(GatewayError::Config(
                "BEDROCK_MAX_TOOL_HOPS must be at least 1".into(),
            ));
        }
        let client = self.build_client(http.clone())?;
        let proxy = self.build_tool_proxy(http, catalog.clone());
        let gateway = Gateway::new(client, catalog, Arc::new(proxy.clone())).with_settings(
            TurnSettings {
                max_tool_hops: self.max_tool_hops,
            },
        );
        Ok((gateway, proxy))
    }
}
