//! Tool proxy: executes a catalog tool as an outbound HTTP call.
//!
//! The preferred operation of the tool's invocation template decides the
//! method; argument placement follows the declared parameter locations:
//! - `request_body` present: every argument not placed in the path or query,
//!   `in: body` parameters included, forms a JSON (or form-encoded) body
//! - parameters `in: body` without a `request_body`: sent form-encoded
//! - parameters `in: query`: appended to the query string
//! - parameters `in: path`: substituted into `{name}` placeholders
//!
//! Only HTTP 200 is a success. 202 is reported as accepted (still processing);
//! every other status is an upstream error.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::signer::uri_encode;
use crate::tool_catalog::{HttpMethod, ParameterLocation, ToolCatalog, ToolDefinition};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// HTTP 200 with the decoded response.
    Completed(Value),
    /// HTTP 202: the tool took the request but has no result yet.
    Accepted(Value),
}

impl ToolOutcome {
    pub fn into_value(self) -> Value {
        match self {
            ToolOutcome::Completed(value) => value,
            ToolOutcome::Accepted(value) => json!({"status": "accepted", "response": value}),
        }
    }
}

/// Executes a named tool with JSON arguments.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value) -> Result<ToolOutcome>;
}

/// Where the non-query arguments go.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    None,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Fully resolved outbound request for a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub payload: RequestPayload,
}

fn value_to_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_present(args: &Map<String, Value>, name: &str) -> bool {
    args.get(name).is_some_and(|v| !v.is_null())
}

/// Validate arguments and place them according to the tool's invocation template.
pub fn prepare_request(tool: &ToolDefinition, arguments: &Value) -> Result<PreparedRequest> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(GatewayError::Validation(format!(
                "arguments for {} must be a JSON object",
                tool.name
            )))
        }
    };

    let (method, op) = tool.invocation.preferred_operation().ok_or_else(|| {
        GatewayError::Config(format!("tool {} declares no operations", tool.name))
    })?;

    let mut missing: Vec<String> = op
        .parameters
        .iter()
        .filter(|p| p.required && !is_present(args, &p.name))
        .map(|p| p.name.clone())
        .collect();
    if let Some(body) = &op.request_body {
        missing.extend(
            body.required_fields()
                .into_iter()
                .filter(|name| !is_present(args, name)),
        );
    }
    if !missing.is_empty() {
        return Err(GatewayError::Validation(format!(
            "missing required arguments for {}: {}",
            tool.name,
            missing.join(", ")
        )));
    }

    let mut path = tool.invocation.path.clone();
    let mut query = Vec::new();
    let mut form = Vec::new();
    let mut placed: Vec<&str> = Vec::new();

    for param in &op.parameters {
        let Some(value) = args.get(&param.name).filter(|v| !v.is_null()) else {
            continue;
        };
        match param.location {
            ParameterLocation::Path => {
                let placeholder = format!("{{{}}}", param.name);
                path = path.replace(&placeholder, &uri_encode(&value_to_param(value)));
                placed.push(param.name.as_str());
            }
            ParameterLocation::Query => {
                query.push((param.name.clone(), value_to_param(value)));
                placed.push(param.name.as_str());
            }
            // Body arguments stay in `rest` so a declared request body carries them too.
            ParameterLocation::Body => form.push((param.name.clone(), value_to_param(value))),
        }
    }

    let url = crate::tool_catalog::ToolInvocation {
        path,
        ..tool.invocation.clone()
    }
    .url();

    let payload = if let Some(body) = &op.request_body {
        let rest: Map<String, Value> = args
            .iter()
            .filter(|(k, _)| !placed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if body.is_form() {
            RequestPayload::Form(
                rest.iter()
                    .map(|(k, v)| (k.clone(), value_to_param(v)))
                    .collect(),
            )
        } else {
            RequestPayload::Json(Value::Object(rest))
        }
    } else if !form.is_empty() {
        RequestPayload::Form(form)
    } else if op.parameters.is_empty() && !args.is_empty() {
        // Undeclared arguments: query string for GET, JSON body otherwise.
        if method == HttpMethod::Get {
            query.extend(args.iter().map(|(k, v)| (k.clone(), value_to_param(v))));
            RequestPayload::None
        } else {
            RequestPayload::Json(Value::Object(args.clone()))
        }
    } else {
        RequestPayload::None
    };

    Ok(PreparedRequest {
        method,
        url,
        query,
        payload,
    })
}

/// Executes catalog tools over HTTP.
#[derive(Clone)]
pub struct ToolProxy {
    http: reqwest::Client,
    catalog: Arc<ToolCatalog>,
    timeout: Duration,
}

impl ToolProxy {
    pub fn new(http: reqwest::Client, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            http,
            catalog,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Execute a tool and return its JSON result.
    ///
    /// A 202 response yields `{"status": "accepted", "response": ...}`.
    pub async fn proxy_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        self.execute(name, arguments)
            .await
            .map(ToolOutcome::into_value)
    }

    async fn send(&self, request: PreparedRequest) -> Result<ToolOutcome> {
        let mut builder = self
            .http
            .request(request.method.as_reqwest(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.payload {
            RequestPayload::None => builder,
            RequestPayload::Json(body) => builder.json(&body),
            RequestPayload::Form(pairs) => builder.form(&pairs),
        };

        let secs = self.timeout.as_secs();
        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| GatewayError::Timeout(secs))?
            .map_err(|e| GatewayError::from_reqwest(e, secs))?;

        let status = response.status().as_u16();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        let text = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| GatewayError::Timeout(secs))?
            .map_err(|e| GatewayError::from_reqwest(e, secs))?;

        let decoded = || -> Value {
            if is_json {
                serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()))
            } else {
                Value::String(text.clone())
            }
        };

        match status {
            200 => Ok(ToolOutcome::Completed(decoded())),
            202 => Ok(ToolOutcome::Accepted(if text.trim().is_empty() {
                Value::Null
            } else {
                decoded()
            })),
            _ => Err(GatewayError::Upstream { status, body: text }),
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolProxy {
    async fn execute(&self, name: &str, arguments: &Value) -> Result<ToolOutcome> {
        let tool = self
            .catalog
            .get(name)
            .ok_or_else(|| GatewayError::Validation(format!("unknown tool: {name}")))?;
        let request = prepare_request(tool, arguments)?;
        tracing::info!(
            "Calling tool {} via {:?} {}",
            name,
            request.method,
            request.url
        );
        let outcome = self.send(request).await;
        match &outcome {
            Ok(ToolOutcome::Completed(_)) => tracing::info!("Tool {} completed", name),
            Ok(ToolOutcome::Accepted(_)) => tracing::info!("Tool {} accepted for processing", name),
            Err(err) => tracing::warn!("Tool {} failed: {}", name, err),
        }
        outcome
    }
}
