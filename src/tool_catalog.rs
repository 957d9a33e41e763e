//! Tool catalog
//!
//! Declarative, read-only descriptions of the HTTP tools a model may call.
//! Each entry carries the model-facing schema and an OpenAPI-subset
//! invocation template used by the tool proxy. The catalog is loaded once at
//! startup and shared behind an `Arc`; nothing mutates it afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// HTTP methods a tool operation may declare. Ordering is the preference order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Where an argument is placed on the outgoing request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Query,
    Body,
    Path,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_string_schema")]
    pub schema: Value,
}

fn default_string_schema() -> Value {
    json!({"type": "string"})
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestBody {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub required: bool,
    pub schema: Value,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl RequestBody {
    pub fn is_form(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .starts_with("application/x-www-form-urlencoded")
    }

    /// Names listed in the schema's `required` array.
    pub fn required_fields(&self) -> Vec<String> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One OpenAPI-style operation on the tool's path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolOperation {
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<RequestBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub base_url: String,
    #[serde(default)]
    pub path: String,
    pub operations: BTreeMap<HttpMethod, ToolOperation>,
}

impl ToolInvocation {
    /// GET when declared, otherwise the first declared method.
    pub fn preferred_operation(&self) -> Option<(HttpMethod, &ToolOperation)> {
        self.operations.iter().next().map(|(m, op)| (*m, op))
    }

    pub fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.path.trim();
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Explicit JSON schema shown to the model; derived from the operation when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub invocation: ToolInvocation,
}

impl ToolDefinition {
    /// JSON schema describing the tool's arguments, always an object schema.
    pub fn input_schema(&self) -> Value {
        if let Some(schema) = &self.parameters {
            return schema.clone();
        }

        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();
        if let Some((_, op)) = self.invocation.preferred_operation() {
            for param in &op.parameters {
                let mut schema = param.schema.clone();
                if let (Some(desc), Some(obj)) = (&param.description, schema.as_object_mut()) {
                    obj.entry("description")
                        .or_insert_with(|| Value::String(desc.clone()));
                }
                properties.insert(param.name.clone(), schema);
                if param.required {
                    required.push(Value::String(param.name.clone()));
                }
            }
            if let Some(body) = &op.request_body {
                if let Some(props) = body.schema.get("properties").and_then(Value::as_object) {
                    for (k, v) in props {
                        properties.insert(k.clone(), v.clone());
                    }
                }
                required.extend(body.required_fields().into_iter().map(Value::String));
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            schema["required"] = Value::Array(required);
        }
        schema
    }
}

/// Document shape on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    tools: Vec<ToolDefinition>,
}

/// Immutable set of tool definitions keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(tools: Vec<ToolDefinition>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for tool in tools {
            if tool.name.trim().is_empty() {
                return Err(GatewayError::Config("tool name must not be empty".into()));
            }
            if tool.invocation.operations.is_empty() {
                return Err(GatewayError::Config(format!(
                    "tool {} declares no operations",
                    tool.name
                )));
            }
            if map.insert(tool.name.clone(), tool).is_some() {
                return Err(GatewayError::Config("duplicate tool name in catalog".into()));
            }
        }
        Ok(Self { tools: map })
    }

    /// Load from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read tool catalog {}: {e}", path.display()))
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let doc: CatalogDocument = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::Config(format!("invalid tool catalog: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| GatewayError::Config(format!("invalid tool catalog: {e}")))?
        };
        let catalog = Self::new(doc.tools)?;
        tracing::info!(
            "Loaded {} tool definitions from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Resolve selected tool names; unknown names are a configuration error.
    pub fn select(&self, names: &[String]) -> Result<Vec<ToolDefinition>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| GatewayError::Config(format!("unknown tool: {name}")))
            })
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
