//! Bedrock schema adapter
//!
//! Translates the canonical [`Conversation`] into the native InvokeModel body
//! of each supported model family, and decodes each family's responses (both
//! complete bodies and streaming chunks) back into canonical [`StreamEvent`]s:
//! - Anthropic Claude: Messages API, content blocks, `tool_use`/`tool_result`
//! - Amazon Nova: `messages-v1` schema, `toolUse`/`toolResult`, top-level `system`
//! - Amazon Titan Text: flattened `inputText` transcript, no tools
//! - Meta Llama 3: header-token prompt string, no tools
//! - Mistral: chat messages with OpenAI-style `tool_calls`/`tool_call_id`

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::error::{GatewayError, Result};
use crate::models::{
    ContentBlock, Conversation, InferenceParams, Message, Role, StreamEvent, PLACEHOLDER_TEXT,
};
use crate::tool_catalog::ToolDefinition;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const NOVA_SCHEMA_VERSION: &str = "messages-v1";
/// Upper bound Bedrock accepts for Llama `max_gen_len`.
const LLAMA_MAX_GEN_LEN: u32 = 2048;

/// Bedrock model families with distinct request/response schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Nova,
    Titan,
    Llama,
    Mistral,
}

/// Ordered detection rules; the first substring found in the lowercased model id wins.
const FAMILY_RULES: &[(&str, ModelFamily)] = &[
    ("anthropic", ModelFamily::Claude),
    ("claude", ModelFamily::Claude),
    ("nova", ModelFamily::Nova),
    ("titan", ModelFamily::Titan),
    ("llama", ModelFamily::Llama),
    ("mistral", ModelFamily::Mistral),
    ("mixtral", ModelFamily::Mistral),
];

impl ModelFamily {
    /// Detect the family from a model id, inference-profile id or ARN.
    pub fn from_model_id(model_id: &str) -> Result<Self> {
        let lowered = model_id.to_ascii_lowercase();
        FAMILY_RULES
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern))
            .map(|(_, family)| *family)
            .ok_or_else(|| GatewayError::UnsupportedModel(model_id.to_string()))
    }

    pub fn supports_tools(&self) -> bool {
        matches!(
            self,
            ModelFamily::Claude | ModelFamily::Nova | ModelFamily::Mistral
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Nova => "nova",
            ModelFamily::Titan => "titan",
            ModelFamily::Llama => "llama",
            ModelFamily::Mistral => "mistral",
        }
    }
}

/// Encode a conversation into the family's native request body.
pub fn encode(
    conversation: &Conversation,
    family: ModelFamily,
    params: &InferenceParams,
    tools: &[ToolDefinition],
) -> Result<Value> {
    if conversation.is_empty() {
        return Err(GatewayError::Encoding("conversation has no messages".into()));
    }
    if !tools.is_empty() && !family.supports_tools() {
        tracing::warn!(
            "Model family {} has no tool support; ignoring {} tool definitions",
            family.as_str(),
            tools.len()
        );
    }

    match family {
        ModelFamily::Claude => Ok(encode_claude(conversation, params, tools)),
        ModelFamily::Nova => Ok(encode_nova(conversation, params, tools)),
        ModelFamily::Titan => Ok(encode_titan(conversation, params)),
        ModelFamily::Llama => Ok(encode_llama(conversation, params)),
        ModelFamily::Mistral => Ok(encode_mistral(conversation, params, tools)),
    }
}

/// Render a tool output as plain text for schemas that only accept strings.
fn output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten a message to text for prompt-only families.
fn flatten_text(message: &Message) -> String {
    let parts: Vec<String> = message
        .content()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::ToolUse { name, input, .. } => Some(format!("[tool call {name}: {input}]")),
            ContentBlock::ToolResult { output, .. } => Some(output_text(output)),
            ContentBlock::Image { .. } => None,
        })
        .collect();
    if parts.is_empty() {
        PLACEHOLDER_TEXT.to_string()
    } else {
        parts.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------------

fn claude_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image {
            mime_type,
            encoding,
            data,
        } => json!({
            "type": "image",
            "source": {
                "type": encoding,
                "media_type": mime_type,
                "data": data
            }
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            output,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": [{"type": "text", "text": output_text(output)}],
            "is_error": is_error
        }),
    }
}

fn claude_placeholder(role: &str) -> Value {
    json!({
        "role": role,
        "content": [{"type": "text", "text": PLACEHOLDER_TEXT}]
    })
}

/// System and tool turns are sent as `user`; placeholder turns keep strict
/// user/assistant alternation and a leading `user` turn.
fn encode_claude(
    conversation: &Conversation,
    params: &InferenceParams,
    tools: &[ToolDefinition],
) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    let mut last_role: Option<&str> = None;

    for msg in conversation.messages() {
        let role = match msg.role() {
            Role::Assistant => "assistant",
            Role::System | Role::User | Role::Tool => "user",
        };

        match last_role {
            None if role == "assistant" => messages.push(claude_placeholder("user")),
            Some(prev) if prev == role => {
                let filler = if role == "user" { "assistant" } else { "user" };
                messages.push(claude_placeholder(filler));
            }
            _ => {}
        }

        messages.push(json!({
            "role": role,
            "content": msg.content().iter().map(claude_block).collect::<Vec<_>>()
        }));
        last_role = Some(role);
    }

    let mut body = json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": params.max_tokens(),
        "messages": messages,
        "temperature": params.temperature(),
        "top_p": params.top_p(),
        "top_k": params.top_k(),
    });

    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema()
                    })
                })
                .collect(),
        );
    }

    body
}

// ---------------------------------------------------------------------------
// Nova
// ---------------------------------------------------------------------------

/// Nova image format from a MIME type (`image/jpg` → `jpeg`).
fn nova_image_format(mime_type: &str) -> String {
    let subtype = mime_type
        .rsplit('/')
        .next()
        .unwrap_or(mime_type)
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match subtype.as_str() {
        "jpg" => "jpeg".to_string(),
        _ => subtype,
    }
}

fn nova_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"text": text}),
        ContentBlock::Image {
            mime_type, data, ..
        } => json!({
            "image": {
                "format": nova_image_format(mime_type),
                "source": {"bytes": data}
            }
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "toolUse": {
                "toolUseId": id,
                "name": name,
                "input": input
            }
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            output,
            is_error,
        } => {
            let content = if output.is_object() || output.is_array() {
                json!([{"json": output}])
            } else {
                json!([{"text": output_text(output)}])
            };
            json!({
                "toolResult": {
                    "toolUseId": tool_use_id,
                    "content": content,
                    "status": if *is_error { "error" } else { "success" }
                }
            })
        }
    }
}

/// Force `type: "object"` onto a tool schema.
fn object_schema(schema: Value) -> Value {
    match schema {
        Value::Object(mut obj) => {
            obj.insert("type".to_string(), Value::String("object".to_string()));
            obj.entry("properties")
                .or_insert_with(|| Value::Object(Map::new()));
            Value::Object(obj)
        }
        _ => json!({"type": "object", "properties": {}}),
    }
}

fn encode_nova(
    conversation: &Conversation,
    params: &InferenceParams,
    tools: &[ToolDefinition],
) -> Value {
    let mut system: Vec<Value> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in conversation.messages() {
        match msg.role() {
            Role::System => system.push(json!({"text": msg.joined_text()})),
            Role::User | Role::Tool | Role::Assistant => {
                let role = if msg.role() == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                };
                messages.push(json!({
                    "role": role,
                    "content": msg.content().iter().map(nova_block).collect::<Vec<_>>()
                }));
            }
        }
    }

    let mut body = json!({
        "schemaVersion": NOVA_SCHEMA_VERSION,
        "messages": messages,
        "inferenceConfig": {
            "max_new_tokens": params.max_tokens(),
            "temperature": params.temperature(),
            "top_p": params.top_p(),
            "top_k": params.top_k(),
        }
    });

    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }

    if !tools.is_empty() {
        let specs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpec": {
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": {"json": object_schema(tool.input_schema())}
                    }
                })
            })
            .collect();
        body["toolConfig"] = json!({"tools": specs});
    }

    body
}

// ---------------------------------------------------------------------------
// Titan / Llama (prompt families)
// ---------------------------------------------------------------------------

fn encode_titan(conversation: &Conversation, params: &InferenceParams) -> Value {
    let transcript = conversation
        .messages()
        .iter()
        .map(|msg| format!("{}: {}", msg.role().as_str(), flatten_text(msg)))
        .collect::<Vec<_>>()
        .join("\n");

    json!({
        "inputText": transcript,
        "textGenerationConfig": {
            "maxTokenCount": params.max_tokens(),
            "temperature": params.temperature(),
            "topP": params.top_p(),
            "stopSequences": []
        }
    })
}

fn llama_turn(prompt: &mut String, role: &str, text: &str) {
    prompt.push_str("<|start_header_id|>");
    prompt.push_str(role);
    prompt.push_str("<|end_header_id|>\n\n");
    prompt.push_str(text);
    prompt.push_str("<|eot_id|>");
}

fn encode_llama(conversation: &Conversation, params: &InferenceParams) -> Value {
    let mut prompt = String::from("<|begin_of_text|>");

    // System turns lead, regardless of where they appear in the conversation.
    for msg in conversation.messages().iter().filter(|m| m.role() == Role::System) {
        llama_turn(&mut prompt, "system", &flatten_text(msg));
    }
    for msg in conversation.messages().iter().filter(|m| m.role() != Role::System) {
        let role = if msg.role() == Role::Assistant {
            "assistant"
        } else {
            "user"
        };
        llama_turn(&mut prompt, role, &flatten_text(msg));
    }
    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");

    json!({
        "prompt": prompt,
        "max_gen_len": params.max_tokens().min(LLAMA_MAX_GEN_LEN),
        "temperature": params.temperature(),
        "top_p": params.top_p(),
    })
}

// ---------------------------------------------------------------------------
// Mistral
// ---------------------------------------------------------------------------

fn encode_mistral(
    conversation: &Conversation,
    params: &InferenceParams,
    tools: &[ToolDefinition],
) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    for msg in conversation.messages() {
        match msg.role() {
            Role::System | Role::User => {
                messages.push(json!({"role": msg.role().as_str(), "content": flatten_text(msg)}));
            }
            Role::Assistant => {
                let tool_calls: Vec<Value> = msg
                    .tool_uses()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()}
                        })
                    })
                    .collect();
                let mut entry = json!({"role": "assistant", "content": msg.joined_text()});
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(entry);
            }
            Role::Tool => {
                let mut any = false;
                for (tool_use_id, output, _) in msg.tool_results() {
                    any = true;
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": output_text(output)
                    }));
                }
                if !any {
                    messages.push(json!({"role": "user", "content": flatten_text(msg)}));
                }
            }
        }
    }

    let mut body = json!({
        "messages": messages,
        "max_tokens": params.max_tokens(),
        "temperature": params.temperature(),
        "top_p": params.top_p(),
    });

    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema()
                        }
                    })
                })
                .collect(),
        );
        body["tool_choice"] = json!("auto");
    }

    body
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn into_event(self) -> StreamEvent {
        let arguments_json = if self.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            self.arguments
        };
        StreamEvent::ToolCallDetected {
            id: self.id,
            name: self.name,
            arguments_json,
        }
    }
}

type Strategy = fn(&mut ResponseDecoder, &Value) -> Option<Vec<StreamEvent>>;

/// Shared strategies tried before the family-specific ones.
const COMMON_STRATEGIES: &[Strategy] = &[
    ResponseDecoder::provider_exception,
    ResponseDecoder::tool_result_envelope,
];

const CLAUDE_STRATEGIES: &[Strategy] = &[
    ResponseDecoder::claude_stream_event,
    ResponseDecoder::claude_message,
    ResponseDecoder::claude_completion,
];

const NOVA_STRATEGIES: &[Strategy] = &[
    ResponseDecoder::nova_stream_event,
    ResponseDecoder::nova_message,
];

const TITAN_STRATEGIES: &[Strategy] = &[
    ResponseDecoder::titan_results,
    ResponseDecoder::titan_chunk,
];

const LLAMA_STRATEGIES: &[Strategy] = &[ResponseDecoder::llama_generation];

/// Mistral models on Bedrock answer in three shapes; newer ones mirror Claude's content blocks.
const MISTRAL_STRATEGIES: &[Strategy] = &[
    ResponseDecoder::mistral_choices,
    ResponseDecoder::mistral_outputs,
    ResponseDecoder::claude_message,
];

/// Stateful decoder for one model response.
///
/// Streaming tool calls arrive as a start event, argument fragments and a
/// stop event; they are accumulated here and emitted once complete.
#[derive(Debug)]
pub struct ResponseDecoder {
    family: ModelFamily,
    pending: BTreeMap<u64, PendingToolCall>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl ResponseDecoder {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            pending: BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    fn strategies(&self) -> &'static [Strategy] {
        match self.family {
            ModelFamily::Claude => CLAUDE_STRATEGIES,
            ModelFamily::Nova => NOVA_STRATEGIES,
            ModelFamily::Titan => TITAN_STRATEGIES,
            ModelFamily::Llama => LLAMA_STRATEGIES,
            ModelFamily::Mistral => MISTRAL_STRATEGIES,
        }
    }

    /// Decode one payload (complete body or stream chunk).
    ///
    /// Returns `None` when no extraction strategy recognises the payload.
    pub fn decode(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        self.record_usage(payload);
        COMMON_STRATEGIES
            .iter()
            .chain(self.strategies().iter())
            .find_map(|strategy| strategy(self, payload))
    }

    /// Raw text recovered from an undecodable frame.
    pub fn decode_raw(&mut self, text: &str) -> Vec<StreamEvent> {
        if text.is_empty() {
            Vec::new()
        } else {
            vec![StreamEvent::text(text)]
        }
    }

    /// Flush tool calls whose stop event never arrived.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(PendingToolCall::into_event)
            .collect()
    }

    fn record_usage(&mut self, payload: &Value) {
        let sources = [
            payload.get("usage"),
            payload.pointer("/message/usage"),
            payload.pointer("/metadata/usage"),
            payload.get("amazon-bedrock-invocationMetrics"),
            Some(payload),
        ];
        for source in sources.into_iter().flatten() {
            let input = ["input_tokens", "inputTokens", "prompt_tokens", "inputTokenCount", "inputTextTokenCount", "prompt_token_count"]
                .iter()
                .find_map(|k| source.get(*k).and_then(Value::as_u64));
            let output = ["output_tokens", "outputTokens", "completion_tokens", "outputTokenCount", "generation_token_count"]
                .iter()
                .find_map(|k| source.get(*k).and_then(Value::as_u64));
            if let Some(n) = input {
                self.usage.input_tokens = n;
            }
            if let Some(n) = output {
                self.usage.output_tokens = n;
            }
        }
    }

    fn set_stop_reason(&mut self, reason: Option<&Value>) {
        if let Some(r) = reason.and_then(Value::as_str) {
            self.stop_reason = Some(r.to_string());
        }
    }

    fn flush_pending(&mut self, index: u64) -> Vec<StreamEvent> {
        self.pending
            .remove(&index)
            .map(|call| vec![call.into_event()])
            .unwrap_or_default()
    }

    // -- shared ------------------------------------------------------------

    /// `{"message": "...", "__type": "...Exception"}` or `{"type": "error", "error": {...}}`.
    fn provider_exception(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let obj = payload.as_object()?;
        if let Some(err) = obj.get("error").filter(|_| obj.get("type") == Some(&json!("error"))) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("model returned an error");
            return Some(vec![StreamEvent::Error {
                kind: "upstream".to_string(),
                message: message.to_string(),
            }]);
        }

        let message = obj.get("message").and_then(Value::as_str)?;
        let error_type = ["__type", "type", "Type"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str));
        let looks_like_exception = match error_type {
            Some(t) => t.to_ascii_lowercase().contains("exception"),
            None => obj.len() == 1,
        };
        looks_like_exception.then(|| {
            vec![StreamEvent::Error {
                kind: "upstream".to_string(),
                message: match error_type {
                    Some(t) => format!("{t}: {message}"),
                    None => message.to_string(),
                },
            }]
        })
    }

    /// `{"tool_result": {...}}` / `{"toolResult": {...}}` envelopes.
    fn tool_result_envelope(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let envelope = payload
            .get("tool_result")
            .or_else(|| payload.get("toolResult"))
            .filter(|v| v.is_object())?;
        let id = envelope
            .get("tool_use_id")
            .or_else(|| envelope.get("toolUseId"))
            .and_then(Value::as_str)?;
        let output = envelope
            .get("content")
            .or_else(|| envelope.get("output"))
            .cloned()
            .unwrap_or(Value::Null);
        Some(vec![StreamEvent::ToolResultReady {
            tool_call_id: id.to_string(),
            output,
        }])
    }

    // -- Claude ------------------------------------------------------------

    fn claude_stream_event(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let kind = payload.get("type").and_then(Value::as_str)?;
        let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
        match kind {
            "content_block_start" => {
                let block = payload.get("content_block")?;
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        self.pending.insert(
                            index,
                            PendingToolCall {
                                id: str_field(block, "id"),
                                name: str_field(block, "name"),
                                arguments: block
                                    .get("input")
                                    .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
                                    .map(Value::to_string)
                                    .unwrap_or_default(),
                            },
                        );
                        Some(Vec::new())
                    }
                    _ => Some(
                        block
                            .get("text")
                            .and_then(Value::as_str)
                            .filter(|t| !t.is_empty())
                            .map(|t| vec![StreamEvent::text(t)])
                            .unwrap_or_default(),
                    ),
                }
            }
            "content_block_delta" => {
                let delta = payload.get("delta")?;
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    return Some(vec![StreamEvent::text(text)]);
                }
                if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str) {
                    if let Some(call) = self.pending.get_mut(&index) {
                        call.arguments.push_str(fragment);
                    }
                }
                Some(Vec::new())
            }
            "content_block_stop" => Some(self.flush_pending(index)),
            "message_delta" => {
                self.set_stop_reason(payload.pointer("/delta/stop_reason"));
                Some(Vec::new())
            }
            "message_start" | "message_stop" | "ping" => Some(Vec::new()),
            _ => None,
        }
    }

    fn claude_message(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let content = payload.get("content").and_then(Value::as_array)?;
        self.set_stop_reason(payload.get("stop_reason"));
        let mut events = Vec::new();
        for item in content {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        events.push(StreamEvent::text(text));
                    }
                }
                Some("tool_use") => events.push(StreamEvent::ToolCallDetected {
                    id: str_field(item, "id"),
                    name: str_field(item, "name"),
                    arguments_json: item
                        .get("input")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                }),
                Some("tool_result") => events.push(StreamEvent::ToolResultReady {
                    tool_call_id: str_field(item, "tool_use_id"),
                    output: item.get("content").cloned().unwrap_or(Value::Null),
                }),
                _ => {}
            }
        }
        Some(events)
    }

    /// Legacy text-completions shape (`{"completion": "..."}`).
    fn claude_completion(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let text = payload.get("completion").and_then(Value::as_str)?;
        self.set_stop_reason(payload.get("stop_reason"));
        Some(vec![StreamEvent::text(text)])
    }

    // -- Nova --------------------------------------------------------------

    fn nova_stream_event(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        if let Some(start) = payload.get("contentBlockStart") {
            let index = start
                .get("contentBlockIndex")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if let Some(tool) = start.pointer("/start/toolUse") {
                self.pending.insert(
                    index,
                    PendingToolCall {
                        id: str_field(tool, "toolUseId"),
                        name: str_field(tool, "name"),
                        arguments: String::new(),
                    },
                );
            }
            return Some(Vec::new());
        }
        if let Some(delta) = payload.get("contentBlockDelta") {
            let index = delta
                .get("contentBlockIndex")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if let Some(text) = delta.pointer("/delta/text").and_then(Value::as_str) {
                return Some(vec![StreamEvent::text(text)]);
            }
            if let Some(input) = delta.pointer("/delta/toolUse/input") {
                if let Some(call) = self.pending.get_mut(&index) {
                    match input {
                        Value::String(fragment) => call.arguments.push_str(fragment),
                        other => call.arguments = other.to_string(),
                    }
                }
            }
            return Some(Vec::new());
        }
        if let Some(stop) = payload.get("contentBlockStop") {
            let index = stop
                .get("contentBlockIndex")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            return Some(self.flush_pending(index));
        }
        if let Some(stop) = payload.get("messageStop") {
            self.set_stop_reason(stop.get("stopReason"));
            return Some(Vec::new());
        }
        if payload.get("messageStart").is_some() || payload.get("metadata").is_some() {
            return Some(Vec::new());
        }
        None
    }

    fn nova_message(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let content = payload
            .pointer("/output/message/content")
            .and_then(Value::as_array)?;
        self.set_stop_reason(payload.get("stopReason"));
        let mut events = Vec::new();
        for item in content {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                events.push(StreamEvent::text(text));
            } else if let Some(tool) = item.get("toolUse") {
                events.push(StreamEvent::ToolCallDetected {
                    id: str_field(tool, "toolUseId"),
                    name: str_field(tool, "name"),
                    arguments_json: tool
                        .get("input")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                });
            } else if let Some(result) = item.get("toolResult") {
                events.push(StreamEvent::ToolResultReady {
                    tool_call_id: str_field(result, "toolUseId"),
                    output: result.get("content").cloned().unwrap_or(Value::Null),
                });
            }
        }
        Some(events)
    }

    // -- Titan -------------------------------------------------------------

    fn titan_results(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let first = payload.get("results").and_then(Value::as_array)?.first()?;
        self.set_stop_reason(first.get("completionReason"));
        let text = first.get("outputText").and_then(Value::as_str).unwrap_or("");
        Some(vec![StreamEvent::text(text)])
    }

    fn titan_chunk(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let text = payload.get("outputText").and_then(Value::as_str)?;
        self.set_stop_reason(payload.get("completionReason"));
        Some(vec![StreamEvent::text(text)])
    }

    // -- Llama -------------------------------------------------------------

    fn llama_generation(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let text = payload.get("generation").and_then(Value::as_str)?;
        self.set_stop_reason(payload.get("stop_reason"));
        Some(vec![StreamEvent::text(text)])
    }

    // -- Mistral -----------------------------------------------------------

    fn mistral_choices(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let choice = payload.get("choices").and_then(Value::as_array)?.first()?;
        self.set_stop_reason(
            choice
                .get("stop_reason")
                .or_else(|| choice.get("finish_reason")),
        );
        let message = choice.get("message").or_else(|| choice.get("delta"))?;

        let mut events = Vec::new();
        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(StreamEvent::text(text));
            }
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..9])
                    });
                let function = call.get("function").unwrap_or(&Value::Null);
                let arguments_json = match function.get("arguments") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "{}".to_string(),
                };
                events.push(StreamEvent::ToolCallDetected {
                    id,
                    name: str_field(function, "name"),
                    arguments_json,
                });
            }
        }
        Some(events)
    }

    fn mistral_outputs(&mut self, payload: &Value) -> Option<Vec<StreamEvent>> {
        let first = payload.get("outputs").and_then(Value::as_array)?.first()?;
        self.set_stop_reason(first.get("stop_reason"));
        let text = first.get("text").and_then(Value::as_str).unwrap_or("");
        Some(vec![StreamEvent::text(text)])
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decode a complete (non-streaming) response body.
pub fn decode(family: ModelFamily, response: &Value) -> Result<Vec<StreamEvent>> {
    let mut decoder = ResponseDecoder::new(family);
    let mut events = decoder.decode(response).ok_or_else(|| {
        GatewayError::Parse(format!(
            "unrecognised {} response: {}",
            family.as_str(),
            truncate(&response.to_string(), 200)
        ))
    })?;
    events.extend(decoder.finish());
    Ok(events)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
