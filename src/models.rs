//! Canonical conversation types shared by every model family.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{GatewayError, Result};

/// Stand-in text for turns that would otherwise be empty; several providers reject empty turns.
pub const PLACEHOLDER_TEXT: &str = ".";

/// AWS credentials used for request signing.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            region: region.into(),
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Reject blank key material before any request is signed.
    pub fn validate(&self) -> Result<()> {
        if self.access_key_id.trim().is_empty() {
            return Err(GatewayError::Config("AWS access key id is required".into()));
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "AWS secret access key is required".into(),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(GatewayError::Config("AWS region is required".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("region", &self.region)
            .finish()
    }
}

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One typed piece of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        #[serde(default = "default_image_encoding")]
        encoding: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
}

fn default_image_encoding() -> String {
    "base64".to_string()
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single conversation turn. Content is never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "MessageRepr")]
pub struct Message {
    role: Role,
    content: Vec<ContentBlock>,
}

/// Wire form accepted from callers: content may be a bare string or a block list.
#[derive(Deserialize)]
struct MessageRepr {
    role: Role,
    #[serde(default)]
    content: ContentRepr,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentRepr {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ContentRepr {
    fn default() -> Self {
        ContentRepr::Blocks(Vec::new())
    }
}

impl From<MessageRepr> for Message {
    fn from(repr: MessageRepr) -> Self {
        let content = match repr.content {
            ContentRepr::Text(text) => vec![ContentBlock::Text { text }],
            ContentRepr::Blocks(blocks) => blocks,
        };
        Message::new(repr.role, content)
    }
}

impl Message {
    /// Build a message, coercing empty text to [`PLACEHOLDER_TEXT`].
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        let mut content: Vec<ContentBlock> = content
            .into_iter()
            .map(|block| match block {
                ContentBlock::Text { text } if text.trim().is_empty() => {
                    ContentBlock::text(PLACEHOLDER_TEXT)
                }
                other => other,
            })
            .collect();
        if content.is_empty() {
            content.push(ContentBlock::text(PLACEHOLDER_TEXT));
        }
        Self { role, content }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::text(text)])
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &[ContentBlock] {
        &self.content
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Concatenated text blocks, newline separated.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &Value, bool)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => Some((tool_use_id.as_str(), output, *is_error)),
            _ => None,
        })
    }
}

/// Ordered, append-only sequence of messages owned by one in-flight turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

/// Canonical model-output event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        content: String,
    },
    ToolCallDetected {
        id: String,
        name: String,
        arguments_json: String,
    },
    ToolResultReady {
        tool_call_id: String,
        output: Value,
    },
    Error {
        kind: String,
        message: String,
    },
    Done,
}

impl StreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            content: content.into(),
        }
    }

    pub fn from_error(err: &GatewayError) -> Self {
        StreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Sampling parameters; unset values fall back to per-family defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_TOP_K: u32 = 250;

impl InferenceParams {
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn top_p(&self) -> f32 {
        self.top_p.unwrap_or(DEFAULT_TOP_P)
    }

    pub fn top_k(&self) -> u32 {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }
}

/// Caller-side cancellation flag, checked before every emitted event.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
