#![forbid(unsafe_code)]
#![doc = r#"
Bedrock Gateway

Sign, translate and stream Amazon Bedrock model invocations, and drive the
tool-call round trip until the model answers in plain text.

Crate highlights
- Signing: SigV4 request signing implemented directly over `hmac`/`sha2` (`signer`).
- Schemas: one canonical conversation encoded for Claude, Nova, Titan, Llama and Mistral models (`bedrock`).
- Streaming: AWS event-stream frames and line-delimited JSON decoded into `StreamEvent`s (`event_stream`).
- Orchestration: encode → send → decode → tool → re-invoke loop with a hop limit (`gateway`).
- HTTP server (in `server`): `/v1/chat` (SSE or JSON), `/v1/tools/{name}`, `/v1/images`, `/status`.

Modules
- `models`: Conversation, content blocks and stream events.
- `signer` / `endpoint` / `client`: signed HTTP calls to Bedrock Runtime with retry.
- `bedrock`: per-family request encoding and response decoding.
- `event_stream`: frame decoding for streaming responses.
- `gateway`: the turn state machine.
- `tool_catalog` / `tool_proxy`: declarative HTTP tools.
- `image`: image model request shaping.
- `config` / `util` / `server`: environment, tracing and the actix front-end.
"#]

pub mod bedrock;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event_stream;
pub mod gateway;
pub mod image;
pub mod models;
pub mod server;
pub mod signer;
pub mod tool_catalog;
pub mod tool_proxy;
pub mod util;

pub use crate::bedrock::{ModelFamily, ResponseDecoder, Usage};
pub use crate::client::{BedrockClient, RetryPolicy};
pub use crate::config::GatewayConfig;
pub use crate::endpoint::EndpointResolver;
pub use crate::error::{GatewayError, Result};
pub use crate::gateway::{
    Gateway, Invocation, InvokeOptions, InvokeResponse, ToolCallRecord, TurnSettings, TurnState,
};
pub use crate::models::{
    CancelToken, ContentBlock, Conversation, Credentials, InferenceParams, Message, Role,
    StreamEvent,
};
pub use crate::tool_catalog::{ToolCatalog, ToolDefinition};
pub use crate::tool_proxy::{ToolExecutor, ToolOutcome, ToolProxy};
