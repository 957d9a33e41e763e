//! Gateway orchestrator
//!
//! Drives one user turn through encode → send → decode, executing any tool
//! calls the model makes and re-invoking it with the results until it answers
//! in plain text. Each turn moves through [`TurnState`]s:
//!
//! ```text
//! Encoding → Sending → Decoding → ExecutingTool → Encoding ...
//!                               ↘ Completed
//! any state → Failed
//! ```
//!
//! Streaming turns are exposed as a lazy stream of [`StreamEvent`]s ending in
//! `Done` on success or a single `Error` on failure. Non-streaming turns
//! aggregate the same work into an [`InvokeResponse`].

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;

use crate::bedrock::{self, ModelFamily, ResponseDecoder, Usage};
use crate::client::BedrockClient;
use crate::error::{GatewayError, Result};
use crate::event_stream::Frame;
use crate::models::{
    CancelToken, ContentBlock, Conversation, InferenceParams, Message, Role, StreamEvent,
};
use crate::tool_catalog::{ToolCatalog, ToolDefinition};
use crate::tool_proxy::ToolExecutor;

pub const DEFAULT_MAX_TOOL_HOPS: usize = 8;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Encoding,
    Sending,
    Decoding,
    ExecutingTool,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSettings {
    /// Model → tool → model round trips allowed in one turn.
    pub max_tool_hops: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tool_hops: DEFAULT_MAX_TOOL_HOPS,
        }
    }
}

/// Per-call options: sampling parameters plus the catalog tools offered to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvokeOptions {
    #[serde(flatten)]
    pub params: InferenceParams,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// One executed tool call, as reported in an aggregated response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub output: Value,
    pub is_error: bool,
}

/// Result of a non-streaming turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeResponse {
    pub model: String,
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub hops: usize,
    pub usage: Usage,
    /// Final transcript, including tool turns, for caller-side persistence.
    pub conversation: Conversation,
}

pub enum Invocation {
    Stream(EventStream),
    Aggregated(InvokeResponse),
}

/// A tool call as detected in model output.
#[derive(Debug, Clone, PartialEq)]
struct PendingCall {
    id: String,
    name: String,
    arguments_json: String,
}

/// Everything fixed for the duration of one turn.
struct TurnContext {
    model_id: String,
    family: ModelFamily,
    params: InferenceParams,
    tools: Vec<ToolDefinition>,
}

fn log_state(model: &str, state: TurnState, hop: usize) {
    tracing::debug!(model, state = ?state, hop, "Turn state");
}

/// Assistant turn recording the model's tool calls, appended before any tool runs.
fn assistant_tool_turn(text: &str, calls: &[PendingCall]) -> Message {
    let mut content = Vec::with_capacity(calls.len() + 1);
    if !text.trim().is_empty() {
        content.push(ContentBlock::text(text));
    }
    for call in calls {
        let input = serde_json::from_str::<Value>(&call.arguments_json)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        content.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input,
        });
    }
    Message::new(Role::Assistant, content)
}

/// Run one tool call. Every failure is folded into an `{"error": ...}` result.
async fn execute_call(executor: &dyn ToolExecutor, call: &PendingCall) -> ToolCallRecord {
    let parsed = if call.arguments_json.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(&call.arguments_json).map_err(|e| {
            GatewayError::Validation(format!("arguments for {} are not valid JSON: {e}", call.name))
        })
    };

    let (arguments, result) = match parsed {
        Ok(arguments) => {
            let result = executor.execute(&call.name, &arguments).await;
            (arguments, result)
        }
        Err(err) => (Value::String(call.arguments_json.clone()), Err(err)),
    };

    let (output, is_error) = match result {
        Ok(outcome) => (outcome.into_value(), false),
        Err(err) => {
            if !err.is_tool_scoped() {
                tracing::warn!("Tool {} raised a non tool-scoped error: {}", call.name, err);
            }
            (json!({"error": err.to_string()}), true)
        }
    };

    ToolCallRecord {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments,
        output,
        is_error,
    }
}

fn tool_result_turn(records: &[ToolCallRecord]) -> Message {
    Message::new(
        Role::Tool,
        records
            .iter()
            .map(|r| ContentBlock::ToolResult {
                tool_use_id: r.id.clone(),
                output: r.output.clone(),
                is_error: r.is_error,
            })
            .collect(),
    )
}

fn pending_call(id: String, name: String, arguments_json: String) -> PendingCall {
    let id = if id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        id
    };
    PendingCall {
        id,
        name,
        arguments_json,
    }
}

/// Orchestrates model invocations and the tool loop.
#[derive(Clone)]
pub struct Gateway {
    client: BedrockClient,
    catalog: Arc<ToolCatalog>,
    executor: Arc<dyn ToolExecutor>,
    settings: TurnSettings,
}

impl Gateway {
    pub fn new(
        client: BedrockClient,
        catalog: Arc<ToolCatalog>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            client,
            catalog,
            executor,
            settings: TurnSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> TurnSettings {
        self.settings
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn client(&self) -> &BedrockClient {
        &self.client
    }

    fn context(&self, model_id: &str, options: InvokeOptions) -> Result<TurnContext> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(GatewayError::Config("model id is required".into()));
        }
        let family = ModelFamily::from_model_id(model_id)?;
        let tools = self.catalog.select(&options.tools)?;
        Ok(TurnContext {
            model_id: model_id.to_string(),
            family,
            params: options.params,
            tools,
        })
    }

    /// Single entry point: a lazy event stream, or an aggregated response.
    pub async fn invoke(
        &self,
        conversation: Conversation,
        model_id: &str,
        stream: bool,
        options: InvokeOptions,
        cancel: CancelToken,
    ) -> Result<Invocation> {
        if stream {
            Ok(Invocation::Stream(Box::pin(self.invoke_stream(
                conversation,
                model_id,
                options,
                cancel,
            ))))
        } else {
            self.invoke_aggregated(conversation, model_id, options, &cancel)
                .await
                .map(Invocation::Aggregated)
        }
    }

    /// Streaming turn. Nothing is sent until the stream is first polled;
    /// dropping the stream releases the HTTP connection.
    pub fn invoke_stream(
        &self,
        conversation: Conversation,
        model_id: &str,
        options: InvokeOptions,
        cancel: CancelToken,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let gateway = self.clone();
        let model_id = model_id.to_string();

        async_stream::stream! {
            let ctx = match gateway.context(&model_id, options) {
                Ok(ctx) => ctx,
                Err(err) => {
                    log_state(&model_id, TurnState::Failed, 0);
                    tracing::error!("Turn for {} failed: {}", model_id, err);
                    yield StreamEvent::from_error(&err);
                    return;
                }
            };
            let mut conversation = conversation;
            let mut hops = 0usize;

            loop {
                log_state(&ctx.model_id, TurnState::Encoding, hops);
                let body = match bedrock::encode(&conversation, ctx.family, &ctx.params, &ctx.tools) {
                    Ok(body) => body,
                    Err(err) => {
                        log_state(&ctx.model_id, TurnState::Failed, hops);
                        yield StreamEvent::from_error(&err);
                        return;
                    }
                };

                log_state(&ctx.model_id, TurnState::Sending, hops);
                let mut frames = match gateway.client.invoke_stream(&ctx.model_id, &body, &cancel).await {
                    Ok(frames) => frames,
                    Err(GatewayError::Cancelled) => return,
                    Err(err) => {
                        log_state(&ctx.model_id, TurnState::Failed, hops);
                        tracing::error!("Bedrock invoke for {} failed: {}", ctx.model_id, err);
                        yield StreamEvent::from_error(&err);
                        return;
                    }
                };

                log_state(&ctx.model_id, TurnState::Decoding, hops);
                let mut decoder = ResponseDecoder::new(ctx.family);
                let mut text = String::new();
                let mut calls: Vec<PendingCall> = Vec::new();
                let mut finished = false;

                while !finished {
                    let item = frames.next().await;
                    let events = match item {
                        Some(Ok(Frame::Payload(payload))) => decoder.decode(&payload).unwrap_or_else(|| {
                            tracing::debug!("Skipping unrecognised {} chunk", ctx.family.as_str());
                            Vec::new()
                        }),
                        Some(Ok(Frame::Raw(raw))) => decoder.decode_raw(&raw),
                        Some(Ok(Frame::Exception { kind, message })) => vec![StreamEvent::Error {
                            kind: "upstream".to_string(),
                            message: format!("{kind}: {message}"),
                        }],
                        Some(Err(err)) => vec![StreamEvent::from_error(&err)],
                        None => {
                            finished = true;
                            decoder.finish()
                        }
                    };

                    for event in events {
                        if cancel.is_cancelled() {
                            tracing::debug!("Caller cancelled turn for {}", ctx.model_id);
                            return;
                        }
                        match event {
                            StreamEvent::TextDelta { ref content } => {
                                text.push_str(content);
                                yield event;
                            }
                            StreamEvent::ToolCallDetected { id, name, arguments_json } => {
                                let call = pending_call(id, name, arguments_json);
                                yield StreamEvent::ToolCallDetected {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                    arguments_json: call.arguments_json.clone(),
                                };
                                calls.push(call);
                            }
                            StreamEvent::ToolResultReady { .. } => {
                                yield event;
                            }
                            StreamEvent::Error { .. } => {
                                log_state(&ctx.model_id, TurnState::Failed, hops);
                                yield event;
                                return;
                            }
                            StreamEvent::Done => {}
                        }
                    }
                }

                if calls.is_empty() {
                    log_state(&ctx.model_id, TurnState::Completed, hops);
                    if cancel.is_cancelled() {
                        return;
                    }
                    yield StreamEvent::Done;
                    return;
                }

                if hops >= gateway.settings.max_tool_hops {
                    let err = GatewayError::ToolLimit(gateway.settings.max_tool_hops);
                    log_state(&ctx.model_id, TurnState::Failed, hops);
                    yield StreamEvent::from_error(&err);
                    return;
                }
                hops += 1;

                log_state(&ctx.model_id, TurnState::ExecutingTool, hops);
                conversation.push(assistant_tool_turn(&text, &calls));
                let mut records = Vec::with_capacity(calls.len());
                for call in &calls {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let record = execute_call(gateway.executor.as_ref(), call).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    yield StreamEvent::ToolResultReady {
                        tool_call_id: record.id.clone(),
                        output: record.output.clone(),
                    };
                    records.push(record);
                }
                conversation.push(tool_result_turn(&records));
            }
        }
    }

    /// Non-streaming turn: runs the whole tool loop and returns the aggregate.
    pub async fn invoke_aggregated(
        &self,
        conversation: Conversation,
        model_id: &str,
        options: InvokeOptions,
        cancel: &CancelToken,
    ) -> Result<InvokeResponse> {
        let ctx = self.context(model_id, options)?;
        let mut conversation = conversation;
        let mut hops = 0usize;
        let mut segments: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut usage = Usage::default();

        let result: Result<()> = async {
            loop {
                log_state(&ctx.model_id, TurnState::Encoding, hops);
                let body = bedrock::encode(&conversation, ctx.family, &ctx.params, &ctx.tools)?;

                log_state(&ctx.model_id, TurnState::Sending, hops);
                let response = self.client.invoke(&ctx.model_id, &body, cancel).await?;

                log_state(&ctx.model_id, TurnState::Decoding, hops);
                let mut decoder = ResponseDecoder::new(ctx.family);
                let mut events = decoder.decode(&response).ok_or_else(|| {
                    GatewayError::Parse(format!(
                        "unrecognised {} response body",
                        ctx.family.as_str()
                    ))
                })?;
                events.extend(decoder.finish());
                let hop_usage = decoder.usage();
                usage.input_tokens += hop_usage.input_tokens;
                usage.output_tokens += hop_usage.output_tokens;

                let mut text = String::new();
                let mut calls = Vec::new();
                for event in events {
                    match event {
                        StreamEvent::TextDelta { content } => text.push_str(&content),
                        StreamEvent::ToolCallDetected {
                            id,
                            name,
                            arguments_json,
                        } => calls.push(pending_call(id, name, arguments_json)),
                        StreamEvent::Error { message, .. } => {
                            return Err(GatewayError::Parse(format!(
                                "model reported an error: {message}"
                            )))
                        }
                        StreamEvent::ToolResultReady { .. } | StreamEvent::Done => {}
                    }
                }
                if !text.trim().is_empty() {
                    segments.push(text.clone());
                }

                if calls.is_empty() {
                    conversation.push(Message::assistant(text));
                    log_state(&ctx.model_id, TurnState::Completed, hops);
                    return Ok(());
                }
                if hops >= self.settings.max_tool_hops {
                    return Err(GatewayError::ToolLimit(self.settings.max_tool_hops));
                }
                hops += 1;

                log_state(&ctx.model_id, TurnState::ExecutingTool, hops);
                conversation.push(assistant_tool_turn(&text, &calls));
                let mut records = Vec::with_capacity(calls.len());
                for call in &calls {
                    if cancel.is_cancelled() {
                        return Err(GatewayError::Cancelled);
                    }
                    records.push(execute_call(self.executor.as_ref(), call).await);
                }
                conversation.push(tool_result_turn(&records));
                tool_calls.extend(records);
            }
        }
        .await;

        if let Err(err) = result {
            log_state(&ctx.model_id, TurnState::Failed, hops);
            tracing::error!("Turn for {} failed: {}", ctx.model_id, err);
            return Err(err);
        }

        Ok(InvokeResponse {
            model: ctx.model_id,
            text: segments.join("\n\n"),
            tool_calls,
            hops,
            usage,
            conversation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_proxy::ToolOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(&self, name: &str, arguments: &Value) -> Result<ToolOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            match name {
                "search" => Ok(ToolOutcome::Completed(json!({"hits": 3}))),
                "slow_job" => Ok(ToolOutcome::Accepted(Value::Null)),
                _ => Err(GatewayError::Validation(format!("unknown tool: {name}"))),
            }
        }
    }

    fn call(id: &str, name: &str, args: &str) -> PendingCall {
        pending_call(id.into(), name.into(), args.into())
    }

    #[test]
    fn test_assistant_turn_carries_tool_uses() {
        let msg = assistant_tool_turn("", &[call("t1", "search", r#"{"q":"rust"}"#)]);
        assert_eq!(msg.role(), Role::Assistant);
        let uses: Vec<_> = msg.tool_uses().collect();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[0].2, &json!({"q": "rust"}));
        assert!(msg.content().iter().all(|b| b.as_text().is_none()));

        let msg = assistant_tool_turn("Looking.", &[call("t2", "search", "not json")]);
        assert_eq!(msg.content()[0], ContentBlock::text("Looking."));
        assert_eq!(msg.tool_uses().next().unwrap().2, &json!({}));
    }

    #[test]
    fn test_missing_call_id_is_generated() {
        let c = call("", "search", "{}");
        assert!(c.id.starts_with("call_"));
    }

    #[tokio::test]
    async fn test_execute_call_outcomes() {
        let executor = RecordingExecutor::default();

        let ok = execute_call(&executor, &call("t1", "search", r#"{"q":"x"}"#)).await;
        assert!(!ok.is_error);
        assert_eq!(ok.output, json!({"hits": 3}));

        let accepted = execute_call(&executor, &call("t2", "slow_job", "")).await;
        assert!(!accepted.is_error);
        assert_eq!(accepted.output["status"], "accepted");

        let unknown = execute_call(&executor, &call("t3", "nope", "{}")).await;
        assert!(unknown.is_error);
        assert!(unknown.output["error"].as_str().unwrap().contains("unknown tool"));

        let bad_args = execute_call(&executor, &call("t4", "search", "{oops")).await;
        assert!(bad_args.is_error);
        assert_eq!(executor.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_tool_result_turn() {
        let records = vec![
            ToolCallRecord {
                id: "a".into(),
                name: "search".into(),
                arguments: json!({}),
                output: json!({"hits": 1}),
                is_error: false,
            },
            ToolCallRecord {
                id: "b".into(),
                name: "search".into(),
                arguments: json!({}),
                output: json!({"error": "boom"}),
                is_error: true,
            },
        ];
        let msg = tool_result_turn(&records);
        assert_eq!(msg.role(), Role::Tool);
        let results: Vec<_> = msg.tool_results().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1], ("b", &json!({"error": "boom"}), true));
    }

    #[test]
    fn test_invoke_options_flatten_params() {
        let options: InvokeOptions = serde_json::from_value(json!({
            "temperature": 0.1,
            "max_tokens": 64,
            "tools": ["search"]
        }))
        .unwrap();
        assert_eq!(options.params.max_tokens, Some(64));
        assert_eq!(options.tools, vec!["search".to_string()]);
    }
}
