use actix_web::{test, web, App};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use bedrock_gateway::client::{BedrockClient, RetryPolicy};
use bedrock_gateway::endpoint::EndpointResolver;
use bedrock_gateway::gateway::{Gateway, InvokeOptions, TurnSettings};
use bedrock_gateway::models::{CancelToken, Conversation, Credentials, Message, StreamEvent};
use bedrock_gateway::server::{config_routes, AppState};
use bedrock_gateway::tool_catalog::{ToolCatalog, ToolDefinition};
use bedrock_gateway::tool_proxy::ToolProxy;
use bedrock_gateway::GatewayError;

const CLAUDE: &str = "anthropic.claude-3-haiku-20240307-v1:0";

#[derive(Clone)]
enum Reply {
    Json(u16, Value),
    EventStream(Vec<u8>),
    /// Holds the connection open before answering 200.
    Stall(Duration, Value),
}

#[derive(Debug, Clone)]
struct RecordedInvoke {
    model: String,
    action: String,
    authorization: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct BedrockState {
    requests: Arc<AsyncMutex<Vec<RecordedInvoke>>>,
    replies: Arc<AsyncMutex<VecDeque<Reply>>>,
}

async fn handle_invoke(
    State(state): State<BedrockState>,
    Path((model, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.lock().await.push(RecordedInvoke {
        model,
        action,
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });

    // The last scripted reply repeats.
    let reply = {
        let mut replies = state.replies.lock().await;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    };
    match reply {
        Some(Reply::Json(status, body)) => (
            StatusCode::from_u16(status).unwrap(),
            Json(body),
        )
            .into_response(),
        Some(Reply::Stall(delay, body)) => {
            tokio::time::sleep(delay).await;
            (StatusCode::OK, Json(body)).into_response()
        }
        Some(Reply::EventStream(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/vnd.amazon.eventstream")],
            bytes,
        )
            .into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

struct MockBedrock {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<RecordedInvoke>>>,
    join: JoinHandle<()>,
}

impl MockBedrock {
    async fn start(replies: Vec<Reply>) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = BedrockState {
            requests: requests.clone(),
            replies: Arc::new(AsyncMutex::new(replies.into())),
        };

        let app = Router::new()
            .route("/model/:model/:action", post(handle_invoke))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock bedrock");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("mock bedrock server error");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    async fn requests(&self) -> Vec<RecordedInvoke> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockBedrock {
    fn drop(&mut self) {
        self.join.abort();
    }
}

async fn handle_search(
    State(queries): State<Arc<AsyncMutex<Vec<HashMap<String, String>>>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let q = params.get("q").cloned().unwrap_or_default();
    queries.lock().await.push(params);
    Json(json!({ "results": [format!("{q} docs")] }))
}

async fn handle_slow_search(
    State(queries): State<Arc<AsyncMutex<Vec<HashMap<String, String>>>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    queries.lock().await.push(params);
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({ "results": [] }))
}

struct MockSearch {
    base_url: String,
    queries: Arc<AsyncMutex<Vec<HashMap<String, String>>>>,
    join: JoinHandle<()>,
}

impl MockSearch {
    async fn start() -> Self {
        let queries = Arc::new(AsyncMutex::new(Vec::new()));
        let app = Router::new()
            .route("/search", get(handle_search))
            .route("/slow-search", get(handle_slow_search))
            .with_state(queries.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock search");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("mock search server error");
        });
        Self {
            base_url: format!("http://{}", addr),
            queries,
            join,
        }
    }
}

impl Drop for MockSearch {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn search_catalog(base_url: &str) -> ToolCatalog {
    search_catalog_at(base_url, "/search")
}

fn search_catalog_at(base_url: &str, path: &str) -> ToolCatalog {
    let tool: ToolDefinition = serde_json::from_value(json!({
        "name": "search",
        "description": "Search the documentation index",
        "invocation": {
            "base_url": base_url,
            "path": path,
            "operations": {
                "get": {
                    "parameters": [
                        {"name": "q", "in": "query", "required": true, "description": "Query text"}
                    ]
                }
            }
        }
    }))
    .expect("tool definition");
    ToolCatalog::new(vec![tool]).expect("catalog")
}

fn build_gateway(
    bedrock_url: &str,
    catalog: ToolCatalog,
    max_tool_hops: usize,
    retry: RetryPolicy,
) -> (Gateway, ToolProxy) {
    build_gateway_with_timeout(
        bedrock_url,
        catalog,
        max_tool_hops,
        retry,
        Duration::from_secs(5),
    )
}

/// Applies `timeout` to both the Bedrock client and the tool proxy.
fn build_gateway_with_timeout(
    bedrock_url: &str,
    catalog: ToolCatalog,
    max_tool_hops: usize,
    retry: RetryPolicy,
    timeout: Duration,
) -> (Gateway, ToolProxy) {
    let client = BedrockClient::new(
        reqwest::Client::new(),
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", "us-east-1"),
        EndpointResolver::new("us-east-1").with_base_url(bedrock_url),
    )
    .expect("client")
    .with_retry_policy(retry)
    .with_timeout(timeout);
    let catalog = Arc::new(catalog);
    let proxy = ToolProxy::new(reqwest::Client::new(), catalog.clone()).with_timeout(timeout);
    let gateway = Gateway::new(client, catalog, Arc::new(proxy.clone()))
        .with_settings(TurnSettings { max_tool_hops });
    (gateway, proxy)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(5),
    }
}

fn claude_text(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 12, "output_tokens": 7}
    })
}

fn claude_tool_use(query: &str) -> Value {
    json!({
        "id": "msg_0",
        "type": "message",
        "role": "assistant",
        "content": [
            {"type": "text", "text": "Let me look that up."},
            {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": query}}
        ],
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 20, "output_tokens": 9}
    })
}

fn string_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(7);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// One `chunk` event-stream frame wrapping `inner` as base64 `bytes`.
fn chunk_frame(inner: &Value) -> Vec<u8> {
    let payload = json!({ "bytes": BASE64.encode(inner.to_string()) }).to_string();
    let mut headers = Vec::new();
    string_header(&mut headers, ":event-type", "chunk");
    string_header(&mut headers, ":content-type", "application/json");
    string_header(&mut headers, ":message-type", "event");

    let total_len = 12 + headers.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&frame[0..8]);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&headers);
    frame.extend_from_slice(payload.as_bytes());
    let message_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}

fn event_stream(events: &[Value]) -> Vec<u8> {
    events.iter().flat_map(chunk_frame).collect()
}

fn streamed_text(parts: &[&str]) -> Vec<u8> {
    let mut events = vec![json!({"type": "message_start", "message": {"usage": {"input_tokens": 8}}})];
    events.push(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}));
    for part in parts {
        events.push(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": part}
        }));
    }
    events.push(json!({"type": "content_block_stop", "index": 0}));
    events.push(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 4}}));
    events.push(json!({"type": "message_stop"}));
    event_stream(&events)
}

fn streamed_tool_use() -> Vec<u8> {
    event_stream(&[
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 15}}}),
        json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {}}
        }),
        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}
        }),
        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "\"rust\"}"}
        }),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        json!({"type": "message_stop"}),
    ])
}

fn weather_question() -> Conversation {
    Conversation::from(vec![Message::user("What's the weather?")])
}

#[tokio::test]
async fn weather_question_completes_without_tool_round_trip() {
    let bedrock = MockBedrock::start(vec![Reply::Json(
        200,
        claude_text("I don't have weather access."),
    )])
    .await;
    let (gateway, _) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let response = gateway
        .invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        )
        .await
        .expect("turn completes");

    assert_eq!(response.text, "I don't have weather access.");
    assert!(response.tool_calls.is_empty());
    assert_eq!(response.hops, 0);
    assert_eq!(response.usage.input_tokens, 12);
    assert_eq!(response.usage.output_tokens, 7);

    let requests = bedrock.requests().await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.model, CLAUDE);
    assert_eq!(request.action, "invoke");
    let messages = request.body["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(request.body["anthropic_version"], "bedrock-2023-05-31");
    assert!(request.body.get("tools").is_none());

    let auth = request.authorization.as_deref().expect("authorization header");
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(auth.contains("/us-east-1/bedrock/aws4_request"));
    assert!(auth.contains("x-amz-content-sha256"));
}

#[tokio::test]
async fn search_tool_round_trip_reinvokes_the_model() {
    let search = MockSearch::start().await;
    let bedrock = MockBedrock::start(vec![
        Reply::Json(200, claude_tool_use("rust")),
        Reply::Json(200, claude_text("Rust has great docs.")),
    ])
    .await;
    let (gateway, _) = build_gateway(
        &bedrock.base_url,
        search_catalog(&search.base_url),
        8,
        fast_retry(),
    );

    let options = InvokeOptions {
        tools: vec!["search".to_string()],
        ..Default::default()
    };
    let response = gateway
        .invoke_aggregated(
            Conversation::from(vec![Message::user("Find docs about rust")]),
            CLAUDE,
            options,
            &CancelToken::new(),
        )
        .await
        .expect("turn completes");

    assert_eq!(response.hops, 1);
    assert_eq!(response.text, "Let me look that up.\n\nRust has great docs.");
    assert_eq!(response.tool_calls.len(), 1);
    let call = &response.tool_calls[0];
    assert_eq!(call.id, "toolu_1");
    assert_eq!(call.name, "search");
    assert!(!call.is_error);
    assert_eq!(call.output, json!({"results": ["rust docs"]}));
    assert_eq!(response.usage.input_tokens, 32);

    let queries = search.queries.lock().await.clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].get("q").map(String::as_str), Some("rust"));

    let requests = bedrock.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body["tools"][0]["name"], "search");
    assert_eq!(
        requests[0].body["tools"][0]["input_schema"]["required"],
        json!(["q"])
    );

    let second = requests[1].body["messages"].as_array().expect("messages");
    assert_eq!(second.len(), 3);
    assert_eq!(second[1]["role"], "assistant");
    assert_eq!(second[1]["content"][1]["type"], "tool_use");
    assert_eq!(second[2]["role"], "user");
    assert_eq!(second[2]["content"][0]["type"], "tool_result");
    assert_eq!(second[2]["content"][0]["tool_use_id"], "toolu_1");

    // user, assistant tool turn, tool results, final answer
    assert_eq!(response.conversation.len(), 4);
}

#[tokio::test]
async fn failing_tool_is_reported_back_to_the_model() {
    let bedrock = MockBedrock::start(vec![
        Reply::Json(200, claude_tool_use("rust")),
        Reply::Json(200, claude_text("The search service is down.")),
    ])
    .await;
    // Nothing listens on port 9.
    let (gateway, _) = build_gateway(
        &bedrock.base_url,
        search_catalog("http://127.0.0.1:9"),
        8,
        fast_retry(),
    );

    let response = gateway
        .invoke_aggregated(
            Conversation::from(vec![Message::user("Find docs about rust")]),
            CLAUDE,
            InvokeOptions {
                tools: vec!["search".to_string()],
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .await
        .expect("tool failure does not abort the turn");

    assert_eq!(response.tool_calls.len(), 1);
    assert!(response.tool_calls[0].is_error);
    assert!(response.tool_calls[0].output.get("error").is_some());

    let requests = bedrock.requests().await;
    assert_eq!(requests.len(), 2);
    let tool_turn = &requests[1].body["messages"][2]["content"][0];
    assert_eq!(tool_turn["type"], "tool_result");
    assert_eq!(tool_turn["is_error"], true);
}

#[tokio::test]
async fn throttled_requests_are_retried_until_success() {
    let throttled = Reply::Json(
        429,
        json!({"message": "Too many requests, please wait before trying again."}),
    );
    let bedrock = MockBedrock::start(vec![
        throttled.clone(),
        throttled.clone(),
        throttled,
        Reply::Json(200, claude_text("Finally.")),
    ])
    .await;
    let (gateway, _) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let response = gateway
        .invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        )
        .await
        .expect("turn completes after retries");

    assert_eq!(response.text, "Finally.");
    // One initial attempt plus three retries.
    assert_eq!(bedrock.requests().await.len(), 4);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_error() {
    let bedrock = MockBedrock::start(vec![Reply::Json(
        429,
        json!({"message": "Too many requests"}),
    )])
    .await;
    let (gateway, _) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let err = gateway
        .invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Http { status: 429, .. }));
    assert_eq!(bedrock.requests().await.len(), 4);
}

#[tokio::test]
async fn client_errors_other_than_throttling_are_not_retried() {
    let bedrock = MockBedrock::start(vec![Reply::Json(
        403,
        json!({"message": "The request signature we calculated does not match"}),
    )])
    .await;
    let (gateway, _) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let err = gateway
        .invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Http { status: 403, .. }));
    assert_eq!(bedrock.requests().await.len(), 1);
}

#[tokio::test]
async fn stalled_invoke_times_out_and_is_retried() {
    let bedrock = MockBedrock::start(vec![
        Reply::Stall(Duration::from_secs(3), claude_text("too late")),
        Reply::Json(200, claude_text("Second try.")),
    ])
    .await;
    let (gateway, _) = build_gateway_with_timeout(
        &bedrock.base_url,
        ToolCatalog::empty(),
        8,
        fast_retry(),
        Duration::from_millis(300),
    );

    let response = gateway
        .invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        )
        .await
        .expect("turn completes after the timed-out attempt");

    assert_eq!(response.text, "Second try.");
    assert_eq!(bedrock.requests().await.len(), 2);
}

#[tokio::test]
async fn stalled_invoke_surfaces_timeout_once_retries_run_out() {
    let bedrock = MockBedrock::start(vec![Reply::Stall(
        Duration::from_secs(3),
        claude_text("too late"),
    )])
    .await;
    let (gateway, _) = build_gateway_with_timeout(
        &bedrock.base_url,
        ToolCatalog::empty(),
        8,
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
        },
        Duration::from_millis(300),
    );

    let err = gateway
        .invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Timeout(_)), "{err:?}");
    assert_eq!(bedrock.requests().await.len(), 2);
}

#[tokio::test]
async fn stalled_error_body_does_not_outlive_the_timeout() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Sends the status line and headers, then never finishes the body.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"message\":")
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let (gateway, _) = build_gateway_with_timeout(
        &format!("http://{}", addr),
        ToolCatalog::empty(),
        8,
        fast_retry(),
        Duration::from_millis(300),
    );

    let err = tokio::time::timeout(
        Duration::from_secs(3),
        gateway.invoke_aggregated(
            weather_question(),
            CLAUDE,
            InvokeOptions::default(),
            &CancelToken::new(),
        ),
    )
    .await
    .expect("error body read is bounded by the client timeout")
    .unwrap_err();

    match err {
        GatewayError::Http { status, body } => {
            assert_eq!(status, 400);
            assert!(body.is_empty());
        }
        other => panic!("expected http error, got {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn stalled_tool_becomes_an_error_result() {
    let search = MockSearch::start().await;
    let bedrock = MockBedrock::start(vec![
        Reply::Json(200, claude_tool_use("rust")),
        Reply::Json(200, claude_text("The search timed out.")),
    ])
    .await;
    let (gateway, _) = build_gateway_with_timeout(
        &bedrock.base_url,
        search_catalog_at(&search.base_url, "/slow-search"),
        8,
        fast_retry(),
        Duration::from_millis(300),
    );

    let response = gateway
        .invoke_aggregated(
            Conversation::from(vec![Message::user("Find docs about rust")]),
            CLAUDE,
            InvokeOptions {
                tools: vec!["search".to_string()],
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .await
        .expect("tool timeout does not abort the turn");

    assert_eq!(response.text, "Let me look that up.\n\nThe search timed out.");
    assert_eq!(response.tool_calls.len(), 1);
    let call = &response.tool_calls[0];
    assert!(call.is_error);
    let message = call.output["error"].as_str().expect("error message");
    assert!(message.contains("timed out"), "{message}");
    assert_eq!(search.queries.lock().await.len(), 1);

    let requests = bedrock.requests().await;
    assert_eq!(requests.len(), 2);
    let tool_turn = &requests[1].body["messages"][2]["content"][0];
    assert_eq!(tool_turn["type"], "tool_result");
    assert_eq!(tool_turn["is_error"], true);
}

#[tokio::test]
async fn tool_loop_stops_at_the_hop_limit() {
    let bedrock = MockBedrock::start(vec![Reply::Json(200, claude_tool_use("again"))]).await;
    let search = MockSearch::start().await;
    let (gateway, _) = build_gateway(
        &bedrock.base_url,
        search_catalog(&search.base_url),
        2,
        fast_retry(),
    );

    let err = gateway
        .invoke_aggregated(
            Conversation::from(vec![Message::user("loop forever")]),
            CLAUDE,
            InvokeOptions {
                tools: vec!["search".to_string()],
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::ToolLimit(2)));
    assert_eq!(bedrock.requests().await.len(), 3);
    assert_eq!(search.queries.lock().await.len(), 2);
}

#[tokio::test]
async fn streaming_turn_emits_ordered_events_across_a_tool_call() {
    let search = MockSearch::start().await;
    let bedrock = MockBedrock::start(vec![
        Reply::EventStream(streamed_tool_use()),
        Reply::EventStream(streamed_text(&["Rust ", "is fast."])),
    ])
    .await;
    let (gateway, _) = build_gateway(
        &bedrock.base_url,
        search_catalog(&search.base_url),
        8,
        fast_retry(),
    );

    let events: Vec<StreamEvent> = gateway
        .invoke_stream(
            Conversation::from(vec![Message::user("Is rust fast?")]),
            CLAUDE,
            InvokeOptions {
                tools: vec!["search".to_string()],
                ..Default::default()
            },
            CancelToken::new(),
        )
        .collect()
        .await;

    assert_eq!(events.len(), 5, "{events:?}");
    match &events[0] {
        StreamEvent::ToolCallDetected {
            id,
            name,
            arguments_json,
        } => {
            assert_eq!(id, "toolu_1");
            assert_eq!(name, "search");
            let args: Value = serde_json::from_str(arguments_json).unwrap();
            assert_eq!(args, json!({"q": "rust"}));
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    assert_eq!(
        events[1],
        StreamEvent::ToolResultReady {
            tool_call_id: "toolu_1".into(),
            output: json!({"results": ["rust docs"]}),
        }
    );
    assert_eq!(events[2], StreamEvent::text("Rust "));
    assert_eq!(events[3], StreamEvent::text("is fast."));
    assert_eq!(events[4], StreamEvent::Done);

    let requests = bedrock.requests().await;
    assert_eq!(requests.len(), 2);
    assert!(requests
        .iter()
        .all(|r| r.action == "invoke-with-response-stream"));
}

#[tokio::test]
async fn cancelled_stream_stops_before_sending() {
    let bedrock = MockBedrock::start(vec![Reply::EventStream(streamed_text(&["never"]))]).await;
    let (gateway, _) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let cancel = CancelToken::new();
    cancel.cancel();
    let events: Vec<StreamEvent> = gateway
        .invoke_stream(weather_question(), CLAUDE, InvokeOptions::default(), cancel)
        .collect()
        .await;

    assert!(events.is_empty());
    assert!(bedrock.requests().await.is_empty());
}

#[tokio::test]
async fn cancelling_mid_stream_stops_further_events() {
    let bedrock =
        MockBedrock::start(vec![Reply::EventStream(streamed_text(&["a", "b", "c"]))]).await;
    let (gateway, _) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let cancel = CancelToken::new();
    let mut events = Box::pin(gateway.invoke_stream(
        weather_question(),
        CLAUDE,
        InvokeOptions::default(),
        cancel.clone(),
    ));

    let first = events.next().await;
    assert_eq!(first, Some(StreamEvent::text("a")));

    cancel.cancel();
    let rest: Vec<StreamEvent> = events.collect().await;
    assert!(rest.is_empty(), "{rest:?}");
    assert_eq!(bedrock.requests().await.len(), 1);
}

#[actix_web::test]
async fn chat_endpoint_streams_sse_frames() {
    let bedrock = MockBedrock::start(vec![Reply::EventStream(streamed_text(&["Hel", "lo"]))]).await;
    let (gateway, proxy) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(AppState { gateway, proxy }))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat")
        .set_json(json!({
            "model": CLAUDE,
            "stream": true,
            "temperature": 0.2,
            "messages": [{"role": "user", "content": "Say hello"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = test::read_body(resp).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(
        text,
        "data: {\"text\":\"Hel\"}\n\ndata: {\"text\":\"lo\"}\n\ndata: {\"done\":true}\n\n"
    );

    let requests = bedrock.requests().await;
    assert_eq!(requests.len(), 1);
    let temperature = requests[0].body["temperature"].as_f64().unwrap();
    assert!((temperature - 0.2).abs() < 1e-6);
}

#[actix_web::test]
async fn chat_endpoint_returns_aggregated_json() {
    let bedrock = MockBedrock::start(vec![Reply::Json(200, claude_text("Hello there."))]).await;
    let (gateway, proxy) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(AppState { gateway, proxy }))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat")
        .set_json(json!({
            "model": CLAUDE,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Greet me"}
            ]
        }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["text"], "Hello there.");
    assert_eq!(body["model"], CLAUDE);
    assert_eq!(body["hops"], 0);

    // system is sent as user, so an assistant placeholder keeps the roles alternating
    let sent = &bedrock.requests().await[0].body["messages"];
    assert_eq!(sent.as_array().map(Vec::len), Some(3));
    assert_eq!(sent[1]["role"], "assistant");
}

#[actix_web::test]
async fn image_endpoint_returns_base64_images() {
    let bedrock = MockBedrock::start(vec![Reply::Json(
        200,
        json!({"images": ["aW1hZ2U="], "error": null}),
    )])
    .await;
    let (gateway, proxy) = build_gateway(&bedrock.base_url, ToolCatalog::empty(), 8, fast_retry());

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(AppState { gateway, proxy }))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/images")
        .set_json(json!({
            "model": "amazon.titan-image-generator-v2:0",
            "prompt": "a lighthouse",
            "seed": 7
        }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["images"], json!(["aW1hZ2U="]));

    let requests = bedrock.requests().await;
    assert_eq!(requests[0].model, "amazon.titan-image-generator-v2:0");
    assert_eq!(requests[0].body["taskType"], "TEXT_IMAGE");
    assert_eq!(requests[0].body["imageGenerationConfig"]["seed"], 7);
}
