use actix_web::{web, HttpResponse, Responder};
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::{Gateway, InvokeOptions};
use crate::image::{decode_image_response, encode_image_request, ImageRequest};
use crate::models::{CancelToken, Conversation, Message, StreamEvent};
use crate::tool_proxy::ToolProxy;
use crate::util::{error_response, gateway_error_response};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub proxy: ToolProxy,
}

/// Body of `POST /v1/chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub options: InvokeOptions,
}

/// Body of `POST /v1/images`.
#[derive(Debug, Deserialize)]
pub struct ImageGenerationRequest {
    pub model: String,
    #[serde(flatten)]
    pub request: ImageRequest,
}

/// Cancels the turn when the response body is dropped, i.e. when the client goes away.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Render one event as an SSE `data:` frame.
pub fn sse_frame(event: &StreamEvent) -> Bytes {
    let payload = match event {
        StreamEvent::TextDelta { content } => json!({ "text": content }),
        StreamEvent::ToolCallDetected {
            id,
            name,
            arguments_json,
        } => json!({
            "tool_call": { "id": id, "name": name, "arguments": arguments_json }
        }),
        StreamEvent::ToolResultReady {
            tool_call_id,
            output,
        } => json!({
            "tool_result": { "id": tool_call_id, "output": output }
        }),
        StreamEvent::Error { kind, message } => json!({ "error": message, "kind": kind }),
        StreamEvent::Done => json!({ "done": true }),
    };
    Bytes::from(format!("data: {payload}\n\n"))
}

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/v1/chat", web::post().to(chat))
            .route("/v1/tools/{name}", web::post().to(proxy_tool))
            .route("/v1/images", web::post().to(generate_images)),
    );
}

async fn status(state: web::Data<AppState>) -> impl Responder {
    let gateway = &state.gateway;
    web::Json(json!({
        "name": "bedrock-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "region": gateway.client().resolver().region(),
        "tools": gateway.catalog().names().collect::<Vec<_>>(),
        "max_tool_hops": gateway.settings().max_tool_hops,
        "routes": [
            {"path": "/status", "methods": ["GET"]},
            {"path": "/v1/chat", "methods": ["POST"]},
            {"path": "/v1/tools/{name}", "methods": ["POST"]},
            {"path": "/v1/images", "methods": ["POST"]}
        ]
    }))
}

async fn chat(state: web::Data<AppState>, payload: web::Json<ChatRequest>) -> HttpResponse {
    let ChatRequest {
        model,
        messages,
        stream,
        options,
    } = payload.into_inner();
    if messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "messages must not be empty");
    }
    let conversation = Conversation::from(messages);
    tracing::info!(
        "Chat request for {} ({} messages, stream={})",
        model,
        conversation.len(),
        stream
    );

    if stream {
        let cancel = CancelToken::new();
        let guard = CancelOnDrop(cancel.clone());
        let events = state
            .gateway
            .invoke_stream(conversation, &model, options, cancel)
            .map(move |event| {
                let _ = &guard;
                Ok::<_, actix_web::Error>(sse_frame(&event))
            });
        return HttpResponse::Ok()
            .insert_header(("content-type", "text/event-stream"))
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .streaming(events);
    }

    let cancel = CancelToken::new();
    match state
        .gateway
        .invoke_aggregated(conversation, &model, options, &cancel)
        .await
    {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(err) => {
            tracing::error!("Chat request for {} failed: {}", model, err);
            gateway_error_response(&err)
        }
    }
}

async fn proxy_tool(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: Option<web::Json<Value>>,
) -> HttpResponse {
    let name = path.into_inner();
    if state.proxy.catalog().get(&name).is_none() {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown tool: {name}"));
    }
    let arguments = payload.map(web::Json::into_inner).unwrap_or(Value::Null);
    match state.proxy.proxy_tool(&name, &arguments).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(err) => gateway_error_response(&err),
    }
}

async fn generate_images(
    state: web::Data<AppState>,
    payload: web::Json<ImageGenerationRequest>,
) -> HttpResponse {
    let ImageGenerationRequest { model, request } = payload.into_inner();
    let body = match encode_image_request(&model, &request) {
        Ok(body) => body,
        Err(err) => return gateway_error_response(&err),
    };
    let cancel = CancelToken::new();
    let response = match state.gateway.client().invoke(&model, &body, &cancel).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!("Image request for {} failed: {}", model, err);
            return gateway_error_response(&err);
        }
    };
    match decode_image_response(&response) {
        Ok(images) => HttpResponse::Ok().json(json!({ "model": model, "images": images })),
        Err(err) => gateway_error_response(&err),
    }
}
