use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::GatewayError;

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, ENVFILE, DOTENV_PATH
/// - Falls back to .envfile, then default .env discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none"
        && std::path::Path::new(".envfile").is_file()
        && dotenvy::from_filename(".envfile").is_ok()
    {
        env_source = ".envfile".into();
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    // RUST_LOG may come from the env file loaded above.
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// `1|true|yes|on` (case-insensitive) → true.
pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false)
}

/// Build the shared outbound HTTP client honoring proxy environment variables.
///
/// Environment:
/// - BEDROCK_NO_PROXY = 1|true|yes|on   -> disable all proxies
/// - BEDROCK_PROXY_URL = <url>           -> proxy for all schemes
/// - HTTP_PROXY / http_proxy             -> HTTP proxy
/// - HTTPS_PROXY / https_proxy           -> HTTPS proxy
///
/// Request timeouts are applied per call by the Bedrock client and the tool
/// proxy, so none is configured here.
pub fn build_http_client() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if env_flag("BEDROCK_NO_PROXY") {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("BEDROCK_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder = builder.user_agent(format!("bedrock-gateway/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Falling back to default HTTP client: {}", e);
        reqwest::Client::new()
    })
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(to_actix_status(status)).json(body)
}

fn to_actix_status(status: StatusCode) -> actix_web::http::StatusCode {
    actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
}

/// HTTP status reported to front-end callers for a gateway error.
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Config(_)
        | GatewayError::Encoding(_)
        | GatewayError::UnsupportedModel(_)
        | GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::Http { status: 429, .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Network(_)
        | GatewayError::Http { .. }
        | GatewayError::Parse(_)
        | GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Cancelled | GatewayError::ToolLimit(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// JSON error response carrying the error's kind tag.
pub fn gateway_error_response(err: &GatewayError) -> HttpResponse {
    let body = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": err.kind(),
        }
    });
    HttpResponse::build(to_actix_status(status_for(err))).json(body)
}

/// Build CORS configuration from environment variables.
///
/// - CORS_ALLOWED_ORIGINS: `*` or comma-separated origins (default any)
/// - CORS_ALLOWED_METHODS: `*` or comma-separated methods (default any)
/// - CORS_ALLOWED_HEADERS: `*` or comma-separated headers (default any)
/// - CORS_ALLOW_CREDENTIALS: 1|true|yes|on
/// - CORS_MAX_AGE: seconds
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods: Vec<&str> = methods
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in headers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_flag("CORS_ALLOW_CREDENTIALS") {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
