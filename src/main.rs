use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use bedrock_gateway::config::GatewayConfig;
use bedrock_gateway::server::{config_routes, AppState};
use bedrock_gateway::util::{build_http_client, cors_config_from_env, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "bedrock-gateway", version, about)]
struct Args {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// Tool catalog file, YAML or JSON
    #[arg(long, env = "BEDROCK_TOOL_CATALOG")]
    tool_catalog: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = GatewayConfig::from_env();
    if let Some(path) = args.tool_catalog {
        config.tool_catalog = Some(path);
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let catalog = Arc::new(config.load_catalog().context("loading tool catalog")?);
    let http = build_http_client();
    let (gateway, proxy) = config
        .build_gateway(http, catalog)
        .context("building Bedrock gateway")?;
    let state = web::Data::new(AppState { gateway, proxy });

    tracing::info!(
        "bedrock-gateway {} listening on {} (region {})",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.credentials.region
    );

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&config.bind_addr)
    .with_context(|| format!("binding {}", config.bind_addr))?
    .run()
    .await?;

    Ok(())
}
