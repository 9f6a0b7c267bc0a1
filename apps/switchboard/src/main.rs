mod cli;
mod config;
mod coordinator;
mod registry;
mod router;
mod websocket;

use axum::{extract::State, routing::get, Json};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    registry::Registry,
    router::Router,
    websocket::call_handler,
};

#[tokio::main]
async fn main() {
    // Default to WARN when RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        name,
        list_only,
    }) = cli.command
    {
        if let Err(err) = cli::run_probe(url, name, list_only).await {
            error!("probe failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting switchboard signaling relay on port {}", config.port);

    let registry = Arc::new(Registry::new());
    let router = Arc::new(Router::new(registry));

    let app = axum::Router::new()
        .route("/health", get(health_check))
        .route("/call", get(call_handler))
        .with_state(router)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("switchboard listening on {addr}");

    axum::serve(listener, app).await.expect("server error");
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    endpoints: usize,
}

async fn health_check(State(router): State<Arc<Router>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        endpoints: router.registry().len(),
    })
}
