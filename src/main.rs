//! runnerd - local LLM serving daemon.

use std::env;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use runnerd::accel::SystemProbe;
use runnerd::api;
use runnerd::config::DaemonConfig;
use runnerd::model::GgufIntrospector;
use runnerd::payload::PayloadStore;
use runnerd::scheduler::Scheduler;
use runnerd::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("runnerd {VERSION}");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::load().map_err(|e| {
        format!("failed to load configuration: {e}. Check config.toml or RUNNERD__* variables.")
    })?;

    let payloads = match &config.runner.work_dir {
        Some(dir) => Arc::new(PayloadStore::new(dir.into())),
        None => Arc::new(PayloadStore::for_process()),
    };
    payloads.init().await?;

    let scheduler = Scheduler::new(
        &config,
        payloads.clone(),
        Arc::new(GgufIntrospector),
        Arc::new(SystemProbe::new()),
    );

    let state = Arc::new(AppState::new(config.clone(), scheduler.clone()));
    let app = Router::new()
        .nest("/api", api::router())
        .route("/health", axum::routing::get(api::health::health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!(version = VERSION, "runnerd listening on {addr}");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    scheduler.close_all().await;
    payloads.cleanup()?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
