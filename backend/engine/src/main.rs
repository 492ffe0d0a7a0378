//! Hackathon Arena Engine — entry point.
//!
//! Hosts the event lifecycle engine (stages, registration, teams,
//! voting, prizes) over SQLite, mirrors state-changing writes to an
//! external append-only ledger through a JSON-RPC gateway, and exposes
//! an Axum REST API. Two background tasks run alongside the API: the
//! mirror confirmation worker and the stage scheduler.

mod api;
mod config;
mod credential;
mod db;
mod errors;
mod event;
mod gas;
mod gateway;
mod mirror;
mod prize;
mod registration;
mod stage;
mod state;
mod team;
mod types;
mod verify;
mod voting;

use std::sync::Arc;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::HttpGateway;
use mirror::MirrorState;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client shared by every gateway call.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let gateway = HttpGateway::new(client, config.rpc_url.clone(), config.contract_id.clone());

    // ─── Background workers ───────────────────────────────
    let mirror_state = Arc::new(MirrorState {
        pool: pool.clone(),
        gateway: gateway.clone(),
        config: config.clone(),
    });
    tokio::spawn(mirror::run(mirror_state));

    let app_state = Arc::new(AppState::new(pool, gateway, config.clone()));
    tokio::spawn(stage::run_scheduler(Arc::clone(&app_state)));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::clone(&app_state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
