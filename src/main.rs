use std::sync::Arc;

use anyhow::Context;

mod app;
mod config;
mod context;
mod db;
mod state;
mod users;

use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::db::PoolManager;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "userkeep=debug,axum=info,tower_http=info,sqlx=warn".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env().context("load configuration")?);

    let pools = PoolManager::new();
    let shutdown = RequestContext::new();
    let startup = RequestContext::with_timeout(config.database.acquire_timeout);
    let database = pools
        .initialize(&startup, &config.database)
        .await
        .context("initialize database pool")?;

    if let Err(e) = sqlx::migrate!("./migrations").run(database.pool()).await {
        tracing::warn!(error = %e, "migration failed; continuing");
    }

    let app = app::build_app(AppState::new(database, Arc::clone(&config), shutdown.clone()));
    let server = app::serve(app, config.server.clone(), shutdown.clone());
    app::run_until_closed(server, &shutdown, &pools).await
}
