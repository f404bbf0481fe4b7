use std::sync::Arc;

use anyhow::Context;
use ledgerline_import::{HeuristicClassifier, ImportPipeline};
use ledgerline_storage::SqliteStore;
use tracing::info;

mod config;
mod error;
mod routes;
mod telemetry;

use config::ServerConfig;
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load()?;
    telemetry::init(config.log_format)?;

    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }
    let pool = ledgerline_storage::create_db(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    info!(path = %db_path.display(), "database ready");

    let mut pipeline = ImportPipeline::new(Arc::new(SqliteStore::new(pool)), config.pipeline.clone());
    if config.heuristics {
        pipeline = pipeline.with_fallback(Arc::new(HeuristicClassifier));
    }

    let state = Arc::new(AppState {
        pipeline,
        max_upload_bytes: config.max_upload_bytes,
    });
    let app = routes::router(state, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "ledgerline server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
