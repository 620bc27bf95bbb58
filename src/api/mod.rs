//! HTTP surface of the querier.

pub mod query;

use crate::cache::InMemoryByteCache;
use crate::config::QuerierConfig;
use crate::querier::{Querier, QuerierOptions};
use crate::reader::DuckDbReader;
use crate::sql::duckdb_query_builder;
use crate::{QuerierError, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub querier: Querier,
    /// Deadline applied to every query range request.
    pub timeout: Option<Duration>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v3/query_range", post(query::query_range))
        .route("/metrics", get(query::metrics))
        .route("/health", get(query::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire a DuckDB-backed querier from `config`.
pub fn build_state(config: &QuerierConfig) -> Result<AppState> {
    let timeout = (config.query_timeout_secs > 0)
        .then(|| Duration::from_secs(config.query_timeout_secs));

    let mut reader = DuckDbReader::open(config.database_path.as_deref())?
        .with_max_result_rows(config.max_result_rows);
    if let Some(timeout) = timeout {
        reader = reader.with_query_timeout(timeout);
    }

    let mut options =
        QuerierOptions::new(Arc::new(reader), duckdb_query_builder()).with_config(config);
    if config.cache_max_entries > 0 {
        options = options.with_cache(Arc::new(InMemoryByteCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        )));
    }

    Ok(AppState {
        querier: Querier::new(options),
        timeout,
    })
}

pub async fn serve(config: QuerierConfig) -> Result<()> {
    let state = build_state(&config)?;
    let app = router(state);

    info!("Starting querier on {}", config.listen_addr);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| QuerierError::Internal(format!("Failed to bind to address: {}", e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| QuerierError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
