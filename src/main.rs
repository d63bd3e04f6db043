// =============================================================================
// Formosa Desk — Taiwan equity back-office engine
// =============================================================================
//
// Event-sourced portfolio ledger with FIFO cost basis, OHLCV history with
// rollups, paced exchange-wide bulk ingestion, realtime quote fan-out, and a
// cached technical-indicator engine, all behind one axum server.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod errors;
mod indicators;
mod ingest;
mod ledger;
mod market;
mod realtime;
mod runtime_config;
mod storage;
mod symbol;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::storage::Database;

const CONFIG_PATH: &str = "formosa_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path,
        sync_quantum_secs = config.sync_quantum_secs,
        "engine configuration resolved"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let db = Database::open(&config.db_path).context("database startup failed")?;

    // ── 3. Shared state ──────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, db));

    // ── 4. Background tasks ──────────────────────────────────────────────
    let broadcaster = state.realtime.spawn_broadcaster();

    // ── 5. HTTP server ───────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let result = server.await;

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    warn!("shutdown signal received, stopping");
    state.bulk_sync.stop();
    broadcaster.abort();
    info!("formosa-desk shut down complete");

    result.context("server terminated abnormally")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl_c, shutting down");
    }
}
