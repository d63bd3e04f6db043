// =============================================================================
// Runtime Configuration — engine settings with serde defaults
// =============================================================================
//
// Every tunable lives here. Fields all carry `#[serde(default)]` so an older
// JSON file missing new fields still deserialises, and a handful of
// environment variables override the file for container deployments.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "formosa.db".to_string()
}

fn default_sync_quantum_secs() -> u64 {
    5
}

fn default_complete_day_threshold() -> u64 {
    1000
}

fn default_failed_dates_cap() -> usize {
    50
}

fn default_broadcast_interval_secs() -> u64 {
    5
}

fn default_batch_quote_cap() -> usize {
    20
}

fn default_indicator_cache_ttl_hours() -> i64 {
    24
}

fn default_retention_years() -> u32 {
    5
}

fn default_quote_timeout_secs() -> u64 {
    10
}

fn default_batch_quote_timeout_secs() -> u64 {
    15
}

fn default_snapshot_timeout_secs() -> u64 {
    30
}

fn default_sink_buffer() -> usize {
    32
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the back-office engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Server & storage ----------------------------------------------------

    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path to the SQLite database file. `:memory:` is accepted for tests.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Bulk ingestion ------------------------------------------------------

    /// Fixed inter-request delay for the bulk sync worker, in seconds,
    /// measured from the start of each upstream request.
    #[serde(default = "default_sync_quantum_secs")]
    pub sync_quantum_secs: u64,

    /// A trading day with more than this many stored bars counts as already
    /// complete and is skipped when `skip_synced` is requested.
    #[serde(default = "default_complete_day_threshold")]
    pub complete_day_threshold: u64,

    /// Upper bound on the `failed_dates` list kept in the sync progress.
    #[serde(default = "default_failed_dates_cap")]
    pub failed_dates_cap: usize,

    /// Per-request timeout for the exchange-wide daily snapshot, in seconds.
    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,

    // --- Realtime ------------------------------------------------------------

    /// Periodic broadcaster cycle, in seconds.
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,

    /// Maximum symbols per upstream batch-quote request. Larger subscriber
    /// sets are partitioned by this cap.
    #[serde(default = "default_batch_quote_cap")]
    pub batch_quote_cap: usize,

    /// Timeout for a single-symbol quote request, in seconds.
    #[serde(default = "default_quote_timeout_secs")]
    pub quote_timeout_secs: u64,

    /// Timeout for a batch quote request, in seconds.
    #[serde(default = "default_batch_quote_timeout_secs")]
    pub batch_quote_timeout_secs: u64,

    /// Bounded per-subscriber buffer; a full buffer drops the update for
    /// that sink instead of stalling the broadcaster.
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,

    // --- Indicators ----------------------------------------------------------

    /// Cache entry time-to-live, in hours.
    #[serde(default = "default_indicator_cache_ttl_hours")]
    pub indicator_cache_ttl_hours: i64,

    // --- Retention -----------------------------------------------------------

    /// Raw daily bars older than this horizon are eligible for eviction.
    /// Rollups are retained longer.
    #[serde(default = "default_retention_years")]
    pub retention_years: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            sync_quantum_secs: default_sync_quantum_secs(),
            complete_day_threshold: default_complete_day_threshold(),
            failed_dates_cap: default_failed_dates_cap(),
            snapshot_timeout_secs: default_snapshot_timeout_secs(),
            broadcast_interval_secs: default_broadcast_interval_secs(),
            batch_quote_cap: default_batch_quote_cap(),
            quote_timeout_secs: default_quote_timeout_secs(),
            batch_quote_timeout_secs: default_batch_quote_timeout_secs(),
            sink_buffer: default_sink_buffer(),
            indicator_cache_ttl_hours: default_indicator_cache_ttl_hours(),
            retention_years: default_retention_years(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the loaded file.
    ///
    /// `FORMOSA_BIND_ADDR` and `FORMOSA_DB_PATH` are the two knobs container
    /// deployments need without editing the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FORMOSA_BIND_ADDR") {
            if !addr.is_empty() {
                self.bind_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("FORMOSA_DB_PATH") {
            if !path.is_empty() {
                self.db_path = path;
            }
        }
    }
}
