// =============================================================================
// Central Application State
// =============================================================================
//
// The composition root shared by every HTTP handler and background task via
// `Arc<AppState>`. Each subsystem manages its own interior mutability; this
// struct only ties them together.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use crate::indicators::IndicatorEngine;
use crate::ingest::{BulkSyncWorker, TwseSnapshotClient};
use crate::ledger::LedgerStore;
use crate::market::MarketStore;
use crate::realtime::RealtimeService;
use crate::runtime_config::RuntimeConfig;
use crate::storage::Database;

pub struct AppState {
    pub config: RuntimeConfig,
    pub ledger: LedgerStore,
    pub market: MarketStore,
    pub bulk_sync: Arc<BulkSyncWorker>,
    pub realtime: Arc<RealtimeService>,
    pub indicators: IndicatorEngine,
}

impl AppState {
    /// Wire every subsystem against the shared database handle.
    pub fn new(config: RuntimeConfig, db: Database) -> Self {
        let market = MarketStore::new(db.clone());

        let snapshot_source = Arc::new(TwseSnapshotClient::new(Duration::from_secs(
            config.snapshot_timeout_secs,
        )));
        let bulk_sync = Arc::new(BulkSyncWorker::new(
            market.clone(),
            snapshot_source,
            Duration::from_secs(config.sync_quantum_secs),
            config.complete_day_threshold,
            config.failed_dates_cap,
        ));

        let realtime = Arc::new(RealtimeService::new(&config));
        let indicators =
            IndicatorEngine::new(db.clone(), market.clone(), config.indicator_cache_ttl_hours);

        Self {
            config,
            ledger: LedgerStore::new(db),
            market,
            bulk_sync,
            realtime,
            indicators,
        }
    }
}
