// =============================================================================
// Bulk Sync Worker — paced, resumable exchange-wide backfill
// =============================================================================
//
// Walks a date range one trading day at a time, pulling the whole exchange in
// a single request per day. One request per quantum, measured from the start
// of each request. Per-day failures are isolated: counters tick, the day
// lands in `failed_dates`, and the walk continues.
//
//   IDLE ──start──► RUNNING ──last day──► COMPLETED
//                   RUNNING ──cancel────► CANCELLED
//                   RUNNING ──fatal─────► FAILED
//   COMPLETED | CANCELLED | FAILED ──start──► RUNNING (state reset)
//
// At most one run per process; `start` while RUNNING returns Conflict.
// Cancellation is a watch channel observed between days and during the
// pacing sleep — the in-flight request is allowed to complete, no new
// request is issued after cancel.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::CoreError;
use crate::ingest::twse::DailySnapshotSource;
use crate::market::MarketStore;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Progress snapshot published to HTTP readers. Mutated only by the worker
/// under the write lock; readers always see a consistent snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BulkSyncState {
    pub is_running: bool,
    pub phase: SyncPhase,
    pub mode: Option<String>,
    pub total_days: u64,
    pub processed_days: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub current_date: Option<NaiveDate>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failed_dates: Vec<NaiveDate>,
    /// Advisory: remaining days × quantum, in seconds.
    pub estimated_secs_remaining: Option<u64>,
}

impl BulkSyncState {
    fn idle() -> Self {
        Self {
            is_running: false,
            phase: SyncPhase::Idle,
            mode: None,
            total_days: 0,
            processed_days: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            current_date: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            failed_dates: Vec::new(),
            estimated_secs_remaining: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSyncRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default = "default_skip_synced")]
    pub skip_synced: bool,
    /// Accepted for API compatibility; the exchange-wide snapshot already
    /// covers every holding in the same request.
    #[serde(default)]
    pub portfolio_id: Option<String>,
    #[serde(default)]
    pub priority_holdings: Option<bool>,
}

fn default_skip_synced() -> bool {
    true
}

/// Coverage summary over the stored history.
#[derive(Debug, Clone, Serialize)]
pub struct SyncInfo {
    pub first_synced_date: Option<NaiveDate>,
    pub last_synced_date: Option<NaiveDate>,
    pub synced_days_count: u64,
    pub gaps_count: u64,
}

// =============================================================================
// Worker
// =============================================================================

pub struct BulkSyncWorker {
    market: MarketStore,
    source: Arc<dyn DailySnapshotSource>,
    state: RwLock<BulkSyncState>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    quantum: Duration,
    complete_day_threshold: u64,
    failed_dates_cap: usize,
}

impl BulkSyncWorker {
    pub fn new(
        market: MarketStore,
        source: Arc<dyn DailySnapshotSource>,
        quantum: Duration,
        complete_day_threshold: u64,
        failed_dates_cap: usize,
    ) -> Self {
        Self {
            market,
            source,
            state: RwLock::new(BulkSyncState::idle()),
            cancel: Mutex::new(None),
            quantum,
            complete_day_threshold,
            failed_dates_cap,
        }
    }

    /// Current progress snapshot.
    pub fn status(&self) -> BulkSyncState {
        self.state.read().clone()
    }

    /// Coverage summary: first/last complete day, complete-day count, and the
    /// number of weekday gaps in between.
    pub fn sync_info(&self) -> Result<SyncInfo, CoreError> {
        let bounds = self.market.day_bounds()?;
        let (first, last) = match bounds {
            Some(b) => b,
            None => {
                return Ok(SyncInfo {
                    first_synced_date: None,
                    last_synced_date: None,
                    synced_days_count: 0,
                    gaps_count: 0,
                })
            }
        };

        let counts = self.market.count_bars_per_day(first, last)?;
        let complete: Vec<NaiveDate> = counts
            .iter()
            .filter(|(_, n)| *n > self.complete_day_threshold)
            .map(|(d, _)| *d)
            .collect();

        let (first_complete, last_complete) = match (complete.first(), complete.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => {
                return Ok(SyncInfo {
                    first_synced_date: None,
                    last_synced_date: None,
                    synced_days_count: 0,
                    gaps_count: 0,
                })
            }
        };

        let weekdays = trading_day_candidates(first_complete, last_complete).len() as u64;
        let synced = complete.len() as u64;

        Ok(SyncInfo {
            first_synced_date: Some(first_complete),
            last_synced_date: Some(last_complete),
            synced_days_count: synced,
            gaps_count: weekdays.saturating_sub(synced),
        })
    }

    /// Begin a run over `[start_date, end_date]`. Returns `Conflict` when a
    /// run is already active; a finished (completed/cancelled/failed) state
    /// is reset.
    pub fn start(self: &Arc<Self>, req: StartSyncRequest) -> Result<(), CoreError> {
        if req.start_date > req.end_date {
            return Err(CoreError::validation(
                "start_date must not be after end_date",
            ));
        }

        let days = trading_day_candidates(req.start_date, req.end_date);
        if days.is_empty() {
            return Err(CoreError::validation(
                "date range contains no trading days",
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);

        {
            let mut state = self.state.write();
            if state.is_running {
                return Err(CoreError::conflict("bulk sync already running"));
            }

            *state = BulkSyncState::idle();
            state.is_running = true;
            state.phase = SyncPhase::Running;
            state.mode = Some("range".to_string());
            state.total_days = days.len() as u64;
            state.started_at = Some(Utc::now());
            state.estimated_secs_remaining =
                Some(days.len() as u64 * self.quantum.as_secs());
        }
        *self.cancel.lock() = Some(cancel_tx);

        info!(
            start = %req.start_date,
            end = %req.end_date,
            days = days.len(),
            skip_synced = req.skip_synced,
            portfolio_id = ?req.portfolio_id,
            "bulk sync started"
        );

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.run(days, req.skip_synced, cancel_rx).await;
        });

        Ok(())
    }

    /// Signal the active run to stop. No-op when idle.
    pub fn stop(&self) {
        if let Some(tx) = self.cancel.lock().as_ref() {
            let _ = tx.send(true);
            info!("bulk sync stop requested");
        }
    }

    // ── Run loop ────────────────────────────────────────────────────────

    async fn run(
        self: Arc<Self>,
        days: Vec<NaiveDate>,
        skip_synced: bool,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let total = days.len();

        for (index, day) in days.iter().enumerate() {
            if *cancel_rx.borrow() {
                self.finish(SyncPhase::Cancelled, None);
                return;
            }

            {
                let mut state = self.state.write();
                state.current_date = Some(*day);
            }

            // Skip-synced consults the store, no upstream request, no pacing.
            if skip_synced {
                match self.market.count_bars_on(*day) {
                    Ok(count) if count > self.complete_day_threshold => {
                        self.record_day(|s| s.skipped_count += 1, total);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Store unavailable: fatal, not a day-level failure.
                        self.finish(SyncPhase::Failed, Some(e.to_string()));
                        return;
                    }
                }
            }

            let request_started = Instant::now();
            match self.source.fetch_day(*day).await {
                Ok(bars) if bars.is_empty() => {
                    // Non-error, zero parseable rows: the exchange was closed.
                    info!(%day, "no rows in snapshot, counting as holiday");
                    self.record_day(|s| s.skipped_count += 1, total);
                }
                Ok(bars) => match self.market.upsert_bars(&bars) {
                    Ok(written) => {
                        info!(%day, rows = written, "trading day ingested");
                        self.record_day(|s| s.success_count += 1, total);
                    }
                    Err(e) => {
                        warn!(%day, error = %e, "failed to persist day, continuing");
                        self.record_failed_day(*day, total);
                    }
                },
                Err(e) => {
                    warn!(%day, error = %e, "snapshot fetch failed, continuing");
                    self.record_failed_day(*day, total);
                }
            }

            // Pace the next request: one per quantum, measured from the start
            // of this one. The sleep is interruptible by cancel.
            if index + 1 < total {
                let elapsed = request_started.elapsed();
                if elapsed < self.quantum {
                    let mut cancel = cancel_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.quantum - elapsed) => {}
                        _ = cancel.changed() => {}
                    }
                }
            }
        }

        self.finish(SyncPhase::Completed, None);
    }

    fn record_day(&self, bump: impl FnOnce(&mut BulkSyncState), total: usize) {
        let mut state = self.state.write();
        bump(&mut state);
        state.processed_days += 1;
        let remaining = (total as u64).saturating_sub(state.processed_days);
        state.estimated_secs_remaining = Some(remaining * self.quantum.as_secs());
    }

    fn record_failed_day(&self, day: NaiveDate, total: usize) {
        let cap = self.failed_dates_cap;
        self.record_day(
            |s| {
                s.failed_count += 1;
                if s.failed_dates.len() < cap {
                    s.failed_dates.push(day);
                }
            },
            total,
        );
    }

    fn finish(&self, phase: SyncPhase, error: Option<String>) {
        {
            let mut state = self.state.write();
            state.is_running = false;
            state.phase = phase;
            state.current_date = None;
            state.completed_at = Some(Utc::now());
            state.error_message = error;
            state.estimated_secs_remaining = None;
        }
        *self.cancel.lock() = None;
        info!(?phase, "bulk sync finished");
    }
}

/// Expand a date range into candidate trading days: weekends pre-filtered,
/// holidays learned from empty responses at fetch time.
pub(crate) fn trading_day_candidates(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    days
}
