// =============================================================================
// Bulk Ingestion — historical backfill from the exchange's daily snapshots
// =============================================================================

pub mod twse;
pub mod worker;

pub use twse::{DailySnapshotSource, TwseSnapshotClient};
pub use worker::{BulkSyncState, BulkSyncWorker, StartSyncRequest, SyncInfo, SyncPhase};
