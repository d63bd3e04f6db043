// =============================================================================
// Storage — SQLite-backed persistence shared by all components
// =============================================================================

pub mod db;

pub use db::Database;
