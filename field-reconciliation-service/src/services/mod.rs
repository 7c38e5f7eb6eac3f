//! Services module for field-reconciliation-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod sync;

pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error, record_match_decision};
pub use store::{ReconciliationStore, SYSTEM_ACTOR};
pub use sync::{run_matching, SyncOrchestrator, SyncSummary};
