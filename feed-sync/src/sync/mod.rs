//! Sync engine: per-target pagination, run orchestration and gap audit

mod audit;
mod orchestrator;
mod summary;
mod syncer;

pub use audit::*;
pub use orchestrator::*;
pub use summary::*;
pub use syncer::*;
