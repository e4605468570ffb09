//! Reconciliation core.
//!
//! A run filters both listings, compares them into a [`Plan`], passes the
//! plan through the [`SafetyGate`], and hands it to one [`Executor`] per
//! destination.

pub mod batch;
pub mod compare;
pub mod engine;
pub mod error;
pub mod executor;
pub mod filter;
pub mod gate;
pub mod hash;
pub mod plan;
pub mod stats;
pub mod throttle;

pub use batch::{BatchDelete, BatchReport, ObjectCopier};
pub use compare::Comparator;
pub use engine::{SyncEngine, SyncReport};
pub use error::{SyncError, TransferError};
pub use executor::{AuditLine, AuditSender, Executor, ItemOutcome, WorkerReport, DRY_RUN_NOTICE};
pub use filter::PatternFilter;
pub use gate::SafetyGate;
pub use hash::{hash_bytes, hash_file};
pub use plan::{CopyPair, Plan, PlanSummary};
pub use stats::{reduce_statuses, ExitStatus, RunStats, Scoreboard};
pub use throttle::BandwidthLimiter;
