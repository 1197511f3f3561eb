//! Cross-process coordination primitives.
//!
//! Two seams, each with an in-memory backend (single process, tests) and a
//! SQLite backend (a file shared by every replica on the host):
//!
//! - [`LockManager`]: token + TTL leases. Release only succeeds for the token
//!   that acquired the lease; expiry keeps the system live when a holder dies.
//! - [`RunStateStore`]: per-run pending set, failed set and counters, updated
//!   together in one atomic accounting step, plus a finalize-once flag.

pub mod lock;
pub mod run_state;
pub mod sqlite;

pub use lock::{DisabledLockManager, LockGrant, LockManager, MemoryLockManager, ReleaseOutcome};
pub use run_state::{
    Accounted, CounterDelta, FailedJob, MemoryRunStateStore, RunCounters, RunMeta, RunStateStore,
};
pub use sqlite::SqliteCoordination;

/// Lock key guarding dispatch for a whole case.
pub fn case_lock_key(case_id: i64) -> String {
    format!("transcribe:case:{}", case_id)
}

/// Lock key guarding a single recording's transcription.
pub fn job_lock_key(job_id: i64) -> String {
    format!("transcribe:job:{}", job_id)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn ttl_millis(ttl: std::time::Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
