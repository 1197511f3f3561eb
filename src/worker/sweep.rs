use crate::coordination::{LockManager, RunStateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically drop expired run state, finalize flags and locks so
/// abandoned runs do not accumulate in the shared store.
pub async fn sweep_task(
    locks: Arc<dyn LockManager>,
    store: Option<Arc<dyn RunStateStore>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    log::info!("Sweeper started (every {:?})", interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Sweeper cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                sweep_once(locks.as_ref(), store.as_deref()).await;
            }
        }
    }
}

/// One purge pass. Returns `(locks, run entries)` removed.
pub async fn sweep_once(
    locks: &dyn LockManager,
    store: Option<&dyn RunStateStore>,
) -> (usize, usize) {
    let purged_locks = match locks.purge_expired().await {
        Ok(n) => n,
        Err(e) => {
            log::warn!("Failed to purge expired locks: {}", e);
            0
        }
    };
    let purged_runs = match store {
        Some(store) => match store.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to purge expired run state: {}", e);
                0
            }
        },
        None => 0,
    };
    if purged_locks + purged_runs > 0 {
        log::info!(
            "Swept {} expired locks and {} expired run entries",
            purged_locks,
            purged_runs
        );
    }
    (purged_locks, purged_runs)
}
