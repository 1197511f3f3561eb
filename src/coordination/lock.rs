//! Token + TTL lock manager.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result of an acquire attempt.
///
/// `acquired == false` is the normal "busy" outcome, not an error.
/// `enabled == false` means no lock backend is configured; the grant is then
/// always `acquired` and callers fall back to single-process behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub acquired: bool,
    pub token: String,
    pub enabled: bool,
}

impl LockGrant {
    pub fn busy() -> Self {
        Self {
            acquired: false,
            token: String::new(),
            enabled: true,
        }
    }

    pub fn held(token: String) -> Self {
        Self {
            acquired: true,
            token,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The stored token did not match (expired and possibly re-acquired by
    /// someone else). Nothing was changed.
    Stale,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take `key` for `ttl`. Never blocks waiting for the holder.
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<LockGrant>;

    /// Release `key` if and only if `token` still owns it.
    async fn release(&self, key: &str, token: &str) -> AppResult<ReleaseOutcome>;

    /// Whether anyone holds an unexpired lease on `key`.
    async fn is_held(&self, key: &str) -> AppResult<bool>;

    /// Drop expired leases. Returns how many were removed.
    async fn purge_expired(&self) -> AppResult<usize> {
        Ok(0)
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

struct Lease {
    token: String,
    expires_at: Instant,
}

/// In-memory lock manager. Not shared across processes.
#[derive(Clone, Default)]
pub struct MemoryLockManager {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<LockGrant> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| AppError::Coordination(format!("lock ttl too large for {}", key)))?;
        let mut leases = self.leases.lock().await;

        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return Ok(LockGrant::busy());
            }
        }

        let token = new_token();
        leases.insert(
            key.to_string(),
            Lease {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(LockGrant::held(token))
    }

    async fn release(&self, key: &str, token: &str) -> AppResult<ReleaseOutcome> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(lease) if lease.token == token => {
                leases.remove(key);
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::Stale),
        }
    }

    async fn is_held(&self, key: &str) -> AppResult<bool> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now()))
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at > now);
        Ok(before - leases.len())
    }
}

/// Stand-in when no lock backend is configured: every acquire succeeds with
/// `enabled == false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLockManager;

#[async_trait]
impl LockManager for DisabledLockManager {
    async fn acquire(&self, _key: &str, _ttl: Duration) -> AppResult<LockGrant> {
        Ok(LockGrant {
            acquired: true,
            token: String::new(),
            enabled: false,
        })
    }

    async fn release(&self, _key: &str, _token: &str) -> AppResult<ReleaseOutcome> {
        Ok(ReleaseOutcome::Released)
    }

    async fn is_held(&self, _key: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
