//! SQLite-backed locks and run state.
//!
//! Every replica on a host opens its own connection to the same file. Each
//! check-and-set is a single conditional statement (an upsert guarded by an
//! expiry check, or a guarded delete), so the row-level outcome reported by
//! `changes()` is the atomic answer. Multi-statement writes run inside
//! `BEGIN IMMEDIATE` transactions. The busy timeout bounds how long any one
//! operation may wait for another replica's write lock.
//!
//! Expiry is stored as UNIX epoch milliseconds.

use super::lock::{LockGrant, LockManager, ReleaseOutcome};
use super::run_state::{Accounted, CounterDelta, FailedJob, RunCounters, RunMeta, RunStateStore};
use super::{now_millis, ttl_millis};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteCoordination {
    conn: Arc<Mutex<Connection>>,
    run_ttl: Duration,
    finalize_ttl: Duration,
}

impl SqliteCoordination {
    pub fn open(path: &Path, run_ttl: Duration, store_timeout: Duration) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(store_timeout)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS coord_locks (
                lock_key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_meta (
                run_id TEXT PRIMARY KEY,
                case_id INTEGER NOT NULL,
                total_recordings INTEGER NOT NULL,
                already_transcribed INTEGER NOT NULL,
                target INTEGER NOT NULL,
                lock_token TEXT NOT NULL,
                started_at TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                cached INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_pending (
                run_id TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                PRIMARY KEY (run_id, job_id)
            );

            CREATE TABLE IF NOT EXISTS run_failed (
                run_id TEXT NOT NULL,
                job_id INTEGER NOT NULL,
                error TEXT NOT NULL,
                PRIMARY KEY (run_id, job_id)
            );

            CREATE TABLE IF NOT EXISTS run_finalized (
                run_id TEXT PRIMARY KEY,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_meta_expiry ON run_meta(expires_at_ms);
            CREATE INDEX IF NOT EXISTS idx_coord_locks_expiry ON coord_locks(expires_at_ms);
            "#,
        )?;

        log::info!("Coordination store opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            run_ttl,
            finalize_ttl: run_ttl,
        })
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Coordination("coordination connection mutex poisoned".to_string()))
    }

    fn run_expiry(&self, now: i64) -> i64 {
        now.saturating_add(ttl_millis(self.run_ttl))
    }
}

fn parse_started_at(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Coordination(format!("invalid started_at '{}': {}", value, e)))
}

#[async_trait]
impl LockManager for SqliteCoordination {
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<LockGrant> {
        let now = now_millis();
        let token = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"INSERT INTO coord_locks (lock_key, token, expires_at_ms) VALUES (?1, ?2, ?3)
               ON CONFLICT(lock_key) DO UPDATE SET
                   token = excluded.token,
                   expires_at_ms = excluded.expires_at_ms
               WHERE coord_locks.expires_at_ms <= ?4"#,
            params![key, token, now.saturating_add(ttl_millis(ttl)), now],
        )?;
        if changed == 1 {
            Ok(LockGrant::held(token))
        } else {
            Ok(LockGrant::busy())
        }
    }

    async fn release(&self, key: &str, token: &str) -> AppResult<ReleaseOutcome> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM coord_locks WHERE lock_key = ?1 AND token = ?2",
            params![key, token],
        )?;
        Ok(if changed == 1 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::Stale
        })
    }

    async fn is_held(&self, key: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let held: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM coord_locks WHERE lock_key = ? AND expires_at_ms > ?",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(held.is_some())
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM coord_locks WHERE expires_at_ms <= ?",
            params![now_millis()],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl RunStateStore for SqliteCoordination {
    async fn create_run(&self, meta: &RunMeta, job_ids: &[i64]) -> AppResult<()> {
        let now = now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let live: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM run_meta WHERE run_id = ? AND expires_at_ms > ?",
                params![meta.run_id, now],
                |row| row.get(0),
            )
            .optional()?;
        if live.is_some() {
            return Err(AppError::Coordination(format!(
                "run {} already exists",
                meta.run_id
            )));
        }

        // Leftovers of an expired run with the same id
        tx.execute("DELETE FROM run_meta WHERE run_id = ?", params![meta.run_id])?;
        tx.execute("DELETE FROM run_pending WHERE run_id = ?", params![meta.run_id])?;
        tx.execute("DELETE FROM run_failed WHERE run_id = ?", params![meta.run_id])?;

        tx.execute(
            r#"INSERT INTO run_meta
               (run_id, case_id, total_recordings, already_transcribed, target,
                lock_token, started_at, expires_at_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                meta.run_id,
                meta.case_id,
                meta.total_recordings,
                meta.already_transcribed,
                meta.target,
                meta.lock_token,
                meta.started_at.to_rfc3339(),
                self.run_expiry(now)
            ],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO run_pending (run_id, job_id) VALUES (?, ?)")?;
            for job_id in job_ids {
                stmt.execute(params![meta.run_id, job_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn account_job(
        &self,
        run_id: &str,
        job_id: i64,
        delta: CounterDelta,
        error: Option<&str>,
    ) -> AppResult<Option<Accounted>> {
        let now = now_millis();
        let mut conn = self.conn()?;
        // Dropping the transaction on any early return rolls the removal back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute(
            r#"DELETE FROM run_pending
               WHERE run_id = ?1 AND job_id = ?2
                 AND EXISTS (SELECT 1 FROM run_meta WHERE run_id = ?1 AND expires_at_ms > ?3)"#,
            params![run_id, job_id, now],
        )?;
        if removed == 0 {
            return Ok(None);
        }

        if let Some(error) = error {
            tx.execute(
                r#"INSERT INTO run_failed (run_id, job_id, error) VALUES (?1, ?2, ?3)
                   ON CONFLICT(run_id, job_id) DO UPDATE SET error = excluded.error"#,
                params![run_id, job_id, error],
            )?;
        }

        tx.execute(
            r#"UPDATE run_meta
               SET processed = processed + ?2, cached = cached + ?3, failed = failed + ?4,
                   expires_at_ms = ?5
               WHERE run_id = ?1"#,
            params![
                run_id,
                delta.processed,
                delta.cached,
                delta.failed,
                self.run_expiry(now)
            ],
        )?;
        let counters = tx.query_row(
            "SELECT processed, cached, failed FROM run_meta WHERE run_id = ?",
            params![run_id],
            |row| {
                Ok(RunCounters {
                    processed: row.get(0)?,
                    cached: row.get(1)?,
                    failed: row.get(2)?,
                })
            },
        )?;
        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM run_pending WHERE run_id = ?",
            params![run_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(Some(Accounted {
            counters,
            pending: usize::try_from(pending).unwrap_or(0),
        }))
    }

    async fn read_pending_count(&self, run_id: &str) -> AppResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM run_pending p
               JOIN run_meta m ON m.run_id = p.run_id
               WHERE p.run_id = ?1 AND m.expires_at_ms > ?2"#,
            params![run_id, now_millis()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn read_meta(&self, run_id: &str) -> AppResult<Option<RunMeta>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"SELECT run_id, case_id, total_recordings, already_transcribed, target,
                          lock_token, started_at
                   FROM run_meta WHERE run_id = ? AND expires_at_ms > ?"#,
                params![run_id, now_millis()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(run_id, case_id, total_recordings, already_transcribed, target, lock_token, started)| {
                Ok(RunMeta {
                    run_id,
                    case_id,
                    total_recordings,
                    already_transcribed,
                    target,
                    lock_token,
                    started_at: parse_started_at(&started)?,
                })
            },
        )
        .transpose()
    }

    async fn read_counters(&self, run_id: &str) -> AppResult<RunCounters> {
        let conn = self.conn()?;
        let counters = conn
            .query_row(
                r#"SELECT processed, cached, failed FROM run_meta
                   WHERE run_id = ? AND expires_at_ms > ?"#,
                params![run_id, now_millis()],
                |row| {
                    Ok(RunCounters {
                        processed: row.get(0)?,
                        cached: row.get(1)?,
                        failed: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(counters.unwrap_or_default())
    }

    async fn read_failed(&self, run_id: &str) -> AppResult<Vec<FailedJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT f.job_id, f.error FROM run_failed f
               JOIN run_meta m ON m.run_id = f.run_id
               WHERE f.run_id = ?1 AND m.expires_at_ms > ?2
               ORDER BY f.job_id"#,
        )?;
        let failed = stmt
            .query_map(params![run_id, now_millis()], |row| {
                Ok(FailedJob {
                    job_id: row.get(0)?,
                    error: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(failed)
    }

    async fn finalize_once(&self, run_id: &str) -> AppResult<bool> {
        let now = now_millis();
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"INSERT INTO run_finalized (run_id, expires_at_ms) VALUES (?1, ?2)
               ON CONFLICT(run_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms
               WHERE run_finalized.expires_at_ms <= ?3"#,
            params![run_id, now.saturating_add(ttl_millis(self.finalize_ttl)), now],
        )?;
        Ok(changed == 1)
    }

    async fn delete_run(&self, run_id: &str) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM run_pending WHERE run_id = ?", params![run_id])?;
        tx.execute("DELETE FROM run_failed WHERE run_id = ?", params![run_id])?;
        tx.execute("DELETE FROM run_meta WHERE run_id = ?", params![run_id])?;
        tx.commit()?;
        Ok(())
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        let now = now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"DELETE FROM run_pending WHERE run_id IN
                   (SELECT run_id FROM run_meta WHERE expires_at_ms <= ?)"#,
            params![now],
        )?;
        tx.execute(
            r#"DELETE FROM run_failed WHERE run_id IN
                   (SELECT run_id FROM run_meta WHERE expires_at_ms <= ?)"#,
            params![now],
        )?;
        let runs = tx.execute("DELETE FROM run_meta WHERE expires_at_ms <= ?", params![now])?;
        let flags = tx.execute(
            "DELETE FROM run_finalized WHERE expires_at_ms <= ?",
            params![now],
        )?;
        tx.commit()?;
        Ok(runs + flags)
    }
}
