pub mod models;


use anyhow::{anyhow, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use models::*;

/// Persistent store for cases, recordings and transcripts.
///
/// The `is_transcribed` flag on a recording is the single source of truth for
/// "this job is done"; only a worker that successfully transcribed the
/// recording sets it.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_date TEXT NOT NULL DEFAULT (datetime('now')),
                finished_date TEXT
            );

            CREATE TABLE IF NOT EXISTS recordings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                audio_url TEXT NOT NULL,
                is_transcribed INTEGER NOT NULL DEFAULT 0,
                transcription_status TEXT NOT NULL DEFAULT 'pending',
                transcription_error TEXT,
                transcribed_date TEXT,
                FOREIGN KEY (case_id) REFERENCES cases(id) ON DELETE CASCADE,
                UNIQUE(case_id, position)
            );

            CREATE INDEX IF NOT EXISTS idx_recordings_case ON recordings(case_id, position);

            CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recording_id INTEGER NOT NULL UNIQUE,
                case_id INTEGER NOT NULL,
                full_text TEXT NOT NULL,
                language TEXT,
                confidence REAL,
                duration_seconds REAL,
                model_used TEXT,
                metadata_json TEXT,
                created_date TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (recording_id) REFERENCES recordings(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_case ON transcripts(case_id);
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Cases and recordings
    // =========================================================================

    pub fn create_case(&self, title: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO cases (title) VALUES (?)", params![title])?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a recording to a case; its position is the next free slot.
    pub fn add_recording(&self, case_id: i64, audio_url: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO recordings (case_id, position, audio_url)
               VALUES (?1, (SELECT COUNT(*) FROM recordings WHERE case_id = ?1), ?2)"#,
            params![case_id, audio_url],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_case(&self, case_id: i64) -> Result<Option<Case>> {
        let conn = self.conn()?;
        let case = conn
            .query_row(
                "SELECT id, title, status, created_date, finished_date FROM cases WHERE id = ?",
                params![case_id],
                |row| {
                    Ok(Case {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        status: row.get::<_, String>(2)?.into(),
                        created_date: row.get(3)?,
                        finished_date: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(case)
    }

    /// Recordings of a case in position order, with their done flag.
    pub fn get_case_recordings(&self, case_id: i64) -> Result<Vec<CaseRecording>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, audio_url, position, is_transcribed
               FROM recordings WHERE case_id = ? ORDER BY position ASC"#,
        )?;
        let recordings = stmt
            .query_map(params![case_id], |row| {
                Ok(CaseRecording {
                    job_id: row.get(0)?,
                    audio_url: row.get(1)?,
                    position: row.get(2)?,
                    already_done: row.get::<_, i32>(3)? == 1,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(recordings)
    }

    pub fn get_recording(&self, recording_id: i64) -> Result<Option<Recording>> {
        let conn = self.conn()?;
        let recording = conn
            .query_row(
                r#"SELECT id, case_id, position, audio_url, is_transcribed,
                          transcription_status, transcription_error, transcribed_date
                   FROM recordings WHERE id = ?"#,
                params![recording_id],
                |row| {
                    Ok(Recording {
                        id: row.get(0)?,
                        case_id: row.get(1)?,
                        position: row.get(2)?,
                        audio_url: row.get(3)?,
                        is_transcribed: row.get::<_, i32>(4)? == 1,
                        transcription_status: row.get::<_, String>(5)?.into(),
                        transcription_error: row.get(6)?,
                        transcribed_date: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(recording)
    }

    pub fn is_recording_transcribed(&self, recording_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let flag: Option<i32> = conn
            .query_row(
                "SELECT is_transcribed FROM recordings WHERE id = ?",
                params![recording_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag == Some(1))
    }

    // =========================================================================
    // Job status transitions
    // =========================================================================

    /// Reset the dispatched recordings so stale failures from a previous run
    /// are not mistaken for this run's outcome.
    pub fn mark_recordings_queued(&self, recording_ids: &[i64]) -> Result<usize> {
        if recording_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let sql = format!(
            r#"UPDATE recordings
               SET transcription_status = 'queued', transcription_error = NULL
               WHERE is_transcribed = 0 AND id IN ({})"#,
            placeholders(recording_ids.len())
        );
        let count = conn.execute(&sql, params_from_iter(recording_ids.iter()))?;
        Ok(count)
    }

    pub fn mark_recording_processing(&self, recording_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE recordings SET transcription_status = 'processing' WHERE id = ? AND is_transcribed = 0",
            params![recording_id],
        )?;
        Ok(())
    }

    /// Persist a transcript and flag the recording as transcribed in one
    /// transaction. A second save for the same recording replaces the text.
    pub fn save_transcript(
        &self,
        case_id: i64,
        recording_id: i64,
        result: &TranscriptResult,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let metadata_json = serde_json::to_string(&result.metadata)?;
        tx.execute(
            r#"INSERT INTO transcripts
               (recording_id, case_id, full_text, language, confidence, duration_seconds,
                model_used, metadata_json)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(recording_id) DO UPDATE SET
                   full_text = excluded.full_text,
                   language = excluded.language,
                   confidence = excluded.confidence,
                   duration_seconds = excluded.duration_seconds,
                   model_used = excluded.model_used,
                   metadata_json = excluded.metadata_json,
                   created_date = datetime('now')"#,
            params![
                recording_id,
                case_id,
                result.text,
                result.language,
                result.confidence,
                result.duration_seconds,
                result.model_used,
                metadata_json
            ],
        )?;
        let updated = tx.execute(
            r#"UPDATE recordings
               SET is_transcribed = 1, transcription_status = 'completed',
                   transcription_error = NULL, transcribed_date = datetime('now')
               WHERE id = ? AND case_id = ?"#,
            params![recording_id, case_id],
        )?;
        if updated == 0 {
            return Err(anyhow!(
                "recording {} does not belong to case {}",
                recording_id,
                case_id
            ));
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a failure. A recording that is already transcribed keeps its
    /// completed state.
    pub fn mark_recording_failed(&self, recording_id: i64, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE recordings SET transcription_status = 'failed', transcription_error = ?
               WHERE id = ? AND is_transcribed = 0"#,
            params![error, recording_id],
        )?;
        Ok(())
    }

    pub fn get_transcript(&self, recording_id: i64) -> Result<Option<TranscriptData>> {
        let conn = self.conn()?;
        let transcript = conn
            .query_row(
                r#"SELECT recording_id, full_text, language, model_used, created_date
                   FROM transcripts WHERE recording_id = ?"#,
                params![recording_id],
                |row| {
                    Ok(TranscriptData {
                        recording_id: row.get(0)?,
                        full_text: row.get(1)?,
                        language: row.get(2)?,
                        model_used: row.get(3)?,
                        created_date: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(transcript)
    }

    // =========================================================================
    // Progress reads
    // =========================================================================

    /// Count how many of the given recordings are resolved, returned as
    /// `(transcribed, failed)`.
    pub fn count_resolved(&self, recording_ids: &[i64]) -> Result<(i64, i64)> {
        if recording_ids.is_empty() {
            return Ok((0, 0));
        }
        let conn = self.conn()?;
        let sql = format!(
            r#"SELECT
                   COALESCE(SUM(CASE WHEN is_transcribed = 1 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN is_transcribed = 0 AND transcription_status = 'failed'
                                     THEN 1 ELSE 0 END), 0)
               FROM recordings WHERE id IN ({})"#,
            placeholders(recording_ids.len())
        );
        let counts = conn.query_row(&sql, params_from_iter(recording_ids.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(counts)
    }

    pub fn case_progress(&self, case_id: i64) -> Result<CaseProgress> {
        let conn = self.conn()?;
        let progress = conn.query_row(
            r#"SELECT COUNT(*),
                      COALESCE(SUM(CASE WHEN is_transcribed = 1 THEN 1 ELSE 0 END), 0),
                      COALESCE(SUM(CASE WHEN is_transcribed = 0 AND transcription_status = 'failed'
                                        THEN 1 ELSE 0 END), 0)
               FROM recordings WHERE case_id = ?"#,
            params![case_id],
            |row| {
                Ok(CaseProgress {
                    total: row.get(0)?,
                    transcribed: row.get(1)?,
                    failed: row.get(2)?,
                })
            },
        )?;
        Ok(progress)
    }

    /// Stamp the case with the outcome of its latest run.
    pub fn mark_case_finished(&self, case_id: i64) -> Result<CaseState> {
        let progress = self.case_progress(case_id)?;
        let state = if progress.transcribed >= progress.total {
            CaseState::Transcribed
        } else {
            CaseState::Incomplete
        };
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cases SET status = ?, finished_date = datetime('now') WHERE id = ?",
            params![state.to_string(), case_id],
        )?;
        Ok(state)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
