//! Durable call session store.
//!
//! SQLite-backed single source of truth for call state. Every state
//! transition is a conditional UPDATE pinned on `(call_id, expected
//! statuses)` and reports whether it won via `rows > 0` — the mutex
//! serializes statement execution, but correctness comes from the WHERE
//! clause, so concurrent accept/reject/timeout races resolve to exactly one
//! winner even across multiple scheduler replicas.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::error::{Error, Result};
use crate::session::{CallSession, CallStatus, CallType, ConnectionQuality};

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// Initial schema.
const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS call_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id TEXT NOT NULL UNIQUE,
    caller_id TEXT NOT NULL,
    caller_name TEXT NOT NULL DEFAULT '',
    callee_id TEXT NOT NULL,
    participants TEXT NOT NULL DEFAULT '[]',
    call_type TEXT NOT NULL DEFAULT 'audio',
    status TEXT NOT NULL DEFAULT 'initiated',
    started_at INTEGER NOT NULL,
    answered_at INTEGER,
    ended_at INTEGER,
    duration_secs INTEGER NOT NULL DEFAULT 0,
    timeout_at INTEGER NOT NULL,
    end_reason TEXT,
    connection_quality TEXT,
    network_info TEXT,
    archived INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_call_sessions_status
    ON call_sessions(status);
CREATE INDEX IF NOT EXISTS idx_call_sessions_timeout
    ON call_sessions(status, timeout_at);

CREATE TABLE IF NOT EXISTS push_tokens (
    user_id TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    platform TEXT NOT NULL DEFAULT 'fcm',
    updated_at INTEGER NOT NULL
);
";

/// SQL fragment matching every terminal status.
const TERMINAL_SET: &str = "('ended', 'missed', 'declined', 'rejected', 'failed')";

// ── SQL Conversions ───────────────────────────────────────────────────────────

impl ToSql for CallStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CallStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        CallStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for CallType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CallType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        CallType::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for ConnectionQuality {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ConnectionQuality {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        ConnectionQuality::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Columns selected for full session reads, in `session_from_row` order.
const SESSION_COLUMNS: &str = "call_id, caller_id, caller_name, callee_id, participants, \
     call_type, status, started_at, answered_at, ended_at, timeout_at, \
     end_reason, connection_quality, network_info, archived";

/// The call session database handle.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open or create the store.
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![SCHEMA_VERSION],
                )
                .map_err(|e| {
                    Error::DatabaseError(format!("Failed to set schema version: {}", e))
                })?;
                tracing::info!("Database schema created (version {})", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                tracing::debug!("Database schema up to date (version {})", v);
            }
            Some(v) => {
                return Err(Error::DatabaseError(format!(
                    "Unsupported schema version {} (expected {})",
                    v, SCHEMA_VERSION
                )));
            }
        }

        Ok(())
    }

    // ── Session CRUD ──────────────────────────────────────────────────────

    /// Insert a freshly created session.
    pub fn create_session(&self, session: &CallSession) -> Result<()> {
        let conn = self.conn.lock();
        let participants = serde_json::to_string(&session.participants)
            .map_err(|e| Error::DatabaseError(format!("Failed to encode participants: {}", e)))?;
        let network_info = match &session.network_info {
            Some(info) => Some(serde_json::to_string(info).map_err(|e| {
                Error::DatabaseError(format!("Failed to encode network info: {}", e))
            })?),
            None => None,
        };

        conn.execute(
            "INSERT INTO call_sessions (call_id, caller_id, caller_name, callee_id, participants, \
             call_type, status, started_at, answered_at, ended_at, duration_secs, timeout_at, \
             end_reason, connection_quality, network_info, archived)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                session.call_id,
                session.caller_id,
                session.caller_name,
                session.callee_id,
                participants,
                session.call_type,
                session.status,
                session.started_at,
                session.answered_at,
                session.ended_at,
                0i64,
                session.timeout_at,
                session.end_reason,
                session.connection_quality,
                network_info,
                session.archived as i64,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to store call session: {}", e)))?;

        Ok(())
    }

    /// Look up a session by call id.
    pub fn get_session(&self, call_id: &str) -> Result<Option<CallSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM call_sessions WHERE call_id = ?",
                SESSION_COLUMNS
            ),
            params![call_id],
            session_from_row,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to query call session: {}", e)))
    }

    // ── Conditional Transitions ───────────────────────────────────────────

    /// initiated → ringing. Returns false if the session already moved on.
    pub fn mark_ringing(&self, call_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE call_sessions SET status = 'ringing'
                 WHERE call_id = ? AND status = 'initiated'",
                params![call_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to mark ringing: {}", e)))?;
        Ok(rows > 0)
    }

    /// initiated/ringing → answered, recording the answer time.
    pub fn mark_answered(&self, call_id: &str, answered_at: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE call_sessions SET status = 'answered', answered_at = ?
                 WHERE call_id = ? AND status IN ('initiated', 'ringing')",
                params![answered_at, call_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to mark answered: {}", e)))?;
        Ok(rows > 0)
    }

    /// Move to a terminal status from any of `allowed_from`.
    ///
    /// Records `ended_at` and the reason, and computes the duration inside
    /// the statement (0 for calls that were never answered).
    pub fn mark_terminal(
        &self,
        call_id: &str,
        status: CallStatus,
        ended_at: i64,
        reason: Option<&str>,
        allowed_from: &[CallStatus],
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let from_set = allowed_from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.conn.lock();
        let rows = conn
            .execute(
                &format!(
                    "UPDATE call_sessions SET status = ?1, ended_at = ?2, end_reason = ?3,
                     duration_secs = CASE WHEN answered_at IS NOT NULL
                                          THEN MAX(?2 - answered_at, 0) ELSE 0 END
                     WHERE call_id = ?4 AND status IN ({})",
                    from_set
                ),
                params![status, ended_at, reason, call_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to end call session: {}", e)))?;
        Ok(rows > 0)
    }

    /// The sweep's per-row compare-and-swap: initiated/ringing → missed, but
    /// only once the deadline has actually passed. Two overlapping sweeps
    /// cannot both win.
    pub fn mark_missed(&self, call_id: &str, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE call_sessions SET status = 'missed', ended_at = ?2,
                 end_reason = 'ringing_timeout'
                 WHERE call_id = ?1 AND status IN ('initiated', 'ringing')
                   AND timeout_at <= ?2",
                params![call_id, now],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to mark missed: {}", e)))?;
        Ok(rows > 0)
    }

    /// Sessions still unanswered past their deadline — the sweep's
    /// candidate list. Winning the `mark_missed` CAS afterwards decides who
    /// processes each one.
    pub fn list_timed_out(&self, now: i64) -> Result<Vec<CallSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM call_sessions
                 WHERE status IN ('initiated', 'ringing') AND timeout_at <= ? AND archived = 0",
                SESSION_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![now], session_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query timed-out calls: {}", e)))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(|e| {
                Error::DatabaseError(format!("Failed to read call session: {}", e))
            })?);
        }
        Ok(sessions)
    }

    /// Consistency repair for reconnecting clients: force the given status,
    /// filling in whichever timestamps the transition implies, but never
    /// touch a terminal session and never "change" to the current status.
    ///
    /// Returns true when the status actually changed (callers broadcast only
    /// in that case).
    pub fn sync_status(&self, call_id: &str, status: CallStatus, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                &format!(
                    "UPDATE call_sessions SET status = ?2,
                     answered_at = CASE WHEN ?2 = 'answered' AND answered_at IS NULL
                                        THEN ?3 ELSE answered_at END,
                     ended_at = CASE WHEN ?2 IN {terminal} AND ended_at IS NULL
                                     THEN ?3 ELSE ended_at END,
                     duration_secs = CASE WHEN ?2 IN {terminal} AND answered_at IS NOT NULL
                                          THEN MAX(?3 - answered_at, 0) ELSE duration_secs END
                     WHERE call_id = ?1 AND status != ?2 AND status NOT IN {terminal}",
                    terminal = TERMINAL_SET
                ),
                params![call_id, status, now],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to sync call status: {}", e)))?;
        Ok(rows > 0)
    }

    /// Record the latest quality report. Active sessions only.
    pub fn update_quality(
        &self,
        call_id: &str,
        quality: ConnectionQuality,
        network_info: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let network_info = match network_info {
            Some(info) => Some(serde_json::to_string(info).map_err(|e| {
                Error::DatabaseError(format!("Failed to encode network info: {}", e))
            })?),
            None => None,
        };

        let conn = self.conn.lock();
        let rows = conn
            .execute(
                &format!(
                    "UPDATE call_sessions
                     SET connection_quality = ?2, network_info = COALESCE(?3, network_info)
                     WHERE call_id = ?1 AND status NOT IN {}",
                    TERMINAL_SET
                ),
                params![call_id, quality, network_info],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update quality: {}", e)))?;
        Ok(rows > 0)
    }

    /// Flag terminal sessions older than the cutoff as archived.
    /// Returns the number of rows flagged.
    pub fn archive_terminal_older_than(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                &format!(
                    "UPDATE call_sessions SET archived = 1
                     WHERE archived = 0 AND status IN {}
                       AND COALESCE(ended_at, started_at) < ?",
                    TERMINAL_SET
                ),
                params![cutoff],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to archive sessions: {}", e)))?;
        Ok(rows)
    }

    // ── Push Tokens ───────────────────────────────────────────────────────

    /// Register (or replace) a user's push token.
    pub fn register_push_token(&self, user_id: &str, token: &str, platform: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO push_tokens (user_id, token, platform, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                token = excluded.token,
                platform = excluded.platform,
                updated_at = excluded.updated_at",
            params![user_id, token, platform, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to register push token: {}", e)))?;
        Ok(())
    }

    /// Look up a user's push token.
    pub fn get_push_token(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token FROM push_tokens WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to query push token: {}", e)))
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    /// Session counts grouped by status.
    pub fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM call_sessions GROUP BY status")
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| Error::DatabaseError(format!("Failed to query status counts: {}", e)))?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(
                row.map_err(|e| Error::DatabaseError(format!("Failed to read count: {}", e)))?,
            );
        }
        Ok(counts)
    }

    /// Number of sessions not yet in a terminal state.
    pub fn active_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM call_sessions WHERE status NOT IN {}",
                TERMINAL_SET
            ),
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to count active calls: {}", e)))
    }
}

/// Build a `CallSession` from a `SESSION_COLUMNS` row.
fn session_from_row(row: &rusqlite::Row) -> rusqlite::Result<CallSession> {
    let participants_json: String = row.get(4)?;
    let participants = serde_json::from_str(&participants_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let network_info_json: Option<String> = row.get(13)?;
    let network_info = match network_info_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(CallSession {
        call_id: row.get(0)?,
        caller_id: row.get(1)?,
        caller_name: row.get(2)?,
        callee_id: row.get(3)?,
        participants,
        call_type: row.get(5)?,
        status: row.get(6)?,
        started_at: row.get(7)?,
        answered_at: row.get(8)?,
        ended_at: row.get(9)?,
        timeout_at: row.get(10)?,
        end_reason: row.get(11)?,
        connection_quality: row.get(12)?,
        network_info,
        archived: row.get::<_, i64>(14)? != 0,
    })
}
