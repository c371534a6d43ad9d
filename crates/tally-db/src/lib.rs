//! Durable ledger of accumulated activity time.
//!
//! Persists per-user, per-activity totals using `rusqlite`. Every operation
//! runs in a single SQLite transaction, so a crash leaves either the old or
//! the new total on disk, never a mix.
//!
//! # Thread Safety
//!
//! The [`Ledger`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Share it across threads behind a `Mutex<Ledger>`; that also serializes
//! write transactions, so two merges for the same user never interleave.
//!
//! # Schema
//!
//! One row in `users` per user record (the group), one row in `totals` per
//! activity within it. Deleting a user cascades to its totals.
//!
//! ## Duration Storage
//!
//! The `elapsed` column stores the total as a BLOB in the versioned varint
//! format of [`tally_core::codec`]. A value that fails to decode is read as
//! zero and logged; it is overwritten by the next merge for that activity.
//!
//! ## Timestamp Format
//!
//! `created_at` and `updated_at` are TEXT in ISO 8601 UTC
//! (e.g. `2024-01-15T10:30:00.000Z`) so lexicographic order matches time order.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tally_core::{ActivityName, Session, UserId, ValidationError, decode_nanos, encode_nanos};
use thiserror::Error;

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The user has no record: they never played anything.
    #[error("user {user} never played")]
    UnknownUser { user: String },
    /// The user has a record but not for this activity.
    #[error("user {user} never played {activity}")]
    UnknownActivity { user: String, activity: String },
    /// The new total does not fit in a signed 64-bit nanosecond count.
    #[error("accumulated time for {user} on {activity} overflows")]
    DurationOverflow { user: String, activity: String },
    /// A stored identifier failed validation.
    #[error("invalid stored record: {0}")]
    InvalidRecord(#[from] ValidationError),
}

/// What a partial reset removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The activity was the user's last one, so the whole record went with it.
    UserRemoved,
    /// Only the activity's entry was removed.
    ActivityRemoved,
}

/// Ledger connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Opens a ledger at the given path, creating it if necessary.
    ///
    /// The schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init()?;
        Ok(ledger)
    }

    /// Opens an in-memory ledger.
    ///
    /// Useful for testing. The data is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.init()?;
        Ok(ledger)
    }

    /// Initializes the schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            -- elapsed: versioned zig-zag varint of accumulated nanoseconds
            CREATE TABLE IF NOT EXISTS totals (
                user_id TEXT NOT NULL,
                activity TEXT NOT NULL,
                elapsed BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, activity),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    /// Adds the time elapsed since `since` to the user's total for `activity`.
    ///
    /// Returns the new total in nanoseconds. The caller owns the session and
    /// must advance its start to the merge instant afterwards; use
    /// [`Ledger::merge_session_at`] to have that done for you.
    pub fn merge(
        &mut self,
        user: &UserId,
        activity: &ActivityName,
        since: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        self.merge_at(user, activity, since, Utc::now())
    }

    /// Like [`Ledger::merge`] with an explicit merge instant.
    pub fn merge_at(
        &mut self,
        user: &UserId,
        activity: &ActivityName,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let tx = self.conn.transaction()?;
        let total = merge_in(&tx, user, activity, since, now)?;
        tx.commit()?;
        Ok(total)
    }

    /// Merges a session's unflushed time and advances its start to `now`.
    pub fn merge_session_at(
        &mut self,
        session: &mut Session,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let total = self.merge_at(&session.user_id, &session.activity, session.started_at, now)?;
        session.started_at = session.started_at.max(now);
        Ok(total)
    }

    /// Merges many sessions inside one transaction.
    ///
    /// Each session is applied under its own savepoint: a failure rolls back
    /// only that session and is reported in its slot of the returned vector.
    /// An error from the outer `Result` means nothing was committed.
    pub fn merge_sessions_at(
        &mut self,
        sessions: &[Session],
        now: DateTime<Utc>,
    ) -> Result<Vec<Result<i64, LedgerError>>, LedgerError> {
        let mut tx = self.conn.transaction()?;
        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            let sp = tx.savepoint()?;
            match merge_in(&sp, &session.user_id, &session.activity, session.started_at, now) {
                Ok(total) => {
                    sp.commit()?;
                    results.push(Ok(total));
                }
                // Dropping the savepoint rolls it back.
                Err(err) => results.push(Err(err)),
            }
        }
        tx.commit()?;
        Ok(results)
    }

    /// Returns every recorded activity total for the user, in nanoseconds.
    ///
    /// Fails with [`LedgerError::UnknownUser`] when the user has no record,
    /// so "never played" is distinguishable from "played for zero time".
    pub fn user_totals(&self, user: &UserId) -> Result<HashMap<String, i64>, LedgerError> {
        if !user_exists(&self.conn, user)? {
            return Err(unknown_user(user));
        }
        let mut stmt = self
            .conn
            .prepare("SELECT activity, elapsed FROM totals WHERE user_id = ?")?;
        let rows = stmt.query_map([user.as_str()], |row| {
            let activity: String = row.get(0)?;
            let elapsed: Vec<u8> = row.get(1)?;
            Ok((activity, elapsed))
        })?;
        let mut totals = HashMap::new();
        for row in rows {
            let (activity, elapsed) = row?;
            let nanos = decode_or_zero(user.as_str(), &activity, &elapsed);
            totals.insert(activity, nanos);
        }
        Ok(totals)
    }

    /// Removes the user's whole record.
    pub fn reset_user(&mut self, user: &UserId) -> Result<(), LedgerError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM users WHERE id = ?", [user.as_str()])?;
        if removed == 0 {
            return Err(unknown_user(user));
        }
        tx.commit()?;
        tracing::info!(user = %user, "user record reset");
        Ok(())
    }

    /// Removes one activity from the user's record.
    ///
    /// If it was the only activity the whole record is removed, so no empty
    /// group is left behind. Nothing is deleted when the activity is unknown.
    pub fn reset_activity(
        &mut self,
        user: &UserId,
        activity: &ActivityName,
    ) -> Result<ResetOutcome, LedgerError> {
        let tx = self.conn.transaction()?;
        if !user_exists(&tx, user)? {
            return Err(unknown_user(user));
        }
        let present = tx
            .query_row(
                "SELECT 1 FROM totals WHERE user_id = ? AND activity = ?",
                params![user.as_str(), activity.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !present {
            return Err(LedgerError::UnknownActivity {
                user: user.to_string(),
                activity: activity.to_string(),
            });
        }
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM totals WHERE user_id = ?",
            [user.as_str()],
            |row| row.get(0),
        )?;
        let outcome = if count == 1 {
            tx.execute("DELETE FROM users WHERE id = ?", [user.as_str()])?;
            ResetOutcome::UserRemoved
        } else {
            tx.execute(
                "DELETE FROM totals WHERE user_id = ? AND activity = ?",
                params![user.as_str(), activity.as_str()],
            )?;
            ResetOutcome::ActivityRemoved
        };
        tx.commit()?;
        tracing::info!(user = %user, activity = %activity, ?outcome, "activity reset");
        Ok(outcome)
    }

    /// Lists users that have a record, ordered by ID.
    pub fn users(&self) -> Result<Vec<UserId>, LedgerError> {
        let mut stmt = self.conn.prepare("SELECT id FROM users ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(UserId::new(row?)?);
        }
        Ok(users)
    }

    /// Closes the connection, reporting any error SQLite raises on close.
    pub fn close(self) -> Result<(), LedgerError> {
        self.conn.close().map_err(|(_, err)| LedgerError::Sqlite(err))
    }
}

/// Merge step shared by the single and batched entry points.
///
/// `conn` is a transaction or savepoint owned by the caller.
fn merge_in(
    conn: &Connection,
    user: &UserId,
    activity: &ActivityName,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    let stamp = format_timestamp(now);
    conn.execute(
        "INSERT OR IGNORE INTO users (id, created_at) VALUES (?, ?)",
        params![user.as_str(), stamp],
    )?;

    let prior = conn
        .query_row(
            "SELECT elapsed FROM totals WHERE user_id = ? AND activity = ?",
            params![user.as_str(), activity.as_str()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .map(|bytes| decode_or_zero(user.as_str(), activity.as_str(), &bytes));

    let now = if now < since {
        tracing::warn!(
            user = %user,
            activity = %activity,
            %since,
            %now,
            "clock moved backwards; counting no time for this merge"
        );
        since
    } else {
        now
    };

    let total = accumulate(prior, since, now).ok_or_else(|| LedgerError::DurationOverflow {
        user: user.to_string(),
        activity: activity.to_string(),
    })?;

    conn.execute(
        "
        INSERT INTO totals (user_id, activity, elapsed, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(user_id, activity) DO UPDATE SET
            elapsed = excluded.elapsed,
            updated_at = excluded.updated_at
        ",
        params![user.as_str(), activity.as_str(), encode_nanos(total), stamp],
    )?;
    tracing::debug!(user = %user, activity = %activity, total_ns = total, "merged session time");
    Ok(total)
}

/// New total after adding the span `since..now` to `prior`.
///
/// With a prior total, "now" is shifted forward by it before subtracting the
/// start, which equals `prior + (now - since)` in one duration step.
/// Returns `None` on overflow.
fn accumulate(prior: Option<i64>, since: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
    match prior {
        None => (now - since).num_nanoseconds(),
        Some(prior) => {
            let shifted = now.checked_add_signed(chrono::Duration::nanoseconds(prior))?;
            (shifted - since).num_nanoseconds()
        }
    }
}

fn decode_or_zero(user: &str, activity: &str, bytes: &[u8]) -> i64 {
    decode_nanos(bytes).unwrap_or_else(|err| {
        tracing::warn!(%user, %activity, error = %err, "stored total is corrupt; reading as zero");
        0
    })
}

fn user_exists(conn: &Connection, user: &UserId) -> Result<bool, LedgerError> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [user.as_str()], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn unknown_user(user: &UserId) -> LedgerError {
    LedgerError::UnknownUser {
        user: user.to_string(),
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
