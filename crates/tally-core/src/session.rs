//! In-progress activity sessions.

use chrono::{DateTime, Utc};

use crate::types::{ActivityName, UserId};

/// One contiguous stretch of a user engaged in one activity.
///
/// `started_at` marks the first instant not yet persisted; it moves forward
/// every time the session's elapsed time is merged into the ledger.
/// `opened_at` never moves and identifies the session across those merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub activity: ActivityName,
    pub opened_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// Creates a session that began at `at`.
    pub const fn new(user_id: UserId, activity: ActivityName, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            activity,
            opened_at: at,
            started_at: at,
        }
    }

    /// Whether `other` is the same logical session, regardless of how far its
    /// `started_at` has been advanced.
    pub fn is_same_session(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.activity == other.activity
            && self.opened_at == other.opened_at
    }

    /// Time not yet persisted as of `now`, floored at zero.
    pub fn unflushed(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.started_at).max(chrono::Duration::zero())
    }
}
