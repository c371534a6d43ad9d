//! Active session tracking for the activity time ledger.
//!
//! A [`Tracker`] holds at most one open [`Session`] per user. Ending a
//! session queues it for a background worker that merges the elapsed time
//! into the [`Ledger`]; [`Tracker::snapshot`] checkpoints every open session
//! without ending it.
//!
//! # Runtime
//!
//! [`Tracker::open`] spawns the drain worker, so it must be called from
//! inside a Tokio runtime. Call [`Tracker::close`] before dropping the
//! tracker: it drains the queue, takes a final snapshot and closes the store.
//!
//! # Locking
//!
//! The active map and the ledger each sit behind a `std::sync::Mutex`.
//! Snapshots hold the map lock across the ledger write so an end request
//! cannot observe a session whose time is half flushed. Snapshots and end
//! processing therefore run on blocking threads; the runtime's own threads
//! take the map lock only for the short inserts and removals of
//! [`Tracker::start_session`] and [`Tracker::end_session`].

mod drain;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tally_core::{ActivityName, Session, UserId};
use tally_db::{Ledger, LedgerError, ResetOutcome};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use drain::DrainRequest;

/// Tracker errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// An error from the ledger.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// A blocking snapshot task panicked or was cancelled.
    #[error("snapshot task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// The drain worker is no longer running.
    #[error("session drain worker has stopped")]
    WorkerGone,
}

/// Result of [`Tracker::start_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Started {
    /// The user had no open session.
    New,
    /// The user was already in this activity; the running session is kept.
    AlreadyActive,
    /// The user's previous activity was ended and queued for persistence.
    Replaced(Session),
}

/// Counts from one snapshot pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub flushed: usize,
    pub failed: usize,
}

/// State shared with the drain worker.
pub(crate) struct Shared {
    active: Mutex<HashMap<UserId, Session>>,
    ledger: Mutex<Ledger>,
}

/// Tracks open sessions and persists their time.
pub struct Tracker {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<DrainRequest>,
    worker: JoinHandle<()>,
}

impl Tracker {
    /// Opens the ledger at `path` and starts the drain worker.
    pub fn open(path: &Path) -> Result<Self, TrackerError> {
        let ledger = Ledger::open(path)?;
        tracing::debug!(path = %path.display(), "ledger opened");
        Ok(Self::with_ledger(ledger))
    }

    /// Opens a tracker over an in-memory ledger.
    pub fn open_in_memory() -> Result<Self, TrackerError> {
        Ok(Self::with_ledger(Ledger::open_in_memory()?))
    }

    /// Wraps an already opened ledger and starts the drain worker.
    pub fn with_ledger(ledger: Ledger) -> Self {
        let shared = Arc::new(Shared {
            active: Mutex::new(HashMap::new()),
            ledger: Mutex::new(ledger),
        });
        let (requests, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain::run(Arc::clone(&shared), receiver));
        Self {
            shared,
            requests,
            worker,
        }
    }

    /// Starts a session for `user` now.
    pub fn start_session(&self, user: UserId, activity: ActivityName) -> Started {
        self.start_session_at(user, activity, Utc::now())
    }

    /// Starts a session for `user` at `at`.
    ///
    /// A running session for the same activity is left untouched. A running
    /// session for another activity is ended first, so its time is kept.
    pub fn start_session_at(
        &self,
        user: UserId,
        activity: ActivityName,
        at: DateTime<Utc>,
    ) -> Started {
        let previous = {
            let mut active = lock(&self.shared.active);
            if active
                .get(&user)
                .is_some_and(|current| current.activity == activity)
            {
                tracing::debug!(user = %user, activity = %activity, "session already active");
                return Started::AlreadyActive;
            }
            active.insert(user.clone(), Session::new(user.clone(), activity.clone(), at))
        };

        match previous {
            Some(previous) => {
                tracing::info!(
                    user = %user,
                    from = %previous.activity,
                    to = %activity,
                    "activity switched"
                );
                self.request_end_session(previous.clone());
                Started::Replaced(previous)
            }
            None => {
                tracing::info!(user = %user, activity = %activity, "session started");
                Started::New
            }
        }
    }

    /// Ends the user's open session, if any, and queues it for persistence.
    pub fn end_session(&self, user: &UserId) -> bool {
        let Some(session) = lock(&self.shared.active).remove(user) else {
            tracing::debug!(user = %user, "no session to end");
            return false;
        };
        tracing::info!(user = %user, activity = %session.activity, "session ended");
        self.request_end_session(session);
        true
    }

    /// Queues a finished session for persistence without blocking.
    ///
    /// If the session is still in the active map it is removed when the
    /// request is processed. Should the worker be gone, the session is
    /// persisted on the caller's thread instead of being dropped.
    pub fn request_end_session(&self, session: Session) {
        if let Err(mpsc::error::SendError(request)) =
            self.requests.send(DrainRequest::End(session))
        {
            tracing::warn!("session drain worker has stopped; persisting inline");
            if let DrainRequest::End(session) = request {
                let session = self.shared.claim(session);
                self.shared.persist(session);
            }
        }
    }

    /// Waits until every session queued before this call has been persisted.
    pub async fn settle(&self) -> Result<(), TrackerError> {
        let (done, wait) = oneshot::channel();
        self.requests
            .send(DrainRequest::Settle(done))
            .map_err(|_| TrackerError::WorkerGone)?;
        wait.await.map_err(|_| TrackerError::WorkerGone)
    }

    /// Flushes every open session's time so far, leaving them open.
    pub async fn snapshot(&self) -> Result<SnapshotStats, TrackerError> {
        self.snapshot_at(Utc::now()).await
    }

    /// Like [`Tracker::snapshot`] with an explicit checkpoint instant.
    ///
    /// The ledger transaction runs on a blocking thread.
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> Result<SnapshotStats, TrackerError> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.snapshot_at(now)).await?
    }

    /// Returns the open sessions, ordered by user.
    pub fn active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = lock(&self.shared.active).values().cloned().collect();
        sessions.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        sessions
    }

    /// Returns the user's persisted totals in nanoseconds.
    ///
    /// Time in a still-open session is not included until it is flushed.
    pub fn user_totals(&self, user: &UserId) -> Result<HashMap<String, i64>, TrackerError> {
        self.shared.with_ledger(|ledger| ledger.user_totals(user))
    }

    /// Removes all of the user's persisted totals.
    pub fn reset_user(&self, user: &UserId) -> Result<(), TrackerError> {
        self.shared.with_ledger(|ledger| ledger.reset_user(user))
    }

    /// Removes one activity from the user's persisted totals.
    pub fn reset_activity(
        &self,
        user: &UserId,
        activity: &ActivityName,
    ) -> Result<ResetOutcome, TrackerError> {
        self.shared
            .with_ledger(|ledger| ledger.reset_activity(user, activity))
    }

    /// Lists users with persisted totals.
    pub fn users(&self) -> Result<Vec<UserId>, TrackerError> {
        self.shared.with_ledger(|ledger| ledger.users())
    }

    /// Drains pending ends, takes a final snapshot and releases the store.
    ///
    /// Failures are logged; shutdown itself never fails.
    pub async fn close(self) {
        let Self {
            shared,
            requests,
            worker,
        } = self;
        drop(requests);
        if let Err(err) = worker.await {
            tracing::error!(error = %err, "session drain worker failed");
        }

        let final_pass = tokio::task::spawn_blocking(move || {
            match shared.snapshot_at(Utc::now()) {
                Ok(stats) => tracing::debug!(?stats, "final snapshot taken"),
                Err(err) => tracing::error!(error = %err, "final snapshot failed"),
            }
            // A snapshot task abandoned by its caller may still hold a handle;
            // the connection then closes when that task finishes.
            match Arc::try_unwrap(shared) {
                Ok(shared) => {
                    let ledger = shared
                        .ledger
                        .into_inner()
                        .unwrap_or_else(PoisonError::into_inner);
                    if let Err(err) = ledger.close() {
                        tracing::error!(error = %err, "failed to close ledger");
                    }
                }
                Err(_) => tracing::warn!("ledger still in use; it closes when released"),
            }
        })
        .await;
        if let Err(err) = final_pass {
            tracing::error!(error = %err, "final snapshot task failed");
        }
        tracing::info!("tracker closed");
    }
}

impl Shared {
    /// Removes the session from the active map if it is still there.
    ///
    /// Returns the map's copy in that case, whose start may have been
    /// advanced by a snapshot. A newer session for the same user stays.
    fn claim(&self, session: Session) -> Session {
        let mut active = lock(&self.active);
        let still_open = active
            .get(&session.user_id)
            .is_some_and(|current| current.is_same_session(&session));
        if still_open {
            active.remove(&session.user_id).unwrap_or(session)
        } else {
            session
        }
    }

    /// Merges a finished session into the ledger, logging the outcome.
    fn persist(&self, mut session: Session) {
        let now = Utc::now();
        let elapsed = session.unflushed(now);
        let mut ledger = lock(&self.ledger);
        match ledger.merge_session_at(&mut session, now) {
            Ok(total) => tracing::info!(
                user = %session.user_id,
                activity = %session.activity,
                elapsed_ms = elapsed.num_milliseconds(),
                total_ns = total,
                "session saved"
            ),
            Err(err) => tracing::error!(
                user = %session.user_id,
                activity = %session.activity,
                error = %err,
                "failed to save session"
            ),
        }
    }

    fn snapshot_at(&self, now: DateTime<Utc>) -> Result<SnapshotStats, TrackerError> {
        let mut active = lock(&self.active);
        if active.is_empty() {
            tracing::debug!("snapshot skipped; no open sessions");
            return Ok(SnapshotStats::default());
        }
        let sessions: Vec<Session> = active.values().cloned().collect();
        let results = lock(&self.ledger).merge_sessions_at(&sessions, now)?;

        let mut stats = SnapshotStats::default();
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(_) => {
                    if let Some(current) = active.get_mut(&session.user_id) {
                        current.started_at = current.started_at.max(now);
                    }
                    stats.flushed += 1;
                }
                Err(err) => {
                    tracing::error!(
                        user = %session.user_id,
                        activity = %session.activity,
                        error = %err,
                        "snapshot failed for session"
                    );
                    stats.failed += 1;
                }
            }
        }
        tracing::info!(flushed = stats.flushed, failed = stats.failed, "snapshot done");
        Ok(stats)
    }

    fn with_ledger<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> Result<T, LedgerError>,
    ) -> Result<T, TrackerError> {
        let mut ledger = lock(&self.ledger);
        Ok(f(&mut *ledger)?)
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    const SECOND: i64 = 1_000_000_000;
    /// Allowance for wall-clock time spent running the test itself.
    const SLACK: i64 = SECOND;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn activity(name: &str) -> ActivityName {
        ActivityName::new(name).unwrap()
    }

    fn ago(seconds: i64) -> DateTime<Utc> {
        Utc::now() - Duration::seconds(seconds)
    }

    fn total(tracker: &Tracker, user_id: &str, name: &str) -> i64 {
        *tracker
            .user_totals(&user(user_id))
            .unwrap()
            .get(name)
            .unwrap()
    }

    fn assert_about(actual: i64, seconds: i64) {
        let expected = seconds * SECOND;
        assert!(
            (expected..expected + SLACK).contains(&actual),
            "expected about {seconds}s, got {actual}ns"
        );
    }

    #[tokio::test]
    async fn sessions_accumulate_and_reset() {
        let tracker = Tracker::open_in_memory().unwrap();

        tracker.start_session_at(user("42"), activity("Chess"), ago(5));
        assert!(tracker.end_session(&user("42")));
        tracker.settle().await.unwrap();
        assert_about(total(&tracker, "42", "Chess"), 5);

        tracker.start_session_at(user("42"), activity("Chess"), ago(3));
        assert!(tracker.end_session(&user("42")));
        tracker.settle().await.unwrap();
        assert_about(total(&tracker, "42", "Chess"), 8);

        tracker.reset_user(&user("42")).unwrap();
        assert!(matches!(
            tracker.user_totals(&user("42")),
            Err(TrackerError::Ledger(LedgerError::UnknownUser { .. }))
        ));
        tracker.close().await;
    }

    #[tokio::test]
    async fn end_without_session_is_a_no_op() {
        let tracker = Tracker::open_in_memory().unwrap();
        assert!(!tracker.end_session(&user("42")));
        tracker.settle().await.unwrap();
        assert!(tracker.users().unwrap().is_empty());
        tracker.close().await;
    }

    #[tokio::test]
    async fn snapshot_then_end_counts_time_once() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(10));

        let stats = tracker.snapshot().await.unwrap();
        assert_eq!(stats, SnapshotStats { flushed: 1, failed: 0 });
        assert_about(total(&tracker, "42", "Chess"), 10);
        assert_eq!(tracker.active_sessions().len(), 1);

        tracker.end_session(&user("42"));
        tracker.settle().await.unwrap();
        assert_about(total(&tracker, "42", "Chess"), 10);
        tracker.close().await;
    }

    #[tokio::test]
    async fn stale_end_request_after_snapshot_counts_time_once() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(10));
        let stale = tracker.active_sessions().remove(0);

        tracker.snapshot().await.unwrap();
        tracker.request_end_session(stale);
        tracker.settle().await.unwrap();

        assert_about(total(&tracker, "42", "Chess"), 10);
        assert!(tracker.active_sessions().is_empty());
        tracker.close().await;
    }

    #[tokio::test]
    async fn snapshot_advances_start_and_keeps_session_open() {
        let tracker = Tracker::open_in_memory().unwrap();
        let opened = ago(60);
        tracker.start_session_at(user("42"), activity("Chess"), opened);

        let checkpoint = opened + Duration::seconds(30);
        tracker.snapshot_at(checkpoint).await.unwrap();

        let session = tracker.active_sessions().remove(0);
        assert_eq!(session.opened_at, opened);
        assert_eq!(session.started_at, checkpoint);
        assert_eq!(total(&tracker, "42", "Chess"), 30 * SECOND);
        tracker.close().await;
    }

    const HOLD: std::time::Duration = std::time::Duration::from_millis(500);

    /// Takes one of the tracker's locks on another thread and keeps it for
    /// [`HOLD`]. Returns once the lock is held.
    fn hold_locked<T: Send + 'static>(
        shared: &Arc<Shared>,
        field: fn(&Shared) -> &Mutex<T>,
    ) -> std::thread::JoinHandle<()> {
        let shared = Arc::clone(shared);
        let (taken, wait) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = lock(field(&shared));
            taken.send(()).unwrap();
            std::thread::sleep(HOLD);
        });
        wait.recv().unwrap();
        holder
    }

    #[tokio::test]
    async fn end_requests_do_not_stall_the_runtime_while_the_map_is_locked() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(3));
        let session = tracker.active_sessions().remove(0);

        // Same lock a long snapshot would hold.
        let holder = hold_locked(&tracker.shared, |shared| &shared.active);

        let began = std::time::Instant::now();
        tracker.request_end_session(session);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(began.elapsed() < HOLD / 2, "runtime stalled behind the map lock");

        holder.join().unwrap();
        tracker.settle().await.unwrap();
        assert_about(total(&tracker, "42", "Chess"), 3);
        assert!(tracker.active_sessions().is_empty());
        tracker.close().await;
    }

    #[tokio::test]
    async fn snapshot_waits_for_the_ledger_without_stalling_the_runtime() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(3));
        let holder = hold_locked(&tracker.shared, |shared| &shared.ledger);

        let began = std::time::Instant::now();
        let (stats, ticked) = tokio::join!(tracker.snapshot(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            began.elapsed()
        });
        assert!(ticked < HOLD / 2, "runtime stalled behind the snapshot");
        assert_eq!(stats.unwrap(), SnapshotStats { flushed: 1, failed: 0 });

        holder.join().unwrap();
        tracker.close().await;
    }

    #[tokio::test]
    async fn snapshot_without_sessions_flushes_nothing() {
        let tracker = Tracker::open_in_memory().unwrap();
        assert_eq!(tracker.snapshot().await.unwrap(), SnapshotStats::default());
        tracker.close().await;
    }

    #[tokio::test]
    async fn snapshot_failure_for_one_user_spares_the_others() {
        let tracker = Tracker::open_in_memory().unwrap();
        // A span this long cannot be expressed in nanoseconds.
        tracker.start_session_at(user("1"), activity("Chess"), DateTime::<Utc>::MIN_UTC);
        tracker.start_session_at(user("2"), activity("Go"), ago(4));

        let stats = tracker.snapshot().await.unwrap();
        assert_eq!(stats, SnapshotStats { flushed: 1, failed: 1 });
        assert_about(total(&tracker, "2", "Go"), 4);
        assert!(tracker.user_totals(&user("1")).is_err());

        let failed = tracker
            .active_sessions()
            .into_iter()
            .find(|session| session.user_id == user("1"))
            .unwrap();
        assert_eq!(failed.started_at, DateTime::<Utc>::MIN_UTC);
        tracker.close().await;
    }

    #[tokio::test]
    async fn switching_activity_flushes_the_previous_one() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(4));

        let started = tracker.start_session(user("42"), activity("Go"));
        assert!(matches!(started, Started::Replaced(ref prev) if prev.activity == activity("Chess")));
        tracker.settle().await.unwrap();

        assert_about(total(&tracker, "42", "Chess"), 4);
        let active = tracker.active_sessions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].activity, activity("Go"));
        tracker.close().await;
    }

    #[tokio::test]
    async fn restarting_same_activity_keeps_running_session() {
        let tracker = Tracker::open_in_memory().unwrap();
        let opened = ago(20);
        assert_eq!(
            tracker.start_session_at(user("42"), activity("Chess"), opened),
            Started::New
        );
        assert_eq!(
            tracker.start_session(user("42"), activity("Chess")),
            Started::AlreadyActive
        );
        assert_eq!(tracker.active_sessions()[0].started_at, opened);
        tracker.close().await;
    }

    #[tokio::test]
    async fn end_request_leaves_newer_session_alone() {
        let tracker = Tracker::open_in_memory().unwrap();
        let old = Session::new(user("42"), activity("Chess"), ago(6));
        tracker.start_session(user("42"), activity("Go"));

        tracker.request_end_session(old);
        tracker.settle().await.unwrap();

        assert_about(total(&tracker, "42", "Chess"), 6);
        assert_eq!(tracker.active_sessions()[0].activity, activity("Go"));
        tracker.close().await;
    }

    #[tokio::test]
    async fn sessions_for_many_users_are_saved_independently() {
        let tracker = Tracker::open_in_memory().unwrap();
        for id in 0..20 {
            tracker.start_session_at(user(&id.to_string()), activity("Chess"), ago(2));
        }
        for id in 0..20 {
            tracker.end_session(&user(&id.to_string()));
        }
        tracker.settle().await.unwrap();

        assert_eq!(tracker.users().unwrap().len(), 20);
        for id in 0..20 {
            assert_about(total(&tracker, &id.to_string(), "Chess"), 2);
        }
        tracker.close().await;
    }

    #[tokio::test]
    async fn close_persists_open_sessions() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tally.db");

        let tracker = Tracker::open(&path).unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(2));
        tracker.start_session_at(user("7"), activity("Go"), ago(9));
        tracker.end_session(&user("7"));
        tracker.close().await;

        let ledger = Ledger::open(&path).unwrap();
        let chess = ledger.user_totals(&user("42")).unwrap()["Chess"];
        let go = ledger.user_totals(&user("7")).unwrap()["Go"];
        assert_about(chess, 2);
        assert_about(go, 9);
    }

    #[tokio::test]
    async fn reset_activity_passes_through() {
        let tracker = Tracker::open_in_memory().unwrap();
        tracker.start_session_at(user("42"), activity("Chess"), ago(1));
        tracker.end_session(&user("42"));
        tracker.settle().await.unwrap();

        let outcome = tracker
            .reset_activity(&user("42"), &activity("Chess"))
            .unwrap();
        assert_eq!(outcome, ResetOutcome::UserRemoved);
        assert!(tracker.users().unwrap().is_empty());
        tracker.close().await;
    }
}
