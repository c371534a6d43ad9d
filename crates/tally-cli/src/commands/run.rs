//! Run command: tracks sessions from line events on stdin.
//!
//! Stands in for a chat integration's presence feed. Each line is one event:
//!
//! ```text
//! start 42 Rocket League
//! end 42
//! snapshot
//! ```
//!
//! Open sessions are snapshotted every `snapshot_interval_secs` and once more
//! on shutdown, which happens at end of input or on Ctrl-C.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use tally_core::{ActivityName, UserId};
use tally_tracker::{Started, Tracker};

use crate::Config;

/// One inbound presence event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start { user: UserId, activity: ActivityName },
    End { user: UserId },
    Snapshot,
}

/// Parses one input line. Blank lines and `#` comments yield `None`.
pub fn parse_event(line: &str) -> Result<Option<Event>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let event = match verb {
        "start" => {
            let Some((user, activity)) = rest.split_once(char::is_whitespace) else {
                bail!("expected `start <user> <activity>`, got: {line}");
            };
            Event::Start {
                user: UserId::new(user)?,
                activity: ActivityName::new(activity.trim())?,
            }
        }
        "end" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                bail!("expected `end <user>`, got: {line}");
            }
            Event::End {
                user: UserId::new(rest)?,
            }
        }
        "snapshot" if rest.is_empty() => Event::Snapshot,
        _ => bail!("unknown event: {line}"),
    };
    Ok(Some(event))
}

pub fn run(config: &Config) -> Result<()> {
    if config.snapshot_interval_secs == 0 {
        bail!("snapshot_interval_secs must be at least 1");
    }
    let every = Duration::from_secs(config.snapshot_interval_secs);

    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    runtime.block_on(async {
        let tracker = Tracker::open(&config.database_path)
            .with_context(|| format!("failed to open {}", config.database_path.display()))?;
        tracing::info!(
            database = %config.database_path.display(),
            snapshot_interval_secs = config.snapshot_interval_secs,
            "tracking sessions from stdin"
        );

        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("interrupted");
        };
        let result = serve(BufReader::new(tokio::io::stdin()), &tracker, every, shutdown).await;
        tracker.close().await;
        result
    })
}

/// Applies events from `input` until it ends or `shutdown` resolves.
///
/// Does not close the tracker; the caller owns its lifecycle.
pub async fn serve<R, F>(input: R, tracker: &Tracker, every: Duration, shutdown: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    // Raw segments, so one line of bad bytes does not end the feed.
    let mut lines = input.split(b'\n');
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing is open yet.
    ticker.tick().await;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_segment() => {
                let Some(line) = line.context("failed to read event")? else {
                    tracing::debug!("input closed");
                    break;
                };
                let Ok(line) = std::str::from_utf8(&line) else {
                    tracing::warn!(bytes = line.len(), "ignoring event that is not UTF-8");
                    continue;
                };
                match parse_event(line) {
                    Ok(Some(event)) => apply(tracker, event).await,
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "ignoring malformed event"),
                }
            }
            _ = ticker.tick() => checkpoint(tracker).await,
            () = &mut shutdown => break,
        }
    }
    Ok(())
}

async fn apply(tracker: &Tracker, event: Event) {
    match event {
        Event::Start { user, activity } => {
            if let Started::Replaced(previous) = tracker.start_session(user, activity) {
                tracing::debug!(activity = %previous.activity, "previous session queued");
            }
        }
        Event::End { user } => {
            tracker.end_session(&user);
        }
        Event::Snapshot => checkpoint(tracker).await,
    }
}

async fn checkpoint(tracker: &Tracker) {
    if let Err(err) = tracker.snapshot().await {
        tracing::error!(error = %err, "snapshot failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tally_db::Ledger;
    use tokio::io::AsyncWriteExt;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn parses_start_with_multi_word_activity() {
        assert_eq!(
            parse_event("start 42   Rocket League ").unwrap(),
            Some(Event::Start {
                user: user("42"),
                activity: ActivityName::new("Rocket League").unwrap(),
            })
        );
    }

    #[test]
    fn parses_end_and_snapshot() {
        assert_eq!(
            parse_event("end 42").unwrap(),
            Some(Event::End { user: user("42") })
        );
        assert_eq!(parse_event("snapshot").unwrap(), Some(Event::Snapshot));
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        assert_eq!(parse_event("   ").unwrap(), None);
        assert_eq!(parse_event("# presence feed").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_event("start 42").is_err());
        assert!(parse_event("end").is_err());
        assert!(parse_event("end 42 43").is_err());
        assert!(parse_event("snapshot now").is_err());
        assert!(parse_event("pause 42").is_err());
    }

    #[tokio::test]
    async fn serve_applies_events_until_input_ends() {
        let tracker = Tracker::open_in_memory().unwrap();
        let input: &[u8] = b"start 42 Chess\nbogus\nstart 7 Go\nend 42\n";

        serve(
            input,
            &tracker,
            Duration::from_secs(3600),
            std::future::pending(),
        )
        .await
        .unwrap();
        tracker.settle().await.unwrap();

        assert!(tracker.user_totals(&user("42")).unwrap().contains_key("Chess"));
        let active = tracker.active_sessions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, user("7"));
        tracker.close().await;
    }

    #[tokio::test]
    async fn serve_skips_lines_that_are_not_utf8() {
        let tracker = Tracker::open_in_memory().unwrap();
        let input: &[u8] = b"start 42 Chess\n\xff\xfe\nstart 7 Go\n";

        serve(
            input,
            &tracker,
            Duration::from_secs(3600),
            std::future::pending(),
        )
        .await
        .unwrap();

        let users: Vec<UserId> = tracker
            .active_sessions()
            .into_iter()
            .map(|session| session.user_id)
            .collect();
        assert_eq!(users, vec![user("42"), user("7")]);
        tracker.close().await;
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_and_close_saves_open_sessions() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tally.db");
        let tracker = Tracker::open(&path).unwrap();

        // The writer stays open, so only the shutdown future can end serve.
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"start 42 Chess\n").await.unwrap();
        let started = async {
            while tracker.active_sessions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        serve(BufReader::new(reader), &tracker, Duration::from_secs(3600), started)
            .await
            .unwrap();
        tracker.close().await;
        drop(writer);

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.user_totals(&user("42")).unwrap().contains_key("Chess"));
    }
}
