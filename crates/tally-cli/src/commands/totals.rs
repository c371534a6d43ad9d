//! Totals command for showing a user's accumulated time.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use tally_core::UserId;
use tally_db::Ledger;

use crate::Config;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Debug, Args)]
pub struct TotalsArgs {
    /// User ID to report on.
    pub user: String,
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// One activity's total, for display.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityTotal {
    pub activity: String,
    pub nanos: i64,
}

#[derive(Debug, Serialize)]
struct TotalsReport<'a> {
    user: &'a str,
    activities: &'a [ActivityTotal],
}

pub fn run<W: Write>(writer: &mut W, args: &TotalsArgs, config: &Config) -> Result<()> {
    let user = UserId::new(args.user.as_str())?;
    let ledger = Ledger::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let activities = sorted_totals(&ledger, &user)?;

    if args.json {
        let report = TotalsReport {
            user: user.as_str(),
            activities: &activities,
        };
        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writeln!(writer)?;
    } else {
        write_table(writer, &activities)?;
    }
    Ok(())
}

/// Returns the user's totals, longest first, ties by name.
pub fn sorted_totals(ledger: &Ledger, user: &UserId) -> Result<Vec<ActivityTotal>> {
    let mut activities: Vec<ActivityTotal> = ledger
        .user_totals(user)?
        .into_iter()
        .map(|(activity, nanos)| ActivityTotal { activity, nanos })
        .collect();
    activities.sort_by(|a, b| b.nanos.cmp(&a.nanos).then_with(|| a.activity.cmp(&b.activity)));
    Ok(activities)
}

fn write_table<W: Write>(writer: &mut W, activities: &[ActivityTotal]) -> Result<()> {
    let width = activities
        .iter()
        .map(|entry| entry.activity.chars().count())
        .max()
        .unwrap_or(0);
    for entry in activities {
        writeln!(
            writer,
            "{:<width$}  {}",
            entry.activity,
            format_duration(entry.nanos)
        )?;
    }
    Ok(())
}

/// Formats a nanosecond count as `1h 2m`, `3m 4s` or `5s`.
pub fn format_duration(nanos: i64) -> String {
    if nanos < 0 {
        return "0s".to_string();
    }
    let total_seconds = nanos / NANOS_PER_SECOND;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours >= 1 {
        format!("{hours}h {minutes}m")
    } else if minutes >= 1 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
