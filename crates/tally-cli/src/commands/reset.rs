//! Reset command for clearing accumulated time.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use tally_core::{ActivityName, UserId};
use tally_db::{Ledger, ResetOutcome};

use crate::Config;

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// User ID to reset.
    pub user: String,
    /// Only reset this activity.
    #[arg(long)]
    pub activity: Option<String>,
}

pub fn run<W: Write>(writer: &mut W, args: &ResetArgs, config: &Config) -> Result<()> {
    let user = UserId::new(args.user.as_str())?;
    let mut ledger = Ledger::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    match args.activity.as_deref() {
        None => {
            ledger.reset_user(&user)?;
            writeln!(writer, "Reset all time for {user}")?;
        }
        Some(activity) => {
            let activity = ActivityName::new(activity)?;
            match ledger.reset_activity(&user, &activity)? {
                ResetOutcome::ActivityRemoved => {
                    writeln!(writer, "Reset {activity} for {user}")?;
                }
                ResetOutcome::UserRemoved => {
                    writeln!(writer, "Reset {activity} for {user} (no activities left)")?;
                }
            }
        }
    }
    Ok(())
}
