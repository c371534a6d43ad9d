//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::reset::ResetArgs;
use crate::commands::totals::TotalsArgs;

/// Activity time ledger.
///
/// Tracks how long each user spends in each activity and keeps the running
/// totals in a local database.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Track sessions from events read on stdin until EOF or Ctrl-C.
    ///
    /// One event per line: `start <user> <activity>`, `end <user>` or
    /// `snapshot`. Blank lines and lines starting with `#` are ignored.
    Run,

    /// Show accumulated time per activity for a user.
    Totals(TotalsArgs),

    /// Reset a user's accumulated time.
    Reset(ResetArgs),

    /// List users with recorded time.
    Users,

    /// Show database location and user count.
    Status,
}
