//! Status command for showing where the ledger lives and what it holds.

use std::io::Write;

use anyhow::{Context, Result};

use tally_db::Ledger;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let ledger = Ledger::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let users = ledger.users()?;

    writeln!(writer, "Activity ledger status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(
        writer,
        "Snapshot interval: {}s",
        config.snapshot_interval_secs
    )?;

    if users.is_empty() {
        writeln!(writer, "No time recorded.")?;
    } else {
        writeln!(writer, "Users: {}", users.len())?;
    }
    Ok(())
}
