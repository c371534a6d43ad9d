//! Users command for listing users with recorded time.

use std::io::Write;

use anyhow::{Context, Result};

use tally_db::Ledger;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let ledger = Ledger::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    for user in ledger.users()? {
        writeln!(writer, "{user}")?;
    }
    Ok(())
}
