//! CLI subcommand implementations.

pub mod reset;
pub mod run;
pub mod status;
pub mod totals;
pub mod users;
