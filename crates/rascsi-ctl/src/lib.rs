//! Operator command line for the RaSCSI engine and its image store.
//!
//! Each invocation runs one subcommand and prints its result envelope as
//! JSON; `list` also prints a device table.

pub mod cli;
pub mod commands;

pub use cli::{Cli, CliLogFormat, Command};
pub use commands::{HostReport, Output, device_table, execute};

use rascsi_core::{ReservationStore, Result};
use rascsi_files::FileManager;

/// Run the parsed command against the configured engine.
pub async fn run(cli: &Cli) -> Result<Output> {
    let manager = FileManager::from_settings(&cli.settings(), ReservationStore::new());
    execute(&manager, &cli.command).await
}
