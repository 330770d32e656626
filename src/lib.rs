// Library target exists to expose internal modules for integration tests
// and for the xtask binary (man page generation).
// The binary entry point is in main.rs.

mod cli;

pub mod cdp;
pub mod chrome;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod query_cache;
pub mod sessiondir;
pub mod telemetry;
pub mod worker;

/// Returns the clap `Command` definition for man page and completion
/// generation.
#[must_use]
pub fn command() -> clap::Command {
    <cli::Cli as clap::CommandFactory>::command()
}
