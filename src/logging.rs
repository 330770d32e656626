//! File-backed `tracing` setup for the daemon and worker.
//!
//! Both long-lived processes append to their own log under the session
//! directory. Level is gated by the `BDG_LOG` environment variable
//! (`tracing_subscriber` env-filter syntax, default `info`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log filter.
pub const LOG_ENV: &str = "BDG_LOG";

/// Initialize append-only file logging. The returned guard must live for
/// the duration of the process or buffered lines are lost.
///
/// Initialization failures fall back to no logging rather than aborting;
/// the daemon and worker must come up even with a read-only home.
pub fn init_file_logging(dir: &Path, file_name: &str) -> Option<WorkerGuard> {
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init();

    match result {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}
