//! CDP event collectors. Each collector subscribes to its domain events on
//! the worker's CDP connection and appends to the `TelemetryStore`. The
//! worker's lifecycle owner keeps the returned handles and closes them in
//! reverse order on shutdown.

mod console;
mod navigation;
mod network;

pub use console::start_console_collector;
pub use navigation::start_navigation_collector;
pub use network::start_network_collector;

use tokio::task::JoinHandle;

/// A running collector: its name (for the session's active-telemetry set)
/// plus the subscription task.
pub struct CollectorHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    #[must_use]
    pub fn new(name: &'static str, task: JoinHandle<()>) -> Self {
        Self { name, task }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the collector. Event receivers are dropped with the task, which
    /// unregisters the transport subscriptions.
    pub fn close(self) {
        self.task.abort();
    }
}
