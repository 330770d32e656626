//! Worker-local telemetry store: bounded network and console buffers, the
//! navigation log, and the latest DOM/a11y snapshot.

mod filter;
mod types;

pub use filter::{TypeFilterError, is_noise_url, parse_resource_types};
pub use types::{
    ConsoleLevel, ConsoleMessage, DomNodeSummary, DomQueryResult, NavigationEvent, NavigationKind,
    NetworkRequest, ResourceType, StackFrame,
};

use serde_json::Value;
use tracing::warn;

use crate::ipc::TargetSummary;

/// Buffer caps. Crossing a cap drops the incoming entry and logs one warning.
pub const MAX_NETWORK_REQUESTS: usize = 10_000;
pub const MAX_CONSOLE_MESSAGES: usize = 10_000;

/// An append-only list that refuses entries past its cap.
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    items: Vec<T>,
    cap: usize,
    label: &'static str,
    overflow_warned: bool,
}

impl<T> BoundedBuffer<T> {
    #[must_use]
    pub fn new(cap: usize, label: &'static str) -> Self {
        Self {
            items: Vec::new(),
            cap,
            label,
            overflow_warned: false,
        }
    }

    /// Append if below the cap. Returns `false` when the entry was dropped.
    pub fn push(&mut self, item: T) -> bool {
        if self.items.len() < self.cap {
            self.items.push(item);
            return true;
        }
        if !self.overflow_warned {
            self.overflow_warned = true;
            warn!(
                buffer = self.label,
                cap = self.cap,
                "telemetry buffer full, dropping further entries"
            );
        }
        false
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The last `n` entries in arrival order; `n == 0` means everything.
    #[must_use]
    pub fn tail(&self, n: usize) -> &[T] {
        if n == 0 || n >= self.items.len() {
            &self.items
        } else {
            &self.items[self.items.len() - n..]
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}

/// Worker-local telemetry container. One per session, constructor-injected.
#[derive(Debug)]
pub struct TelemetryStore {
    network: BoundedBuffer<NetworkRequest>,
    console: BoundedBuffer<ConsoleMessage>,
    navigations: Vec<NavigationEvent>,
    nav_counter: u64,
    latest_snapshot: Option<Value>,
    target: Option<TargetSummary>,
    started_at: f64,
    active_telemetry: Vec<String>,
}

impl TelemetryStore {
    #[must_use]
    pub fn new(started_at: f64) -> Self {
        Self {
            network: BoundedBuffer::new(MAX_NETWORK_REQUESTS, "network"),
            console: BoundedBuffer::new(MAX_CONSOLE_MESSAGES, "console"),
            navigations: Vec::new(),
            nav_counter: 0,
            latest_snapshot: None,
            target: None,
            started_at,
            active_telemetry: Vec::new(),
        }
    }

    // --- network ---

    /// Record a new request, or apply nothing if one with this CDP request id
    /// already exists (redirect hops update in place via `update_request`).
    pub fn record_request(&mut self, request: NetworkRequest) {
        if self
            .network
            .as_slice()
            .iter()
            .any(|r| r.request_id == request.request_id)
        {
            return;
        }
        self.network.push(request);
    }

    /// Mutate an existing request in place, keyed by CDP request id.
    pub fn update_request<F>(&mut self, request_id: &str, apply: F)
    where
        F: FnOnce(&mut NetworkRequest),
    {
        if let Some(req) = self
            .network
            .iter_mut()
            .find(|r| r.request_id == request_id)
        {
            apply(req);
        }
    }

    #[must_use]
    pub fn network_tail(&self, n: usize) -> Vec<NetworkRequest> {
        self.network.tail(n).to_vec()
    }

    #[must_use]
    pub fn network_len(&self) -> usize {
        self.network.len()
    }

    #[must_use]
    pub fn find_request(&self, request_id: &str) -> Option<&NetworkRequest> {
        self.network
            .as_slice()
            .iter()
            .find(|r| r.request_id == request_id)
    }

    // --- console ---

    pub fn record_console(&mut self, message: ConsoleMessage) {
        self.console.push(message);
    }

    #[must_use]
    pub fn console_tail(&self, n: usize) -> Vec<ConsoleMessage> {
        self.console.tail(n).to_vec()
    }

    #[must_use]
    pub fn console_len(&self) -> usize {
        self.console.len()
    }

    // --- navigation ---

    /// Record a top-frame navigation and return its id.
    ///
    /// The counter is monotonically non-decreasing for the session lifetime.
    pub fn record_navigation(&mut self, url: &str, timestamp: f64, kind: NavigationKind) -> u64 {
        self.nav_counter += 1;
        let event = NavigationEvent {
            id: self.nav_counter,
            url: url.to_owned(),
            timestamp,
            kind,
        };
        self.navigations.push(event);
        self.nav_counter
    }

    /// The current authoritative navigation id.
    #[must_use]
    pub fn navigation_id(&self) -> u64 {
        self.nav_counter
    }

    #[must_use]
    pub fn navigations(&self) -> &[NavigationEvent] {
        &self.navigations
    }

    // --- snapshot / session metadata ---

    pub fn set_snapshot(&mut self, snapshot: Value) {
        self.latest_snapshot = Some(snapshot);
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&Value> {
        self.latest_snapshot.as_ref()
    }

    pub fn set_target(&mut self, target: TargetSummary) {
        self.target = Some(target);
    }

    #[must_use]
    pub fn target(&self) -> Option<&TargetSummary> {
        self.target.as_ref()
    }

    #[must_use]
    pub fn started_at(&self) -> f64 {
        self.started_at
    }

    pub fn set_active_telemetry(&mut self, kinds: Vec<String>) {
        self.active_telemetry = kinds;
    }

    #[must_use]
    pub fn active_telemetry(&self) -> &[String] {
        &self.active_telemetry
    }
}
