//! Daemon-side session state.
//!
//! The worker lifecycle is a four-state machine owned by the router task:
//! `NoWorker → Starting → Ready → Stopping → NoWorker`. Only `Ready` accepts
//! generic commands; `Starting` queues stop requests until the ready signal.

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::ipc::{Response, SessionSummary, TargetSummary};
use crate::sessiondir;

/// The one live session. Created on `worker_ready`, destroyed on stop,
/// crash, or daemon shutdown.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session_id: String,
    pub worker_pid: u32,
    pub chrome_pid: u32,
    pub port: u16,
    pub target: TargetSummary,
    pub started_at_iso: String,
    pub started_epoch: f64,
    pub active_telemetry: Vec<String>,
}

impl ActiveSession {
    /// Summary for `status` replies and `SESSION_ALREADY_RUNNING` conflicts.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let duration = (sessiondir::epoch_secs_f64() - self.started_epoch).max(0.0) as u64;
        SessionSummary {
            session_id: self.session_id.clone(),
            pid: self.worker_pid,
            chrome_pid: self.chrome_pid,
            port: self.port,
            target_url: self.target.url.clone(),
            target_title: Some(self.target.title.clone()),
            started_at: self.started_at_iso.clone(),
            duration,
            active_telemetry: self.active_telemetry.clone(),
        }
    }
}

/// Router lifecycle phase. Transitions happen only on the router task.
pub enum Phase {
    NoWorker,
    Starting {
        deadline: Instant,
        /// Replies to the `start_session_request` that spawned the worker.
        start_waiter: Option<oneshot::Sender<Response>>,
        /// Stop requests received before `worker_ready`; honored once ready.
        queued_stops: Vec<oneshot::Sender<Response>>,
    },
    Ready {
        session: ActiveSession,
    },
    Stopping {
        deadline: Instant,
        waiters: Vec<oneshot::Sender<Response>>,
        session: ActiveSession,
    },
}

impl Phase {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoWorker => "no-worker",
            Self::Starting { .. } => "starting",
            Self::Ready { .. } => "ready",
            Self::Stopping { .. } => "stopping",
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<&ActiveSession> {
        match self {
            Self::Ready { session } | Self::Stopping { session, .. } => Some(session),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session() -> ActiveSession {
        ActiveSession {
            session_id: "s-1".into(),
            worker_pid: 100,
            chrome_pid: 200,
            port: 9222,
            target: TargetSummary {
                url: "http://example.test".into(),
                title: "Example".into(),
            },
            started_at_iso: "2026-08-01T00:00:00Z".into(),
            started_epoch: 0.0,
            active_telemetry: vec!["network".into()],
        }
    }

    #[test]
    fn summary_carries_identity_and_duration() {
        let summary = make_session().summary();
        assert_eq!(summary.session_id, "s-1");
        assert_eq!(summary.pid, 100);
        assert_eq!(summary.chrome_pid, 200);
        assert_eq!(summary.target_url, "http://example.test");
        assert!(summary.duration > 0);
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::NoWorker.name(), "no-worker");
        assert_eq!(
            Phase::Ready {
                session: make_session()
            }
            .name(),
            "ready"
        );
    }

    #[test]
    fn only_ready_and_stopping_expose_a_session() {
        assert!(Phase::NoWorker.session().is_none());
        let ready = Phase::Ready {
            session: make_session(),
        };
        assert!(ready.session().is_some());
    }
}
