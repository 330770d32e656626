//! The daemon's request router.
//!
//! A single dispatcher task owns the worker lifecycle, the pending-request
//! table, and the worker pipe. Client connection tasks hand it requests over
//! a channel and await exactly one response each; the worker's stdout reader
//! feeds it classified messages. Because all of this state lives on one
//! task, no lock is ever held across a suspension point.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::state::{ActiveSession, Phase};
use super::worker_link::{WorkerLink, WorkerSpawner};
use crate::ipc::{
    ClientRequest, ErrorCode, RequestEnvelope, Response, ResponseStatus, WorkerMessage,
    WorkerReady, forward_to_worker, new_request_id,
};
use crate::sessiondir;

/// Default deadline for a forwarded command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a spawned worker gets to signal ready.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded wait for a clean worker exit on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One client request awaiting its response.
pub struct RouterRequest {
    pub envelope: RequestEnvelope,
    pub reply_tx: oneshot::Sender<Response>,
}

/// Clonable handle for submitting requests to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterRequest>,
}

impl RouterHandle {
    /// Submit one request and await its response. Returns `None` when the
    /// router has shut down.
    pub async fn request(&self, envelope: RequestEnvelope) -> Option<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(RouterRequest { envelope, reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }
}

/// Router-side record of one in-flight worker request.
struct PendingRequest {
    command: String,
    reply_tx: oneshot::Sender<Response>,
    deadline: Instant,
}

/// The dispatcher. Owns the worker, the pending table, and the phase.
pub struct Router<S: WorkerSpawner> {
    daemon_id: String,
    session_dir: PathBuf,
    spawner: S,
    command_timeout: Duration,
    request_rx: mpsc::Receiver<RouterRequest>,
    phase: Phase,
    link: Option<WorkerLink>,
    worker_rx: Option<mpsc::Receiver<WorkerMessage>>,
    pending: HashMap<String, PendingRequest>,
}

impl<S: WorkerSpawner> Router<S> {
    #[must_use]
    pub fn new(session_dir: PathBuf, spawner: S) -> (Self, RouterHandle) {
        let (tx, request_rx) = mpsc::channel(64);
        let router = Self {
            daemon_id: uuid::Uuid::new_v4().to_string(),
            session_dir,
            spawner,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            request_rx,
            phase: Phase::NoWorker,
            link: None,
            worker_rx: None,
            pending: HashMap::new(),
        };
        (router, RouterHandle { tx })
    }

    /// Override the forwarded-command timeout (tests use short ones).
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run until every `RouterHandle` is dropped.
    pub async fn run(mut self) {
        loop {
            let next_deadline = self.earliest_deadline();
            let deadline_sleep = async {
                if let Some(deadline) = next_deadline {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };
            let worker_msg = async {
                match self.worker_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                req = self.request_rx.recv() => {
                    match req {
                        Some(req) => self.handle_request(req).await,
                        None => {
                            // Daemon is going away; take the worker with us.
                            if let Some(mut link) = self.link.take() {
                                link.kill();
                            }
                            self.cleanup_session_files();
                            return;
                        }
                    }
                }

                msg = worker_msg => {
                    match msg {
                        Some(msg) => self.handle_worker_message(msg).await,
                        None => self.handle_worker_gone(),
                    }
                }

                () = deadline_sleep => {
                    self.sweep_deadlines().await;
                }
            }
        }
    }

    // =========================================================================
    // Client requests
    // =========================================================================

    async fn handle_request(&mut self, req: RouterRequest) {
        let RouterRequest { envelope, reply_tx } = req;
        match envelope.request {
            ClientRequest::Handshake => {
                // Echo the client's session id when it sent one; otherwise
                // report the live session (or the daemon's own identity).
                let session_id = envelope.session_id.unwrap_or_else(|| {
                    self.phase
                        .session()
                        .map_or_else(|| self.daemon_id.clone(), |s| s.session_id.clone())
                });
                let _ = reply_tx.send(Response {
                    response_type: Some("handshake_response".into()),
                    status: ResponseStatus::Ok,
                    session_id: Some(session_id),
                    ..Response::default()
                });
            }
            ClientRequest::StartSessionRequest { config } => {
                self.handle_start(config, reply_tx).await;
            }
            ClientRequest::StopRequest => self.handle_stop(reply_tx).await,
            request => self.forward(&request, reply_tx).await,
        }
    }

    async fn handle_start(
        &mut self,
        config: crate::ipc::StartSessionConfig,
        reply_tx: oneshot::Sender<Response>,
    ) {
        match &self.phase {
            Phase::Ready { session } => {
                let mut response =
                    Response::err(ErrorCode::SessionAlreadyRunning, "session already running");
                response.existing_session = Some(session.summary());
                let _ = reply_tx.send(response);
                return;
            }
            Phase::Starting { .. } | Phase::Stopping { .. } => {
                let _ = reply_tx.send(Response::err(
                    ErrorCode::SessionAlreadyRunning,
                    format!("session is {}", self.phase.name()),
                ));
                return;
            }
            Phase::NoWorker => {}
        }

        match self.spawner.spawn(&config).await {
            Ok(spawned) => {
                info!(pid = spawned.link.pid(), url = %config.url, "worker spawned");
                self.link = Some(spawned.link);
                self.worker_rx = Some(spawned.messages);
                self.phase = Phase::Starting {
                    deadline: Instant::now() + START_TIMEOUT,
                    start_waiter: Some(reply_tx),
                    queued_stops: Vec::new(),
                };
            }
            Err(e) => {
                let _ = reply_tx.send(Response::err(
                    ErrorCode::WorkerStartFailed,
                    format!("could not spawn worker: {e}"),
                ));
            }
        }
    }

    async fn handle_stop(&mut self, reply_tx: oneshot::Sender<Response>) {
        if matches!(self.phase, Phase::Ready { .. }) {
            self.begin_stop(vec![reply_tx]).await;
            return;
        }
        match &mut self.phase {
            Phase::NoWorker => {
                let _ = reply_tx.send(Response::err(ErrorCode::NoSession, "no active session"));
            }
            // Not ready yet: honor the stop as soon as the worker is.
            Phase::Starting { queued_stops, .. } => queued_stops.push(reply_tx),
            Phase::Stopping { waiters, .. } => waiters.push(reply_tx),
            Phase::Ready { .. } => unreachable!("handled above"),
        }
    }

    /// Ready → Stopping: ask the worker to shut down cleanly.
    async fn begin_stop(&mut self, waiters: Vec<oneshot::Sender<Response>>) {
        let Phase::Ready { session } = std::mem::replace(&mut self.phase, Phase::NoWorker) else {
            unreachable!("begin_stop outside Ready");
        };

        let envelope = serde_json::json!({
            "type": "shutdown",
            "requestId": new_request_id(),
        });
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.send_value(&envelope).await {
                warn!(%e, "worker pipe write failed during stop, killing");
                link.kill();
            }
        }

        self.phase = Phase::Stopping {
            deadline: Instant::now() + STOP_TIMEOUT,
            waiters,
            session,
        };
    }

    /// Generic path: strip the `_request` suffix, attach a fresh request id,
    /// queue to the worker, and record a pending entry under the deadline.
    async fn forward(&mut self, request: &ClientRequest, reply_tx: oneshot::Sender<Response>) {
        if !matches!(self.phase, Phase::Ready { .. }) {
            let _ = reply_tx.send(Response::err(ErrorCode::NoSession, "no active session"));
            return;
        }

        let request_id = new_request_id();
        let Some(envelope) = forward_to_worker(request, &request_id) else {
            let _ = reply_tx.send(Response::err(
                ErrorCode::DaemonError,
                "request is not forwardable",
            ));
            return;
        };
        let command = envelope["type"].as_str().unwrap_or("unknown").to_owned();

        let Some(link) = self.link.as_mut() else {
            let _ = reply_tx.send(Response::err(ErrorCode::DaemonError, "worker pipe missing"));
            return;
        };
        if let Err(e) = link.send_value(&envelope).await {
            let _ = reply_tx.send(Response::err(
                ErrorCode::DaemonError,
                format!("worker pipe write failed: {e}"),
            ));
            return;
        }

        self.pending.insert(
            request_id,
            PendingRequest {
                command,
                reply_tx,
                deadline: Instant::now() + self.command_timeout,
            },
        );
    }

    // =========================================================================
    // Worker messages
    // =========================================================================

    async fn handle_worker_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Ready(ready) => self.handle_ready(ready).await,
            WorkerMessage::Reply(reply) => {
                // A reply in the ready slot is the worker reporting a fatal
                // startup error (e.g. Chrome failed to launch).
                if reply.request_id == "ready" && matches!(self.phase, Phase::Starting { .. }) {
                    self.handle_start_failure(&reply);
                    return;
                }
                let Some(pending) = self.pending.remove(&reply.request_id) else {
                    // Deadline already fired for this id; the late reply is dropped.
                    debug!(request_id = %reply.request_id, "late worker reply dropped");
                    return;
                };
                let response = Response {
                    status: reply.status,
                    data: reply.data,
                    error: reply.error,
                    error_code: reply.error_code,
                    suggestion: reply.suggestion,
                    request_id: Some(reply.request_id),
                    session_id: self.phase.session().map(|s| s.session_id.clone()),
                    ..Response::default()
                };
                // A closed receiver means the client hung up; no retry.
                let _ = pending.reply_tx.send(response);
            }
        }
    }

    fn handle_start_failure(&mut self, reply: &crate::ipc::WorkerReply) {
        let Phase::Starting {
            start_waiter,
            queued_stops,
            ..
        } = std::mem::replace(&mut self.phase, Phase::NoWorker)
        else {
            unreachable!("caller checked Starting");
        };

        let code = reply.error_code.unwrap_or(ErrorCode::WorkerStartFailed);
        let message = reply
            .error
            .clone()
            .unwrap_or_else(|| "worker failed to start".into());
        warn!(%message, "worker reported startup failure");

        if let Some(mut link) = self.link.take() {
            link.kill();
        }
        if let Some(waiter) = start_waiter {
            let _ = waiter.send(Response::err(code, message));
        }
        for waiter in queued_stops {
            let _ = waiter.send(Response::ok(Some(serde_json::json!({"stopped": true}))));
        }
        self.cleanup_session_files();
    }

    async fn handle_ready(&mut self, ready: WorkerReady) {
        if !matches!(self.phase, Phase::Starting { .. }) {
            warn!("unexpected worker_ready outside Starting");
            return;
        }
        let Phase::Starting {
            start_waiter,
            queued_stops,
            ..
        } = std::mem::replace(&mut self.phase, Phase::NoWorker)
        else {
            unreachable!("checked above");
        };

        let session = ActiveSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            worker_pid: ready.worker_pid,
            chrome_pid: ready.chrome_pid,
            port: ready.port,
            target: ready.target,
            started_at_iso: sessiondir::now_iso8601(),
            started_epoch: sessiondir::epoch_secs_f64(),
            active_telemetry: vec!["navigation".into(), "network".into(), "console".into()],
        };
        info!(session_id = %session.session_id, port = session.port, "session ready");

        if let Err(e) = sessiondir::write_pid(
            &sessiondir::pid_path(&self.session_dir),
            session.worker_pid,
        ) {
            warn!(%e, "could not write session.pid");
        }

        if let Some(waiter) = start_waiter {
            let summary = session.summary();
            let _ = waiter.send(Response {
                status: ResponseStatus::Ok,
                session_id: Some(session.session_id.clone()),
                data: serde_json::to_value(&summary).ok(),
                ..Response::default()
            });
        }

        self.phase = Phase::Ready { session };

        if !queued_stops.is_empty() {
            self.begin_stop(queued_stops).await;
        }
    }

    /// The worker's output channel closed: every outstanding request fails,
    /// and the session (if any) is torn down.
    fn handle_worker_gone(&mut self) {
        self.worker_rx = None;
        if let Some(mut link) = self.link.take() {
            link.kill();
        }

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply_tx.send(Response::err(
                ErrorCode::DaemonError,
                format!("worker terminated with `{}` in flight", pending.command),
            ));
        }

        match std::mem::replace(&mut self.phase, Phase::NoWorker) {
            Phase::Starting {
                start_waiter,
                queued_stops,
                ..
            } => {
                if let Some(waiter) = start_waiter {
                    let _ = waiter.send(Response::err(
                        ErrorCode::WorkerStartFailed,
                        "worker exited before signaling ready",
                    ));
                }
                for waiter in queued_stops {
                    let _ = waiter.send(Response::ok(Some(serde_json::json!({"stopped": true}))));
                }
            }
            Phase::Stopping { waiters, .. } => {
                for waiter in waiters {
                    let _ = waiter.send(Response::ok(Some(serde_json::json!({"stopped": true}))));
                }
            }
            Phase::Ready { session } => {
                warn!(session_id = %session.session_id, "worker crashed, session destroyed");
            }
            Phase::NoWorker => {}
        }

        self.cleanup_session_files();
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    fn earliest_deadline(&self) -> Option<Instant> {
        let pending_min = self.pending.values().map(|p| p.deadline).min();
        let phase_deadline = match &self.phase {
            Phase::Starting { deadline, .. } | Phase::Stopping { deadline, .. } => Some(*deadline),
            _ => None,
        };
        match (pending_min, phase_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn sweep_deadlines(&mut self) {
        let now = Instant::now();

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let mut response = Response::err(
                    ErrorCode::CdpTimeout,
                    format!("command `{}` timed out", pending.command),
                );
                response.request_id = Some(id);
                let _ = pending.reply_tx.send(response);
            }
        }

        let phase_expired = match &self.phase {
            Phase::Starting { deadline, .. } | Phase::Stopping { deadline, .. } => *deadline <= now,
            _ => false,
        };
        if !phase_expired {
            return;
        }

        match std::mem::replace(&mut self.phase, Phase::NoWorker) {
            Phase::Starting {
                start_waiter,
                queued_stops,
                ..
            } => {
                warn!("worker did not become ready in time");
                if let Some(mut link) = self.link.take() {
                    link.kill();
                }
                if let Some(waiter) = start_waiter {
                    let _ = waiter.send(Response::err(
                        ErrorCode::WorkerStartFailed,
                        "worker did not become ready in time",
                    ));
                }
                for waiter in queued_stops {
                    let _ = waiter.send(Response::ok(Some(serde_json::json!({"stopped": true}))));
                }
                self.cleanup_session_files();
            }
            Phase::Stopping { waiters, .. } => {
                warn!("worker did not exit in time, killing");
                let killed = match self.link.take() {
                    Some(mut link) => {
                        link.kill();
                        link.has_exited()
                    }
                    None => true,
                };
                for waiter in waiters {
                    let response = if killed {
                        Response::ok(Some(serde_json::json!({"stopped": true, "forced": true})))
                    } else {
                        Response::err(
                            ErrorCode::SessionKillFailed,
                            "worker process did not terminate",
                        )
                    };
                    let _ = waiter.send(response);
                }
                self.worker_rx = None;
                self.cleanup_session_files();
            }
            other => self.phase = other,
        }
    }

    fn cleanup_session_files(&self) {
        let _ = sessiondir::remove_file(&sessiondir::session_json_path(&self.session_dir));
        let _ = sessiondir::remove_file(&sessiondir::pid_path(&self.session_dir));
        let _ = sessiondir::remove_file(&sessiondir::query_cache_path(&self.session_dir));
    }
}
