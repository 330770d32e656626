//! Worker command dispatch.
//!
//! Commands arrive as a closed tagged union (`WorkerCommand`); the wire
//! `type` string exists only at the parse boundary. Execution is serialized
//! by the worker's stdin loop, so handlers never interleave at this layer.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::cdp::{CdpConnection, CdpError};
use crate::ipc::{ErrorCode, TargetSummary, WorkerCommand, WorkerCommandEnvelope, WorkerReply};
use crate::query_cache::{CacheError, NavIdCache, QueryCacheManager};
use crate::telemetry::TelemetryStore;

use super::handlers;

/// Everything a handler can reach: the live CDP connection, the telemetry
/// store, the query cache, and session identity.
pub struct WorkerContext {
    pub conn: Arc<CdpConnection>,
    pub store: Arc<Mutex<TelemetryStore>>,
    pub nav_cache: Arc<Mutex<NavIdCache>>,
    pub query_cache: QueryCacheManager,
    pub max_body_size: u64,
    pub chrome_pid: u32,
    pub port: u16,
    pub target: TargetSummary,
}

/// A single command failing. Never fails the session.
#[derive(Debug)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl HandlerError {
    pub fn daemon(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::DaemonError,
            message: message.into(),
            suggestion: None,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl From<CdpError> for HandlerError {
    fn from(e: CdpError) -> Self {
        let code = match &e {
            CdpError::CommandTimeout { .. } | CdpError::ConnectionTimeout => ErrorCode::CdpTimeout,
            _ => ErrorCode::DaemonError,
        };
        Self {
            code,
            message: e.to_string(),
            suggestion: None,
        }
    }
}

impl From<CacheError> for HandlerError {
    fn from(e: CacheError) -> Self {
        let suggestion = e.suggestion();
        Self {
            code: ErrorCode::DaemonError,
            message: e.to_string(),
            suggestion: Some(suggestion),
        }
    }
}

/// Outcome of dispatching one envelope.
pub enum DispatchOutcome {
    /// Send the reply and keep serving.
    Reply(WorkerReply),
    /// Send the reply, then begin clean shutdown.
    Shutdown(WorkerReply),
}

/// Dispatch one command envelope to its handler and produce exactly one
/// reply carrying the envelope's `requestId`.
pub async fn dispatch(ctx: &WorkerContext, envelope: WorkerCommandEnvelope) -> DispatchOutcome {
    let request_id = envelope.request_id;

    if matches!(envelope.command, WorkerCommand::Shutdown) {
        return DispatchOutcome::Shutdown(WorkerReply::ok(
            request_id,
            Some(serde_json::json!({"stopping": true})),
        ));
    }

    let result = match envelope.command {
        WorkerCommand::Status => handlers::status(ctx),
        WorkerCommand::GetPeek { last, types } => handlers::get_peek(ctx, last, types.as_deref()),
        WorkerCommand::DomQuery { selector } => handlers::dom_query(ctx, &selector).await,
        WorkerCommand::DomGet { index } => handlers::dom_get(ctx, index),
        WorkerCommand::DomClick { index } => handlers::dom_click(ctx, index).await,
        WorkerCommand::DomFill { index, value } => handlers::dom_fill(ctx, index, &value).await,
        WorkerCommand::A11yTree => handlers::a11y_tree(ctx).await,
        WorkerCommand::NetworkBody { request_id: cdp_id } => {
            handlers::network_body(ctx, &cdp_id).await
        }
        WorkerCommand::Navigate { url } => handlers::navigate(ctx, &url).await,
        WorkerCommand::CdpRaw { method, params } => handlers::cdp_raw(ctx, &method, params).await,
        WorkerCommand::Shutdown => unreachable!("handled above"),
    };

    let reply = match result {
        Ok(data) => WorkerReply::ok(request_id, Some(data)),
        Err(e) => {
            let mut reply = WorkerReply::err(request_id, e.code, e.message);
            reply.suggestion = e.suggestion;
            reply
        }
    };
    DispatchOutcome::Reply(reply)
}
