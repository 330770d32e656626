//! Wire types for the local-socket IPC and the worker pipe.
//!
//! Every message is one line of UTF-8 JSON. Requests are a closed tagged
//! union; the `type` string is the wire form only, dispatch happens on the
//! enum. Worker replies are correlated by `requestId`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed enumeration of IPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoSession,
    SessionAlreadyRunning,
    ChromeLaunchFailed,
    CdpTimeout,
    SessionKillFailed,
    WorkerStartFailed,
    DaemonError,
}

/// `status` field of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Start-session configuration handed over by the CLI front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionConfig {
    /// Initial navigation target.
    pub url: String,
    /// CDP port; a free port is picked when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Chrome startup timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Persistent profile directory; a temp dir is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data_dir: Option<PathBuf>,
    /// Bypass the built-in telemetry noise filter.
    #[serde(default)]
    pub include_all: bool,
    /// Cap on inlined response bodies, in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// Emit compact single-line JSON from the CLI.
    #[serde(default)]
    pub compact_output: bool,
    #[serde(default)]
    pub headless: bool,
    /// Attach to an already-running Chrome instead of launching one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_ws_url: Option<String>,
    /// Extra flags appended to the Chrome command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chrome_flags: Vec<String>,
}

fn default_max_body_size() -> u64 {
    50_000
}

impl StartSessionConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            port: None,
            timeout_secs: None,
            user_data_dir: None,
            include_all: false,
            max_body_size: default_max_body_size(),
            compact_output: false,
            headless: true,
            chrome_ws_url: None,
            chrome_flags: Vec::new(),
        }
    }
}

/// Requests a CLI client can send to the daemon.
///
/// Variants ending in `Request` (wire types ending in `_request`, plus
/// `get_peek_request`) are forwarded to the worker; the rest are handled by
/// the daemon directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Handshake,
    StartSessionRequest {
        config: StartSessionConfig,
    },
    StopRequest,
    StatusRequest,
    GetPeekRequest {
        /// Tail length per buffer; 0 or absent returns everything.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last: Option<u64>,
        /// Comma-separated resource-type filter for the network slice.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        types: Option<String>,
    },
    DomQueryRequest {
        selector: String,
    },
    DomGetRequest {
        index: usize,
    },
    DomClickRequest {
        index: usize,
    },
    DomFillRequest {
        index: usize,
        value: String,
    },
    A11yTreeRequest,
    NetworkBodyRequest {
        /// CDP request id of the captured request. Distinct wire key so the
        /// envelope's correlation `requestId` cannot clobber it.
        #[serde(rename = "networkRequestId")]
        request_id: String,
    },
    NavigateRequest {
        url: String,
    },
    CdpRawRequest {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl ClientRequest {
    /// True for requests the daemon forwards to the worker unchanged.
    #[must_use]
    pub fn is_forwarded(&self) -> bool {
        !matches!(
            self,
            Self::Handshake | Self::StartSessionRequest { .. } | Self::StopRequest
        )
    }
}

/// Client → daemon envelope: the request plus the client-only session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Daemon → client response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    pub status: ResponseStatus,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(
        rename = "existingSession",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub existing_session: Option<SessionSummary>,
}

impl Default for ResponseStatus {
    fn default() -> Self {
        Self::Error
    }
}

impl Response {
    #[must_use]
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            data,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(message.into()),
            error_code: Some(code),
            ..Self::default()
        }
    }
}

/// Summary of the running session, used by `status` replies and
/// `SESSION_ALREADY_RUNNING` conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub pid: u32,
    pub chrome_pid: u32,
    pub port: u16,
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_title: Option<String>,
    pub started_at: String,
    /// Seconds since session start.
    pub duration: u64,
    #[serde(default)]
    pub active_telemetry: Vec<String>,
}

/// Target page identity reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSummary {
    pub url: String,
    pub title: String,
}

// =============================================================================
// Worker pipe
// =============================================================================

/// Commands the worker understands, dispatched from its stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Status,
    GetPeek {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        types: Option<String>,
    },
    DomQuery {
        selector: String,
    },
    DomGet {
        index: usize,
    },
    DomClick {
        index: usize,
    },
    DomFill {
        index: usize,
        value: String,
    },
    A11yTree,
    NetworkBody {
        /// CDP request id, under its own key; `requestId` on the envelope is
        /// the daemon's correlation id.
        #[serde(rename = "networkRequestId")]
        request_id: String,
    },
    Navigate {
        url: String,
    },
    CdpRaw {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// Clean shutdown request from the daemon.
    Shutdown,
}

/// Daemon → worker envelope carrying the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommandEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub command: WorkerCommand,
}

/// Worker → daemon reply, correlated by `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl WorkerReply {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Ok,
            data,
            error: None,
            error_code: None,
            suggestion: None,
        }
    }

    #[must_use]
    pub fn err(
        request_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
            error_code: Some(code),
            suggestion: None,
        }
    }
}

/// The one unsolicited message the worker emits: ready after the initial
/// navigation, with `requestId` fixed to `"ready"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReady {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "workerPid")]
    pub worker_pid: u32,
    #[serde(rename = "chromePid")]
    pub chrome_pid: u32,
    pub port: u16,
    pub target: TargetSummary,
}

impl WorkerReady {
    #[must_use]
    pub fn new(worker_pid: u32, chrome_pid: u32, port: u16, target: TargetSummary) -> Self {
        Self {
            msg_type: "worker_ready".into(),
            request_id: "ready".into(),
            worker_pid,
            chrome_pid,
            port,
            target,
        }
    }
}

/// Raw worker stdout line before classification.
///
/// The union of reply and ready fields; every line is deserialized into this
/// first, then classified.
#[derive(Debug, Deserialize)]
pub struct RawWorkerMessage {
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    pub status: Option<ResponseStatus>,
    pub data: Option<Value>,
    pub error: Option<String>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<ErrorCode>,
    pub suggestion: Option<String>,
    #[serde(rename = "workerPid")]
    pub worker_pid: Option<u32>,
    #[serde(rename = "chromePid")]
    pub chrome_pid: Option<u32>,
    pub port: Option<u16>,
    pub target: Option<TargetSummary>,
}

/// Classified worker stdout message.
#[derive(Debug)]
pub enum WorkerMessage {
    Ready(WorkerReady),
    Reply(WorkerReply),
}

impl RawWorkerMessage {
    /// Classify a raw line as a ready signal or a command reply.
    ///
    /// Returns `None` when the line is neither (missing both the
    /// `worker_ready` type and a usable `requestId`).
    #[must_use]
    pub fn classify(self) -> Option<WorkerMessage> {
        if self.msg_type.as_deref() == Some("worker_ready") {
            return Some(WorkerMessage::Ready(WorkerReady {
                msg_type: "worker_ready".into(),
                request_id: self.request_id.unwrap_or_else(|| "ready".into()),
                worker_pid: self.worker_pid?,
                chrome_pid: self.chrome_pid?,
                port: self.port?,
                target: self.target?,
            }));
        }
        let request_id = self.request_id?;
        Some(WorkerMessage::Reply(WorkerReply {
            request_id,
            status: self.status?,
            data: self.data,
            error: self.error,
            error_code: self.error_code,
            suggestion: self.suggestion,
        }))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Derive the worker-side command name from a client wire type by stripping
/// the `_request` suffix.
#[must_use]
pub fn command_name(wire_type: &str) -> &str {
    wire_type.strip_suffix("_request").unwrap_or(wire_type)
}

/// Build the worker-side envelope for a forwarded client request.
///
/// Strips the client-only `sessionId` field, rewrites the `type` to the
/// worker command name, and attaches the fresh `requestId`. Returns `None`
/// for requests the daemon handles itself.
#[must_use]
pub fn forward_to_worker(request: &ClientRequest, request_id: &str) -> Option<Value> {
    if !request.is_forwarded() {
        return None;
    }
    let mut value = serde_json::to_value(request).ok()?;
    let obj = value.as_object_mut()?;
    let wire_type = obj.get("type")?.as_str()?.to_owned();
    obj.insert(
        "type".into(),
        Value::String(command_name(&wire_type).to_owned()),
    );
    obj.remove("sessionId");
    obj.insert("requestId".into(), Value::String(request_id.to_owned()));
    Some(value)
}

/// Generate a fresh request identifier.
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Serialize a message as one newline-terminated JSON line.
///
/// # Errors
///
/// Returns a `serde_json::Error` if serialization fails.
pub fn to_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- wire shape ---

    #[test]
    fn handshake_wire_type() {
        let env = RequestEnvelope {
            session_id: Some("s1".into()),
            request: ClientRequest::Handshake,
        };
        let json: Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "handshake");
        assert_eq!(json["sessionId"], "s1");
    }

    #[test]
    fn forwarded_request_wire_types_end_with_request() {
        let cases = vec![
            (ClientRequest::StatusRequest, "status_request"),
            (
                ClientRequest::GetPeekRequest {
                    last: Some(5),
                    types: None,
                },
                "get_peek_request",
            ),
            (
                ClientRequest::DomQueryRequest {
                    selector: "a.nav".into(),
                },
                "dom_query_request",
            ),
            (ClientRequest::DomGetRequest { index: 0 }, "dom_get_request"),
            (ClientRequest::A11yTreeRequest, "a11y_tree_request"),
        ];
        for (req, expected) in cases {
            let json: Value = serde_json::to_value(&req).unwrap();
            assert_eq!(json["type"], expected);
        }
    }

    #[test]
    fn request_envelope_round_trip() {
        let line = r#"{"type":"dom_fill_request","sessionId":"abc","index":2,"value":"hi"}"#;
        let env: RequestEnvelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.session_id.as_deref(), Some("abc"));
        match env.request {
            ClientRequest::DomFillRequest { index, value } => {
                assert_eq!(index, 2);
                assert_eq!(value, "hi");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn error_code_wire_form_is_screaming_snake() {
        assert_eq!(
            serde_json::to_value(ErrorCode::SessionAlreadyRunning).unwrap(),
            "SESSION_ALREADY_RUNNING"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::CdpTimeout).unwrap(),
            "CDP_TIMEOUT"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::NoSession).unwrap(),
            "NO_SESSION"
        );
    }

    // --- command name derivation ---

    #[test]
    fn command_name_strips_request_suffix() {
        assert_eq!(command_name("status_request"), "status");
        assert_eq!(command_name("get_peek_request"), "get_peek");
        assert_eq!(command_name("dom_query_request"), "dom_query");
    }

    #[test]
    fn command_name_passes_through_bare_names() {
        assert_eq!(command_name("status"), "status");
    }

    // --- forwarding ---

    #[test]
    fn forward_builds_worker_envelope() {
        let req = ClientRequest::DomQueryRequest {
            selector: "a.nav".into(),
        };
        let value = forward_to_worker(&req, "req-1").unwrap();
        assert_eq!(value["type"], "dom_query");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["selector"], "a.nav");
        assert!(value.get("sessionId").is_none());

        // The worker can parse what the daemon produces.
        let env: WorkerCommandEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(env.request_id, "req-1");
        assert!(matches!(env.command, WorkerCommand::DomQuery { .. }));
    }

    #[test]
    fn forward_preserves_the_network_request_id() {
        let req = ClientRequest::NetworkBodyRequest {
            request_id: "cdp-77".into(),
        };
        let value = forward_to_worker(&req, "corr-1").unwrap();
        // Correlation id and CDP request id live under separate keys.
        assert_eq!(value["type"], "network_body");
        assert_eq!(value["requestId"], "corr-1");
        assert_eq!(value["networkRequestId"], "cdp-77");

        let env: WorkerCommandEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(env.request_id, "corr-1");
        match env.command {
            WorkerCommand::NetworkBody { request_id } => assert_eq!(request_id, "cdp-77"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn forward_rejects_daemon_local_requests() {
        assert!(forward_to_worker(&ClientRequest::Handshake, "x").is_none());
        assert!(forward_to_worker(&ClientRequest::StopRequest, "x").is_none());
        assert!(
            forward_to_worker(
                &ClientRequest::StartSessionRequest {
                    config: StartSessionConfig::new("http://example.test"),
                },
                "x",
            )
            .is_none()
        );
    }

    // --- worker message classification ---

    #[test]
    fn classify_ready_message() {
        let raw: RawWorkerMessage = serde_json::from_str(
            r#"{"type":"worker_ready","requestId":"ready","workerPid":10,"chromePid":20,
                "port":9222,"target":{"url":"http://example.test","title":"Example"}}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(WorkerMessage::Ready(ready)) => {
                assert_eq!(ready.request_id, "ready");
                assert_eq!(ready.worker_pid, 10);
                assert_eq!(ready.chrome_pid, 20);
                assert_eq!(ready.port, 9222);
                assert_eq!(ready.target.url, "http://example.test");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn classify_reply_message() {
        let raw: RawWorkerMessage = serde_json::from_str(
            r#"{"requestId":"r1","status":"ok","data":{"value":1}}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(WorkerMessage::Reply(reply)) => {
                assert_eq!(reply.request_id, "r1");
                assert_eq!(reply.status, ResponseStatus::Ok);
                assert_eq!(reply.data.unwrap()["value"], 1);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn classify_error_reply_carries_code() {
        let raw: RawWorkerMessage = serde_json::from_str(
            r#"{"requestId":"r2","status":"error","error":"nope","errorCode":"DAEMON_ERROR"}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(WorkerMessage::Reply(reply)) => {
                assert_eq!(reply.error_code, Some(ErrorCode::DaemonError));
                assert_eq!(reply.error.as_deref(), Some("nope"));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn classify_unusable_line_returns_none() {
        let raw: RawWorkerMessage = serde_json::from_str(r"{}").unwrap();
        assert!(raw.classify().is_none());
    }

    // --- framing ---

    #[test]
    fn to_line_appends_exactly_one_newline() {
        let reply = WorkerReply::ok("r1", None);
        let line = to_line(&reply).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn worker_ready_wire_shape() {
        let ready = WorkerReady::new(
            1,
            2,
            9222,
            TargetSummary {
                url: "http://example.test".into(),
                title: "Example".into(),
            },
        );
        let json: Value = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["type"], "worker_ready");
        assert_eq!(json["requestId"], "ready");
        assert_eq!(json["workerPid"], 1);
        assert_eq!(json["chromePid"], 2);
        assert_eq!(json["target"]["title"], "Example");
    }

    #[test]
    fn start_config_defaults() {
        let config: StartSessionConfig =
            serde_json::from_str(r#"{"url":"http://example.test"}"#).unwrap();
        assert_eq!(config.max_body_size, 50_000);
        assert!(!config.include_all);
        assert!(config.chrome_flags.is_empty());
    }
}
