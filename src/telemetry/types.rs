use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CDP resource types, as reported by `Network.requestWillBeSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    #[serde(rename = "XHR")]
    Xhr,
    Fetch,
    Prefetch,
    EventSource,
    WebSocket,
    Manifest,
    SignedExchange,
    Ping,
    #[serde(rename = "CSPViolationReport")]
    CspViolationReport,
    Preflight,
    FedCM,
    Other,
}

impl ResourceType {
    /// All variants, in wire order. Used for filter suggestions.
    pub const ALL: &'static [Self] = &[
        Self::Document,
        Self::Stylesheet,
        Self::Image,
        Self::Media,
        Self::Font,
        Self::Script,
        Self::TextTrack,
        Self::Xhr,
        Self::Fetch,
        Self::Prefetch,
        Self::EventSource,
        Self::WebSocket,
        Self::Manifest,
        Self::SignedExchange,
        Self::Ping,
        Self::CspViolationReport,
        Self::Preflight,
        Self::FedCM,
        Self::Other,
    ];

    /// The wire name as CDP emits it.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "Document",
            Self::Stylesheet => "Stylesheet",
            Self::Image => "Image",
            Self::Media => "Media",
            Self::Font => "Font",
            Self::Script => "Script",
            Self::TextTrack => "TextTrack",
            Self::Xhr => "XHR",
            Self::Fetch => "Fetch",
            Self::Prefetch => "Prefetch",
            Self::EventSource => "EventSource",
            Self::WebSocket => "WebSocket",
            Self::Manifest => "Manifest",
            Self::SignedExchange => "SignedExchange",
            Self::Ping => "Ping",
            Self::CspViolationReport => "CSPViolationReport",
            Self::Preflight => "Preflight",
            Self::FedCM => "FedCM",
            Self::Other => "Other",
        }
    }

    /// Case-insensitive lookup by wire name.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(token))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured network request.
///
/// Created on `Network.requestWillBeSent` and mutated in place by the
/// response/finished/failed events; removed only by buffer eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    /// CDP wall-clock timestamp in epoch seconds.
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_id: Option<u64>,
}

/// Console message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warning,
    Error,
    Debug,
}

impl ConsoleLevel {
    /// Map a CDP `consoleAPICalled` type to a level.
    #[must_use]
    pub fn from_cdp(cdp_type: &str) -> Self {
        match cdp_type {
            "info" => Self::Info,
            "warning" => Self::Warning,
            "error" | "assert" => Self::Error,
            "debug" | "verbose" => Self::Debug,
            _ => Self::Log,
        }
    }
}

/// One frame of a console message's stack trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub url: String,
    pub line: u64,
    pub column: u64,
    pub script_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

/// One captured console message. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub text: String,
    /// CDP timestamp in epoch milliseconds.
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<StackFrame>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_id: Option<u64>,
}

/// Top-frame navigation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationKind {
    #[serde(rename = "initial")]
    Initial,
    #[serde(rename = "frame")]
    Frame,
    #[serde(rename = "same-document")]
    SameDocument,
}

/// One top-frame navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEvent {
    pub id: u64,
    pub url: String,
    pub timestamp: f64,
    pub kind: NavigationKind,
}

/// One node from a `dom query` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomNodeSummary {
    pub backend_node_id: i64,
    pub tag: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub text_preview: String,
}

/// The persisted result of the most recent `dom query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomQueryResult {
    pub selector: String,
    pub nodes: Vec<DomNodeSummary>,
    /// Absent only in records written before navigation tracking existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_id: Option<u64>,
}
