use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing CDP command. The connection is attached directly to a page
/// target, so there is no session routing field.
#[derive(Debug, Serialize)]
pub struct CdpCommand {
    /// Unique message ID for response correlation.
    pub id: u64,
    /// CDP method name (e.g., `Page.navigate`).
    pub method: String,
    /// Optional parameters for the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Raw incoming CDP message before classification.
///
/// The union of response and event fields; every incoming WebSocket message
/// is deserialized into this type first, then classified.
#[derive(Debug, Deserialize)]
pub struct RawCdpMessage {
    /// Present for responses; absent for events.
    pub id: Option<u64>,
    /// Present for events.
    pub method: Option<String>,
    /// Event parameters.
    pub params: Option<Value>,
    /// Successful response payload.
    pub result: Option<Value>,
    /// Protocol error payload.
    pub error: Option<CdpProtocolError>,
}

/// CDP protocol error payload returned by Chrome.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpProtocolError {
    pub code: i64,
    pub message: String,
}

/// Parsed CDP response (has an `id`).
#[derive(Debug)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Result<Value, CdpProtocolError>,
}

/// Parsed CDP event (no `id`, has `method`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// Classification of a raw CDP message.
pub enum MessageKind {
    Response(CdpResponse),
    Event(CdpEvent),
}

impl RawCdpMessage {
    /// Classify this raw message as either a response or an event.
    ///
    /// Messages with an `id` field are responses; messages with a `method`
    /// field but no `id` are events. Returns `None` when neither is present.
    #[must_use]
    pub fn classify(self) -> Option<MessageKind> {
        if let Some(id) = self.id {
            let result = if let Some(error) = self.error {
                Err(error)
            } else {
                Ok(self.result.unwrap_or(Value::Null))
            };
            Some(MessageKind::Response(CdpResponse { id, result }))
        } else if let Some(method) = self.method {
            Some(MessageKind::Event(CdpEvent {
                method,
                params: self.params.unwrap_or(Value::Null),
            }))
        } else {
            None
        }
    }
}
