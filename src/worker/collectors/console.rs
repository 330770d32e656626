use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use super::CollectorHandle;
use crate::cdp::{CdpConnection, CdpError};
use crate::telemetry::{ConsoleLevel, ConsoleMessage, StackFrame, TelemetryStore, is_noise_url};
use crate::worker::expander::{PropertyFetcher, RemoteObjectExpander};

/// Start the console collector.
///
/// Enables `Runtime` and subscribes to `consoleAPICalled` and
/// `exceptionThrown`. Remote-object arguments are expanded to display text
/// before the store lock is taken, so the append itself never suspends.
///
/// # Errors
///
/// Returns `CdpError` if enabling the domain or subscribing fails.
pub async fn start_console_collector(
    conn: &Arc<CdpConnection>,
    store: Arc<Mutex<TelemetryStore>>,
    include_all: bool,
) -> Result<CollectorHandle, CdpError> {
    conn.ensure_domain("Runtime").await?;

    let mut console_rx = conn.subscribe("Runtime.consoleAPICalled").await?;
    let mut exception_rx = conn.subscribe("Runtime.exceptionThrown").await?;

    let conn = Arc::clone(conn);
    let task = tokio::spawn(async move {
        let mut expander = RemoteObjectExpander::new();
        loop {
            tokio::select! {
                event = console_rx.recv() => {
                    let Some(ev) = event else { break };
                    if let Some(message) =
                        build_console_message(&mut expander, conn.as_ref(), &ev.params, include_all)
                            .await
                    {
                        append(&store, message);
                    }
                }
                event = exception_rx.recv() => {
                    let Some(ev) = event else { break };
                    if let Some(message) =
                        build_exception_message(&mut expander, conn.as_ref(), &ev.params).await
                    {
                        append(&store, message);
                    }
                }
            }
        }
        debug!("console collector stopped");
    });

    Ok(CollectorHandle::new("console", task))
}

/// Stamp the current navigation id and append. Single non-suspending lock.
fn append(store: &Mutex<TelemetryStore>, mut message: ConsoleMessage) {
    let mut guard = store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    message.navigation_id = Some(guard.navigation_id());
    guard.record_console(message);
}

/// Build a `ConsoleMessage` from a `Runtime.consoleAPICalled` event.
///
/// Returns `None` when the message originates from a noise URL and
/// `include_all` is off.
async fn build_console_message<F: PropertyFetcher>(
    expander: &mut RemoteObjectExpander,
    fetcher: &F,
    params: &Value,
    include_all: bool,
) -> Option<ConsoleMessage> {
    let stack = convert_stack_trace(&params["stackTrace"]);
    if !include_all {
        if let Some(frames) = &stack {
            if frames.first().is_some_and(|f| is_noise_url(&f.url)) {
                return None;
            }
        }
    }

    let level = ConsoleLevel::from_cdp(params["type"].as_str().unwrap_or("log"));
    let args = params["args"].as_array().cloned().unwrap_or_default();

    let mut parts = Vec::with_capacity(args.len());
    for arg in &args {
        parts.push(expander.expand(fetcher, arg).await);
    }

    Some(ConsoleMessage {
        level,
        text: parts.join(" "),
        timestamp: params["timestamp"].as_f64().unwrap_or(0.0),
        args: if args.is_empty() { None } else { Some(args) },
        stack,
        navigation_id: None,
    })
}

/// Build a `ConsoleMessage` from a `Runtime.exceptionThrown` event.
async fn build_exception_message<F: PropertyFetcher>(
    expander: &mut RemoteObjectExpander,
    fetcher: &F,
    params: &Value,
) -> Option<ConsoleMessage> {
    let details = params.get("exceptionDetails")?;

    let text = if let Some(exception) = details.get("exception") {
        expander.expand(fetcher, exception).await
    } else {
        details["text"].as_str().unwrap_or("Uncaught exception").to_owned()
    };

    let stack = convert_stack_trace(&details["stackTrace"]).or_else(|| {
        // Exceptions without a trace still carry a throw location.
        let url = details["url"].as_str()?;
        Some(vec![StackFrame {
            url: url.to_owned(),
            line: details["lineNumber"].as_u64().unwrap_or(0),
            column: details["columnNumber"].as_u64().unwrap_or(0),
            script_id: details["scriptId"].as_str().unwrap_or("").to_owned(),
            function_name: None,
        }])
    });

    Some(ConsoleMessage {
        level: ConsoleLevel::Error,
        text,
        timestamp: params["timestamp"].as_f64().unwrap_or(0.0),
        args: None,
        stack,
        navigation_id: None,
    })
}

/// Convert a CDP stack trace into stored frames.
fn convert_stack_trace(stack_trace: &Value) -> Option<Vec<StackFrame>> {
    let call_frames = stack_trace["callFrames"].as_array()?;
    if call_frames.is_empty() {
        return None;
    }
    Some(
        call_frames
            .iter()
            .map(|f| StackFrame {
                url: f["url"].as_str().unwrap_or("").to_owned(),
                line: f["lineNumber"].as_u64().unwrap_or(0),
                column: f["columnNumber"].as_u64().unwrap_or(0),
                script_id: f["scriptId"].as_str().unwrap_or("").to_owned(),
                function_name: f["functionName"]
                    .as_str()
                    .filter(|n| !n.is_empty())
                    .map(String::from),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::CdpError;
    use serde_json::json;

    /// Fetcher that fails every call; fine for primitive-only args.
    struct NoFetcher;

    impl PropertyFetcher for NoFetcher {
        async fn get_properties(&self, _object_id: &str) -> Result<Vec<Value>, CdpError> {
            Err(CdpError::Internal("no fetcher in tests".into()))
        }
    }

    fn console_event(msg_type: &str, text: &str, frame_url: &str) -> Value {
        json!({
            "type": msg_type,
            "args": [{"type": "string", "value": text}],
            "timestamp": 1_700_000_000_000.0_f64,
            "stackTrace": {
                "callFrames": [{
                    "url": frame_url,
                    "lineNumber": 10,
                    "columnNumber": 4,
                    "scriptId": "55",
                    "functionName": "handleClick"
                }]
            }
        })
    }

    #[tokio::test]
    async fn console_event_becomes_message() {
        let mut expander = RemoteObjectExpander::new();
        let message = build_console_message(
            &mut expander,
            &NoFetcher,
            &console_event("log", "hello world", "https://example.test/app.js"),
            false,
        )
        .await
        .unwrap();

        assert_eq!(message.level, ConsoleLevel::Log);
        assert_eq!(message.text, "hello world");
        let stack = message.stack.unwrap();
        assert_eq!(stack[0].url, "https://example.test/app.js");
        assert_eq!(stack[0].line, 10);
        assert_eq!(stack[0].script_id, "55");
        assert_eq!(stack[0].function_name.as_deref(), Some("handleClick"));
    }

    #[tokio::test]
    async fn warning_maps_to_warning_level() {
        let mut expander = RemoteObjectExpander::new();
        let message = build_console_message(
            &mut expander,
            &NoFetcher,
            &console_event("warning", "careful", "https://example.test/app.js"),
            false,
        )
        .await
        .unwrap();
        assert_eq!(message.level, ConsoleLevel::Warning);
    }

    #[tokio::test]
    async fn multiple_args_join_with_spaces() {
        let mut expander = RemoteObjectExpander::new();
        let params = json!({
            "type": "log",
            "args": [
                {"type": "string", "value": "count:"},
                {"type": "number", "value": 3}
            ],
            "timestamp": 0.0,
        });
        let message = build_console_message(&mut expander, &NoFetcher, &params, false)
            .await
            .unwrap();
        assert_eq!(message.text, "count: 3");
        assert_eq!(message.args.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn noise_frames_are_filtered_unless_include_all() {
        let mut expander = RemoteObjectExpander::new();
        let noisy = console_event("log", "pixel", "https://www.googletagmanager.com/gtm.js");

        let dropped = build_console_message(&mut expander, &NoFetcher, &noisy, false).await;
        assert!(dropped.is_none());

        let kept = build_console_message(&mut expander, &NoFetcher, &noisy, true).await;
        assert!(kept.is_some());
    }

    #[tokio::test]
    async fn exception_event_becomes_error_message() {
        let mut expander = RemoteObjectExpander::new();
        let params = json!({
            "timestamp": 1_700_000_000_000.0_f64,
            "exceptionDetails": {
                "text": "Uncaught",
                "exception": {
                    "type": "object", "subtype": "error",
                    "description": "TypeError: boom"
                },
                "url": "https://example.test/app.js",
                "lineNumber": 3,
                "columnNumber": 7,
                "scriptId": "9"
            }
        });
        let message = build_exception_message(&mut expander, &NoFetcher, &params)
            .await
            .unwrap();
        assert_eq!(message.level, ConsoleLevel::Error);
        assert_eq!(message.text, "TypeError: boom");
        let stack = message.stack.unwrap();
        assert_eq!(stack[0].url, "https://example.test/app.js");
        assert_eq!(stack[0].line, 3);
    }

    #[tokio::test]
    async fn append_stamps_navigation_id() {
        let store = Mutex::new(TelemetryStore::new(0.0));
        store.lock().unwrap().record_navigation(
            "http://example.test",
            1.0,
            crate::telemetry::NavigationKind::Initial,
        );

        append(
            &store,
            ConsoleMessage {
                level: ConsoleLevel::Log,
                text: "x".into(),
                timestamp: 0.0,
                args: None,
                stack: None,
                navigation_id: None,
            },
        );

        let guard = store.lock().unwrap();
        assert_eq!(guard.console_tail(1)[0].navigation_id, Some(1));
    }

    #[test]
    fn empty_stack_trace_converts_to_none() {
        assert!(convert_stack_trace(&json!({"callFrames": []})).is_none());
        assert!(convert_stack_trace(&json!({})).is_none());
    }
}
