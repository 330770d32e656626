use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use super::CollectorHandle;
use crate::cdp::{CdpConnection, CdpError};
use crate::telemetry::{NetworkRequest, ResourceType, TelemetryStore, is_noise_url};

/// Start the network collector.
///
/// Enables the `Network` domain and subscribes to the four request lifecycle
/// events, upserting `NetworkRequest` entries keyed by CDP request id. Each
/// entry is stamped with the navigation id current at creation time.
///
/// # Errors
///
/// Returns `CdpError` if enabling the domain or subscribing fails.
pub async fn start_network_collector(
    conn: &Arc<CdpConnection>,
    store: Arc<Mutex<TelemetryStore>>,
    include_all: bool,
) -> Result<CollectorHandle, CdpError> {
    conn.ensure_domain("Network").await?;

    let mut request_rx = conn.subscribe("Network.requestWillBeSent").await?;
    let mut response_rx = conn.subscribe("Network.responseReceived").await?;
    let mut finished_rx = conn.subscribe("Network.loadingFinished").await?;
    let mut failed_rx = conn.subscribe("Network.loadingFailed").await?;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = request_rx.recv() => {
                    let Some(ev) = event else { break };
                    on_request_will_be_sent(&store, &ev.params, include_all);
                }
                event = response_rx.recv() => {
                    let Some(ev) = event else { break };
                    on_response_received(&store, &ev.params);
                }
                event = finished_rx.recv() => {
                    let Some(ev) = event else { break };
                    on_loading_finished(&store, &ev.params);
                }
                event = failed_rx.recv() => {
                    let Some(ev) = event else { break };
                    on_loading_failed(&store, &ev.params);
                }
            }
        }
        debug!("network collector stopped");
    });

    Ok(CollectorHandle::new("network", task))
}

fn on_request_will_be_sent(store: &Mutex<TelemetryStore>, params: &Value, include_all: bool) {
    let Some(request_id) = params["requestId"].as_str() else {
        return;
    };
    let url = params["request"]["url"].as_str().unwrap_or("").to_owned();
    if !include_all && is_noise_url(&url) {
        return;
    }

    let method = params["request"]["method"]
        .as_str()
        .unwrap_or("GET")
        .to_owned();
    let resource_type = params["type"]
        .as_str()
        .and_then(ResourceType::from_token)
        .unwrap_or(ResourceType::Other);
    let timestamp = params["wallTime"]
        .as_f64()
        .or_else(|| params["timestamp"].as_f64())
        .unwrap_or(0.0);
    let headers = params["request"].get("headers").cloned();

    let mut guard = store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let navigation_id = Some(guard.navigation_id());

    // A second requestWillBeSent for the same id is a redirect hop: the
    // entry is updated in place rather than duplicated.
    if guard.find_request(request_id).is_some() {
        guard.update_request(request_id, |req| {
            req.url = url;
            req.method = method;
            req.headers = headers;
        });
        return;
    }

    guard.record_request(NetworkRequest {
        request_id: request_id.to_owned(),
        url,
        method,
        timestamp,
        resource_type,
        status: None,
        headers,
        mime_type: None,
        body_size: None,
        from_cache: None,
        timing: None,
        error_text: None,
        navigation_id,
    });
}

fn on_response_received(store: &Mutex<TelemetryStore>, params: &Value) {
    let Some(request_id) = params["requestId"].as_str() else {
        return;
    };
    let response = &params["response"];
    #[allow(clippy::cast_possible_truncation)]
    let status = response["status"].as_u64().map(|s| s as u16);
    let mime_type = response["mimeType"].as_str().map(String::from);
    let from_cache = response["fromDiskCache"].as_bool();
    let timing = response.get("timing").filter(|t| !t.is_null()).cloned();

    let mut guard = store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.update_request(request_id, |req| {
        req.status = status;
        req.mime_type = mime_type;
        req.from_cache = from_cache;
        req.timing = timing;
    });
}

fn on_loading_finished(store: &Mutex<TelemetryStore>, params: &Value) {
    let Some(request_id) = params["requestId"].as_str() else {
        return;
    };
    let body_size = params["encodedDataLength"].as_u64();

    let mut guard = store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.update_request(request_id, |req| {
        req.body_size = body_size;
    });
}

fn on_loading_failed(store: &Mutex<TelemetryStore>, params: &Value) {
    let Some(request_id) = params["requestId"].as_str() else {
        return;
    };
    let error_text = params["errorText"].as_str().map(String::from);

    let mut guard = store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.update_request(request_id, |req| {
        req.error_text = error_text;
    });
}
