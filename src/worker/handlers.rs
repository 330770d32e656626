//! Command handlers. Each runs against the live CDP connection and the
//! telemetry store and produces the `data` payload for one reply. Handlers
//! may fail a single command but never the session.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::sessiondir;
use crate::telemetry::{
    DomNodeSummary, DomQueryResult, ResourceType, TypeFilterError, parse_resource_types,
};

use super::registry::{HandlerError, WorkerContext};
use super::snapshot;

/// Cap on nodes returned (and cached) by one `dom query`.
const MAX_QUERY_NODES: usize = 100;

/// Bounded wait for the load event after `Page.navigate`.
const NAVIGATE_LOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

// =============================================================================
// status / peek
// =============================================================================

pub fn status(ctx: &WorkerContext) -> Result<Value, HandlerError> {
    let guard = lock(&ctx.store);
    let started_at = guard.started_at();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let duration = (sessiondir::epoch_secs_f64() - started_at).max(0.0) as u64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let started_secs = started_at as u64;
    let target = guard.target().cloned().unwrap_or_else(|| ctx.target.clone());

    Ok(json!({
        "pid": std::process::id(),
        "chromePid": ctx.chrome_pid,
        "port": ctx.port,
        "targetUrl": target.url,
        "targetTitle": target.title,
        "startedAt": sessiondir::format_unix_secs(started_secs),
        "duration": duration,
        "activeTelemetry": guard.active_telemetry(),
        "navigationId": guard.navigation_id(),
    }))
}

pub fn get_peek(
    ctx: &WorkerContext,
    last: Option<u64>,
    types: Option<&str>,
) -> Result<Value, HandlerError> {
    let type_filter: Option<Vec<ResourceType>> = match types {
        Some(raw) => Some(parse_resource_types(raw).map_err(|e| {
            HandlerError::daemon(e.to_string()).with_suggestion(TypeFilterError::suggestion())
        })?),
        None => None,
    };

    #[allow(clippy::cast_possible_truncation)]
    let tail = last.unwrap_or(0) as usize;

    let guard = lock(&ctx.store);
    let mut network = guard.network_tail(tail);
    if let Some(filter) = &type_filter {
        network.retain(|r| filter.contains(&r.resource_type));
    }
    let console = guard.console_tail(tail);

    Ok(json!({
        "preview": {
            "data": {
                "network": network,
                "console": console,
                "navigations": guard.navigations(),
            },
            "counts": {
                "network": guard.network_len(),
                "console": guard.console_len(),
            },
            "navigationId": guard.navigation_id(),
        }
    }))
}

// =============================================================================
// navigation
// =============================================================================

pub async fn navigate(ctx: &WorkerContext, url: &str) -> Result<Value, HandlerError> {
    ctx.conn.ensure_domain("Page").await?;

    // Subscribe before navigating so the load event cannot be missed.
    let mut load_rx = ctx.conn.subscribe("Page.loadEventFired").await?;

    let result = ctx
        .conn
        .send_command("Page.navigate", Some(json!({"url": url})))
        .await?;
    if let Some(error_text) = result["errorText"].as_str() {
        return Err(HandlerError::daemon(format!(
            "navigation to {url} failed: {error_text}"
        )));
    }

    let loaded = tokio::time::timeout(NAVIGATE_LOAD_TIMEOUT, load_rx.recv())
        .await
        .is_ok();

    let title = ctx
        .conn
        .send_command(
            "Runtime.evaluate",
            Some(json!({"expression": "document.title", "returnByValue": true})),
        )
        .await
        .ok()
        .and_then(|v| v["result"]["value"].as_str().map(str::to_owned))
        .unwrap_or_default();

    let navigation_id = {
        let mut guard = lock(&ctx.store);
        guard.set_target(crate::ipc::TargetSummary {
            url: url.to_owned(),
            title,
        });
        guard.navigation_id()
    };
    Ok(json!({
        "url": url,
        "loaded": loaded,
        "navigationId": navigation_id,
    }))
}

// =============================================================================
// dom query / index commands
// =============================================================================

pub async fn dom_query(ctx: &WorkerContext, selector: &str) -> Result<Value, HandlerError> {
    ctx.conn.ensure_domain("DOM").await?;

    // performSearch requires a document to have been requested first.
    ctx.conn
        .send_command("DOM.getDocument", Some(json!({"depth": 0})))
        .await?;

    let search = ctx
        .conn
        .send_command(
            "DOM.performSearch",
            Some(json!({"query": selector, "includeUserAgentShadowDOM": false})),
        )
        .await?;
    let search_id = search["searchId"]
        .as_str()
        .ok_or_else(|| HandlerError::daemon("DOM.performSearch returned no searchId"))?
        .to_owned();
    let result_count = search["resultCount"].as_u64().unwrap_or(0);

    let mut nodes = Vec::new();
    if result_count > 0 {
        let to_index = result_count.min(MAX_QUERY_NODES as u64);
        let results = ctx
            .conn
            .send_command(
                "DOM.getSearchResults",
                Some(json!({
                    "searchId": search_id,
                    "fromIndex": 0,
                    "toIndex": to_index,
                })),
            )
            .await?;
        let node_ids: Vec<i64> = results["nodeIds"]
            .as_array()
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        for node_id in node_ids {
            // Stale node ids can fail to describe mid-walk; skip those.
            let Ok(described) = ctx
                .conn
                .send_command("DOM.describeNode", Some(json!({"nodeId": node_id, "depth": 1})))
                .await
            else {
                continue;
            };
            if let Some(summary) = summarize_node(&described["node"]) {
                nodes.push(summary);
            }
        }
    }

    let _ = ctx
        .conn
        .send_command("DOM.discardSearchResults", Some(json!({"searchId": search_id})))
        .await;

    let navigation_id = Some(lock(&ctx.store).navigation_id());
    let result = DomQueryResult {
        selector: selector.to_owned(),
        nodes,
        navigation_id,
    };

    ctx.query_cache
        .write(&result)
        .map_err(|e| HandlerError::daemon(format!("could not persist query cache: {e}")))?;

    Ok(json!({
        "selector": result.selector,
        "count": result.nodes.len(),
        "navigationId": result.navigation_id,
        "nodes": result.nodes,
    }))
}

pub fn dom_get(ctx: &WorkerContext, index: usize) -> Result<Value, HandlerError> {
    let node = resolve_index(ctx, index)?;
    Ok(serde_json::to_value(&node).unwrap_or(Value::Null))
}

pub async fn dom_click(ctx: &WorkerContext, index: usize) -> Result<Value, HandlerError> {
    let node = resolve_index(ctx, index)?;
    let object_id = resolve_object_id(ctx, node.backend_node_id).await?;

    ctx.conn
        .send_command(
            "Runtime.callFunctionOn",
            Some(json!({
                "objectId": object_id,
                "functionDeclaration": "function() { this.click(); }",
            })),
        )
        .await?;

    Ok(json!({"clicked": true, "backendNodeId": node.backend_node_id}))
}

pub async fn dom_fill(ctx: &WorkerContext, index: usize, value: &str) -> Result<Value, HandlerError> {
    let node = resolve_index(ctx, index)?;

    ctx.conn.ensure_domain("DOM").await?;
    ctx.conn
        .send_command(
            "DOM.focus",
            Some(json!({"backendNodeId": node.backend_node_id})),
        )
        .await?;

    // Clear any existing value, then type the new one as key events so the
    // page sees real input.
    let object_id = resolve_object_id(ctx, node.backend_node_id).await?;
    ctx.conn
        .send_command(
            "Runtime.callFunctionOn",
            Some(json!({
                "objectId": object_id,
                "functionDeclaration": "function() { if ('value' in this) this.value = ''; }",
            })),
        )
        .await?;

    for ch in value.chars() {
        ctx.conn
            .send_command(
                "Input.dispatchKeyEvent",
                Some(json!({"type": "char", "text": ch.to_string()})),
            )
            .await?;
    }

    ctx.conn
        .send_command(
            "Runtime.callFunctionOn",
            Some(json!({
                "objectId": object_id,
                "functionDeclaration":
                    "function() { this.dispatchEvent(new Event('input', {bubbles: true})); \
                     this.dispatchEvent(new Event('change', {bubbles: true})); }",
            })),
        )
        .await?;

    Ok(json!({
        "filled": true,
        "backendNodeId": node.backend_node_id,
        "length": value.chars().count(),
    }))
}

// =============================================================================
// a11y / network body / raw CDP
// =============================================================================

pub async fn a11y_tree(ctx: &WorkerContext) -> Result<Value, HandlerError> {
    let tree = snapshot::capture(&ctx.conn).await?;
    lock(&ctx.store).set_snapshot(tree.clone());
    Ok(json!({"tree": tree}))
}

pub async fn network_body(ctx: &WorkerContext, cdp_request_id: &str) -> Result<Value, HandlerError> {
    let mime_type = {
        let guard = lock(&ctx.store);
        let Some(request) = guard.find_request(cdp_request_id) else {
            return Err(
                HandlerError::daemon(format!("network request {cdp_request_id} not found"))
                    .with_suggestion("Run `bdg peek` to list captured requests"),
            );
        };
        request.mime_type.clone()
    };

    let result = ctx
        .conn
        .send_command(
            "Network.getResponseBody",
            Some(json!({"requestId": cdp_request_id})),
        )
        .await?;

    let raw_body = result["body"].as_str().unwrap_or("");
    let base64_encoded = result["base64Encoded"].as_bool().unwrap_or(false);
    #[allow(clippy::cast_possible_truncation)]
    let cap = ctx.max_body_size as usize;

    // Binary bodies arrive base64-encoded; the size cap applies to the
    // decoded bytes, and the reply re-encodes what survived it.
    let (body, truncated, size) = if base64_encoded {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw_body)
            .map_err(|e| HandlerError::daemon(format!("could not decode response body: {e}")))?;
        let size = bytes.len();
        let truncated = size > cap;
        let kept = if truncated { &bytes[..cap] } else { &bytes[..] };
        (
            base64::engine::general_purpose::STANDARD.encode(kept),
            truncated,
            size,
        )
    } else {
        let size = raw_body.len();
        let (body, truncated) = truncate_at_char_boundary(raw_body, cap);
        (body, truncated, size)
    };

    Ok(json!({
        "requestId": cdp_request_id,
        "body": body,
        "base64Encoded": base64_encoded,
        "truncated": truncated,
        "size": size,
        "mimeType": mime_type,
    }))
}

pub async fn cdp_raw(
    ctx: &WorkerContext,
    method: &str,
    params: Option<Value>,
) -> Result<Value, HandlerError> {
    if !method.contains('.') {
        return Err(HandlerError::daemon(format!(
            "invalid CDP method name: {method}"
        ))
        .with_suggestion("Use the `Domain.method` form, e.g. `Page.captureScreenshot`"));
    }
    Ok(ctx.conn.send_command(method, params).await?)
}

// =============================================================================
// Helpers
// =============================================================================

fn lock(store: &std::sync::Mutex<crate::telemetry::TelemetryStore>) -> std::sync::MutexGuard<'_, crate::telemetry::TelemetryStore> {
    store.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The authoritative navigation id, read through the TTL cache so bursts of
/// index commands avoid redundant lookups.
fn current_navigation_id(ctx: &WorkerContext) -> Option<u64> {
    let mut cache = ctx
        .nav_cache
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    cache.get_with(|| Some(lock(&ctx.store).navigation_id()))
}

/// Validate the query cache and resolve an index to its cached node.
fn resolve_index(ctx: &WorkerContext, index: usize) -> Result<DomNodeSummary, HandlerError> {
    let cached = ctx.query_cache.validate(current_navigation_id(ctx))?;
    let count = cached.nodes.len();
    cached.nodes.into_iter().nth(index).ok_or_else(|| {
        HandlerError::daemon(format!("index {index} out of range ({count} cached results)"))
            .with_suggestion("Run `dom query <selector>` to refresh the result list")
    })
}

/// Resolve a backend node id to a JavaScript object id.
async fn resolve_object_id(ctx: &WorkerContext, backend_node_id: i64) -> Result<String, HandlerError> {
    let resolved = ctx
        .conn
        .send_command(
            "DOM.resolveNode",
            Some(json!({"backendNodeId": backend_node_id})),
        )
        .await?;
    resolved["object"]["objectId"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| {
            HandlerError::daemon(format!(
                "could not resolve backend node {backend_node_id} to an object"
            ))
        })
}

/// Build a `DomNodeSummary` from a `DOM.describeNode` node payload.
fn summarize_node(node: &Value) -> Option<DomNodeSummary> {
    let backend_node_id = node["backendNodeId"].as_i64()?;
    let tag = node["nodeName"].as_str().unwrap_or("").to_ascii_lowercase();

    // Attributes arrive as a flat [name, value, name, value, ...] array.
    let mut attributes = HashMap::new();
    if let Some(flat) = node["attributes"].as_array() {
        for pair in flat.chunks(2) {
            if let [name, value] = pair {
                if let (Some(n), Some(v)) = (name.as_str(), value.as_str()) {
                    attributes.insert(n.to_owned(), v.to_owned());
                }
            }
        }
    }

    // Text preview from immediate child text nodes.
    let text: String = node["children"]
        .as_array()
        .map(|children| {
            children
                .iter()
                .filter(|c| c["nodeType"].as_i64() == Some(3))
                .filter_map(|c| c["nodeValue"].as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    Some(DomNodeSummary {
        backend_node_id,
        tag,
        attributes,
        text_preview: snapshot_preview(&text),
    })
}

fn snapshot_preview(text: &str) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut preview: String = collapsed.chars().take(80).collect();
    if collapsed.chars().count() > 80 {
        preview.push('…');
    }
    preview
}

/// Truncate at a UTF-8 character boundary at or below `max_bytes`.
fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_owned(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_owned(), true)
}
