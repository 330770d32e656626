//! Turns CDP `Runtime.RemoteObject` values into human-readable strings for
//! console display. Depth-limited, iterative, and failure-tolerant: whatever
//! Chrome returns, expansion produces a non-empty string.

use serde_json::Value;
use tracing::{debug, info};

use crate::cdp::{CdpConnection, CdpError};

/// How deep nested objects are expanded before falling back to descriptions.
pub const MAX_DEPTH: usize = 3;

/// How many properties of one object are rendered before `, …`.
pub const MAX_PROPERTIES: usize = 100;

/// Consecutive `Runtime.getProperties` failures before the instability log.
pub const FAILURE_LOG_THRESHOLD: u32 = 5;

/// Source of object properties, so expansion is testable without Chrome.
pub trait PropertyFetcher {
    /// Fetch own, enumerable-and-otherwise properties of an object.
    fn get_properties(
        &self,
        object_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>, CdpError>> + Send;
}

impl PropertyFetcher for CdpConnection {
    async fn get_properties(&self, object_id: &str) -> Result<Vec<Value>, CdpError> {
        let result = self
            .send_command(
                "Runtime.getProperties",
                Some(serde_json::json!({
                    "objectId": object_id,
                    "ownProperties": true,
                    "generatePreview": true,
                })),
            )
            .await?;
        Ok(result["result"].as_array().cloned().unwrap_or_default())
    }
}

/// Arena entry for one object being expanded.
struct Frame {
    /// The `RemoteObject` this frame renders.
    object: Value,
    depth: usize,
    /// Child property (name, frame index) pairs, filled by the fetch phase.
    children: Option<Vec<(String, usize)>>,
    /// True when the property list was cut at `MAX_PROPERTIES`.
    capped: bool,
    /// True when `getProperties` failed for this frame.
    fetch_failed: bool,
}

/// Remote-object expander with a consecutive-failure counter shared across
/// all expansions in the worker process.
#[derive(Debug, Default)]
pub struct RemoteObjectExpander {
    consecutive_failures: u32,
}

impl RemoteObjectExpander {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand a `RemoteObject` into display text. Never fails: any internal
    /// error degrades to the object's description or `[<type>]`.
    pub async fn expand<F: PropertyFetcher>(&mut self, fetcher: &F, object: &Value) -> String {
        // Fetch phase: breadth-first over an explicit work queue keyed by
        // (objectId, depth). Children always land at higher arena indices
        // than their parent, so rendering is a single reverse pass.
        let mut arena = vec![Frame {
            object: object.clone(),
            depth: 0,
            children: None,
            capped: false,
            fetch_failed: false,
        }];
        let mut queue = vec![0usize];

        while let Some(index) = queue.pop() {
            let (object_id, depth) = {
                let frame = &arena[index];
                if format_primitive(&frame.object, frame.depth == 0).is_some()
                    || special_description(&frame.object).is_some()
                {
                    continue;
                }
                let Some(id) = arena[index].object["objectId"].as_str() else {
                    continue;
                };
                (id.to_owned(), arena[index].depth)
            };
            if depth >= MAX_DEPTH {
                continue;
            }

            match fetcher.get_properties(&object_id).await {
                Ok(properties) => {
                    self.consecutive_failures = 0;
                    let is_array = arena[index].object["subtype"].as_str() == Some("array");
                    let (children, capped) = select_properties(&properties, is_array);
                    let mut child_refs = Vec::with_capacity(children.len());
                    for (name, value) in children {
                        let child_index = arena.len();
                        arena.push(Frame {
                            object: value,
                            depth: depth + 1,
                            children: None,
                            capped: false,
                            fetch_failed: false,
                        });
                        queue.push(child_index);
                        child_refs.push((name, child_index));
                    }
                    arena[index].children = Some(child_refs);
                    arena[index].capped = capped;
                }
                Err(e) => {
                    self.record_failure(&e);
                    arena[index].fetch_failed = true;
                }
            }
        }

        // Render phase: reverse arena order guarantees children render
        // before their parents.
        let mut rendered: Vec<Option<String>> = vec![None; arena.len()];
        for index in (0..arena.len()).rev() {
            let frame = &arena[index];
            let text = if let Some(children) = &frame.children {
                let parts: Vec<String> = children
                    .iter()
                    .map(|(name, child)| {
                        let child_text = rendered[*child].clone().unwrap_or_default();
                        if frame.object["subtype"].as_str() == Some("array") {
                            child_text
                        } else {
                            format!("{name}: {child_text}")
                        }
                    })
                    .collect();
                render_composite(
                    frame.object["subtype"].as_str() == Some("array"),
                    &parts,
                    frame.capped,
                )
            } else {
                render_leaf(&frame.object, frame.depth == 0)
            };
            rendered[index] = Some(text);
        }

        rendered
            .into_iter()
            .next()
            .flatten()
            .unwrap_or_else(|| fallback(object))
    }

    fn record_failure(&mut self, error: &CdpError) {
        self.consecutive_failures += 1;
        debug!(%error, failures = self.consecutive_failures, "Runtime.getProperties failed");
        if self.consecutive_failures == FAILURE_LOG_THRESHOLD {
            info!(
                failures = self.consecutive_failures,
                "remote-object expansion is unstable; falling back to descriptions"
            );
        }
    }
}

/// Filter a `getProperties` result to renderable children.
///
/// Keeps enumerable properties that carry a value; arrays keep only
/// numeric-named properties, in index order.
fn select_properties(properties: &[Value], is_array: bool) -> (Vec<(String, Value)>, bool) {
    let mut children: Vec<(u64, String, Value)> = Vec::new();
    for prop in properties {
        if !prop["enumerable"].as_bool().unwrap_or(false) {
            continue;
        }
        let Some(name) = prop["name"].as_str() else {
            continue;
        };
        let Some(value) = prop.get("value") else {
            continue;
        };
        if is_array {
            let Ok(index) = name.parse::<u64>() else {
                continue;
            };
            children.push((index, name.to_owned(), value.clone()));
        } else {
            children.push((children.len() as u64, name.to_owned(), value.clone()));
        }
    }
    if is_array {
        children.sort_by_key(|(index, _, _)| *index);
    }

    let capped = children.len() > MAX_PROPERTIES;
    children.truncate(MAX_PROPERTIES);
    (
        children
            .into_iter()
            .map(|(_, name, value)| (name, value))
            .collect(),
        capped,
    )
}

fn render_composite(is_array: bool, parts: &[String], capped: bool) -> String {
    let body = parts.join(", ");
    let suffix = if capped { ", …" } else { "" };
    if is_array {
        format!("[{body}{suffix}]")
    } else {
        format!("{{{body}{suffix}}}")
    }
}

/// Render a frame that was never given children: primitives, specials,
/// depth-limited objects, and fetch failures.
fn render_leaf(object: &Value, top_level: bool) -> String {
    if let Some(text) = format_primitive(object, top_level) {
        return text;
    }
    if let Some(description) = special_description(object) {
        return description;
    }
    fallback(object)
}

/// Format a primitive `RemoteObject` directly.
///
/// Strings are quoted only inside object contexts, not at the top level,
/// matching DevTools behavior.
fn format_primitive(object: &Value, top_level: bool) -> Option<String> {
    if object["type"].as_str() == Some("undefined") {
        return Some("undefined".into());
    }
    if let Some(unserializable) = object["unserializableValue"].as_str() {
        return Some(unserializable.to_owned());
    }
    let value = object.get("value")?;
    if object["objectId"].is_string() {
        // Has an object id: not a plain value.
        return None;
    }
    match value {
        Value::String(s) => {
            if top_level {
                Some(s.clone())
            } else {
                Some(serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\"")))
            }
        }
        other => Some(other.to_string()),
    }
}

/// Descriptions for subtypes that render as-is.
fn special_description(object: &Value) -> Option<String> {
    let subtype = object["subtype"].as_str()?;
    if matches!(subtype, "date" | "regexp" | "error" | "promise") {
        return object["description"].as_str().map(str::to_owned);
    }
    None
}

/// Last-resort rendering: `description`, else `[<type>]`.
fn fallback(object: &Value) -> String {
    object["description"].as_str().map_or_else(
        || format!("[{}]", object["type"].as_str().unwrap_or("unknown")),
        str::to_owned,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    /// Scripted fetcher: objectId → property list, anything else errors.
    struct MapFetcher {
        objects: HashMap<String, Vec<Value>>,
    }

    impl PropertyFetcher for MapFetcher {
        async fn get_properties(&self, object_id: &str) -> Result<Vec<Value>, CdpError> {
            self.objects.get(object_id).cloned().ok_or_else(|| {
                CdpError::Protocol {
                    code: -32000,
                    message: "Could not find object".into(),
                }
            })
        }
    }

    fn prop(name: &str, value: Value) -> Value {
        json!({"name": name, "enumerable": true, "value": value})
    }

    fn empty_fetcher() -> MapFetcher {
        MapFetcher {
            objects: HashMap::new(),
        }
    }

    // --- primitives ---

    #[tokio::test]
    async fn top_level_string_is_unquoted() {
        let mut expander = RemoteObjectExpander::new();
        let obj = json!({"type": "string", "value": "hello"});
        assert_eq!(expander.expand(&empty_fetcher(), &obj).await, "hello");
    }

    #[tokio::test]
    async fn numbers_and_bools_format_directly() {
        let mut expander = RemoteObjectExpander::new();
        let fetcher = empty_fetcher();
        assert_eq!(
            expander
                .expand(&fetcher, &json!({"type": "number", "value": 42}))
                .await,
            "42"
        );
        assert_eq!(
            expander
                .expand(&fetcher, &json!({"type": "boolean", "value": true}))
                .await,
            "true"
        );
    }

    #[tokio::test]
    async fn undefined_and_null() {
        let mut expander = RemoteObjectExpander::new();
        let fetcher = empty_fetcher();
        assert_eq!(
            expander.expand(&fetcher, &json!({"type": "undefined"})).await,
            "undefined"
        );
        assert_eq!(
            expander
                .expand(
                    &fetcher,
                    &json!({"type": "object", "subtype": "null", "value": null})
                )
                .await,
            "null"
        );
    }

    #[tokio::test]
    async fn unserializable_value_is_used() {
        let mut expander = RemoteObjectExpander::new();
        let obj = json!({"type": "number", "unserializableValue": "NaN"});
        assert_eq!(expander.expand(&empty_fetcher(), &obj).await, "NaN");
    }

    // --- special subtypes ---

    #[tokio::test]
    async fn special_subtypes_use_description() {
        let mut expander = RemoteObjectExpander::new();
        let fetcher = empty_fetcher();
        let err = json!({
            "type": "object", "subtype": "error", "objectId": "e1",
            "description": "TypeError: x is not a function"
        });
        assert_eq!(
            expander.expand(&fetcher, &err).await,
            "TypeError: x is not a function"
        );
    }

    // --- arrays and objects ---

    #[tokio::test]
    async fn array_renders_numeric_properties_in_index_order() {
        let mut objects = HashMap::new();
        objects.insert(
            "x".to_owned(),
            vec![
                prop("0", json!({"type": "number", "value": 1})),
                prop("1", json!({"type": "string", "value": "a"})),
                prop("length", json!({"type": "number", "value": 2})),
            ],
        );
        // length is enumerable:false on real arrays; make it explicit here.
        objects.get_mut("x").unwrap()[2]["enumerable"] = json!(false);

        let mut expander = RemoteObjectExpander::new();
        let fetcher = MapFetcher { objects };
        let obj = json!({"type": "object", "subtype": "array", "objectId": "x"});
        assert_eq!(expander.expand(&fetcher, &obj).await, r#"[1, "a"]"#);
    }

    #[tokio::test]
    async fn object_renders_name_value_pairs() {
        let mut objects = HashMap::new();
        objects.insert(
            "o1".to_owned(),
            vec![
                prop("a", json!({"type": "number", "value": 1})),
                prop("b", json!({"type": "string", "value": "two"})),
            ],
        );
        let mut expander = RemoteObjectExpander::new();
        let fetcher = MapFetcher { objects };
        let obj = json!({"type": "object", "objectId": "o1"});
        assert_eq!(expander.expand(&fetcher, &obj).await, r#"{a: 1, b: "two"}"#);
    }

    #[tokio::test]
    async fn nested_objects_expand_to_max_depth() {
        let mut objects = HashMap::new();
        objects.insert(
            "d0".to_owned(),
            vec![prop("child", json!({"type": "object", "objectId": "d1", "description": "Object"}))],
        );
        objects.insert(
            "d1".to_owned(),
            vec![prop("child", json!({"type": "object", "objectId": "d2", "description": "Object"}))],
        );
        objects.insert(
            "d2".to_owned(),
            vec![prop("child", json!({"type": "object", "objectId": "d3", "description": "Object"}))],
        );
        objects.insert(
            "d3".to_owned(),
            vec![prop("unreachable", json!({"type": "number", "value": 9}))],
        );

        let mut expander = RemoteObjectExpander::new();
        let fetcher = MapFetcher { objects };
        let obj = json!({"type": "object", "objectId": "d0"});
        // Depth 3 object is not fetched; it degrades to its description.
        assert_eq!(
            expander.expand(&fetcher, &obj).await,
            "{child: {child: {child: Object}}}"
        );
    }

    #[tokio::test]
    async fn property_cap_appends_ellipsis() {
        let properties: Vec<Value> = (0..150)
            .map(|i| prop(&format!("p{i}"), json!({"type": "number", "value": i})))
            .collect();
        let mut objects = HashMap::new();
        objects.insert("big".to_owned(), properties);

        let mut expander = RemoteObjectExpander::new();
        let fetcher = MapFetcher { objects };
        let obj = json!({"type": "object", "objectId": "big"});
        let text = expander.expand(&fetcher, &obj).await;
        assert!(text.ends_with(", …}"), "got: {text}");
        assert!(text.contains("p0: 0"));
        assert!(text.contains("p99: 99"));
        assert!(!text.contains("p100:"));
    }

    #[tokio::test]
    async fn non_enumerable_properties_are_skipped() {
        let mut objects = HashMap::new();
        objects.insert(
            "o".to_owned(),
            vec![
                prop("visible", json!({"type": "number", "value": 1})),
                json!({"name": "hidden", "enumerable": false,
                       "value": {"type": "number", "value": 2}}),
                json!({"name": "accessor", "enumerable": true}),
            ],
        );
        let mut expander = RemoteObjectExpander::new();
        let fetcher = MapFetcher { objects };
        let obj = json!({"type": "object", "objectId": "o"});
        assert_eq!(expander.expand(&fetcher, &obj).await, "{visible: 1}");
    }

    // --- failure handling ---

    #[tokio::test]
    async fn fetch_failure_falls_back_to_description() {
        let mut expander = RemoteObjectExpander::new();
        let obj = json!({"type": "object", "objectId": "missing", "description": "Window"});
        assert_eq!(expander.expand(&empty_fetcher(), &obj).await, "Window");
    }

    #[tokio::test]
    async fn fetch_failure_without_description_uses_type() {
        let mut expander = RemoteObjectExpander::new();
        let obj = json!({"type": "object", "objectId": "missing"});
        assert_eq!(expander.expand(&empty_fetcher(), &obj).await, "[object]");
    }

    #[tokio::test]
    async fn failure_counter_resets_on_success() {
        let mut objects = HashMap::new();
        objects.insert(
            "good".to_owned(),
            vec![prop("a", json!({"type": "number", "value": 1}))],
        );
        let fetcher = MapFetcher { objects };
        let mut expander = RemoteObjectExpander::new();

        for _ in 0..3 {
            expander
                .expand(&fetcher, &json!({"type": "object", "objectId": "missing"}))
                .await;
        }
        assert_eq!(expander.consecutive_failures, 3);

        expander
            .expand(&fetcher, &json!({"type": "object", "objectId": "good"}))
            .await;
        assert_eq!(expander.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn expansion_always_returns_non_empty_text() {
        let mut expander = RemoteObjectExpander::new();
        let fetcher = empty_fetcher();
        for obj in [
            json!({}),
            json!({"type": "object"}),
            json!({"type": "object", "objectId": "gone"}),
            json!({"type": "symbol", "description": "Symbol(x)"}),
        ] {
            let text = expander.expand(&fetcher, &obj).await;
            assert!(!text.is_empty(), "empty expansion for {obj}");
        }
    }
}
