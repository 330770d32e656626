//! Accessibility-tree capture.
//!
//! Prefers the real AX tree from `Accessibility.getFullAXTree`. When Chrome
//! reports every node as ignored (headless pages with no AX clients often
//! do), a minimal tree is synthesized from the DOM with implicit ARIA roles
//! and an `inferred` marker.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::cdp::{CdpConnection, CdpError};

/// Maximum characters of text preview used as a synthesized node name.
const MAX_NAME_PREVIEW: usize = 80;

/// Capture the accessibility tree for the current page.
///
/// # Errors
///
/// Returns `CdpError` when the CDP calls fail outright.
pub async fn capture(conn: &CdpConnection) -> Result<Value, CdpError> {
    conn.ensure_domain("Accessibility").await?;
    let result = conn.send_command("Accessibility.getFullAXTree", None).await?;
    let nodes = result["nodes"].as_array().cloned().unwrap_or_default();

    let parsed = parse_ax_nodes(&nodes);
    if parsed.iter().any(|n| !n.ignored) {
        return Ok(build_ax_tree(&parsed));
    }

    // Every AX node is ignored: fall back to the DOM with inferred roles.
    let document = conn
        .send_command("DOM.getDocument", Some(json!({"depth": -1})))
        .await?;
    Ok(synthesize_from_dom(&document["root"]))
}

// =============================================================================
// AX tree
// =============================================================================

struct AxNode {
    node_id: String,
    ignored: bool,
    role: String,
    name: String,
    properties: Vec<(String, Value)>,
    child_ids: Vec<String>,
    backend_dom_node_id: Option<i64>,
}

fn parse_ax_nodes(nodes: &[Value]) -> Vec<AxNode> {
    nodes
        .iter()
        .map(|n| {
            let child_ids = n["childIds"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();

            let properties = n["properties"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| {
                            let name = p["name"].as_str()?.to_string();
                            let value = p["value"]["value"].clone();
                            Some((name, value))
                        })
                        .collect()
                })
                .unwrap_or_default();

            AxNode {
                node_id: n["nodeId"].as_str().unwrap_or_default().to_string(),
                ignored: n["ignored"].as_bool().unwrap_or(false),
                role: n["role"]["value"].as_str().unwrap_or_default().to_string(),
                name: n["name"]["value"].as_str().unwrap_or_default().to_string(),
                properties,
                child_ids,
                backend_dom_node_id: n["backendDOMNodeId"].as_i64(),
            }
        })
        .collect()
}

/// Build the nested tree from the flat AX node list.
///
/// Children of ignored nodes are promoted to their nearest non-ignored
/// ancestor.
fn build_ax_tree(nodes: &[AxNode]) -> Value {
    let by_id: HashMap<&str, &AxNode> = nodes.iter().map(|n| (n.node_id.as_str(), n)).collect();
    let root = nodes.iter().find(|n| !n.ignored);

    root.map_or_else(
        || json!({"role": "document", "name": "", "children": []}),
        |root| render_ax_node(root, &by_id),
    )
}

fn render_ax_node(node: &AxNode, by_id: &HashMap<&str, &AxNode>) -> Value {
    let children = collect_children(node, by_id);

    let mut out = json!({
        "role": node.role,
        "name": node.name,
    });
    if let Some(backend_id) = node.backend_dom_node_id {
        out["backendNodeId"] = json!(backend_id);
    }
    if !node.properties.is_empty() {
        let props: serde_json::Map<String, Value> = node
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out["properties"] = Value::Object(props);
    }
    if !children.is_empty() {
        out["children"] = Value::Array(children);
    }
    out
}

fn collect_children(node: &AxNode, by_id: &HashMap<&str, &AxNode>) -> Vec<Value> {
    node.child_ids
        .iter()
        .filter_map(|id| by_id.get(id.as_str()))
        .flat_map(|child| {
            if child.ignored {
                // Promote grandchildren past the ignored node.
                collect_children(child, by_id)
            } else {
                vec![render_ax_node(child, by_id)]
            }
        })
        .collect()
}

// =============================================================================
// DOM synthesis
// =============================================================================

/// Implicit ARIA role for an element tag. Closed mapping; anything else is
/// `generic`. Headings also report their level.
fn implicit_role(tag: &str) -> (&'static str, Option<u64>) {
    match tag {
        "a" => ("link", None),
        "button" => ("button", None),
        "h1" => ("heading", Some(1)),
        "h2" => ("heading", Some(2)),
        "h3" => ("heading", Some(3)),
        "h4" => ("heading", Some(4)),
        "h5" => ("heading", Some(5)),
        "h6" => ("heading", Some(6)),
        "nav" => ("navigation", None),
        "main" => ("main", None),
        "header" => ("banner", None),
        "footer" => ("contentinfo", None),
        "aside" => ("complementary", None),
        "form" => ("form", None),
        "img" => ("img", None),
        "ul" | "ol" => ("list", None),
        "li" => ("listitem", None),
        "table" => ("table", None),
        "input" | "textarea" => ("textbox", None),
        "select" => ("combobox", None),
        _ => ("generic", None),
    }
}

/// Truncate a text preview at a character boundary.
fn truncate_preview(text: &str, max_chars: usize) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let mut out: String = collapsed.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

/// Collect the concatenated text of a DOM subtree.
fn subtree_text(node: &Value) -> String {
    let mut out = String::new();
    collect_text(node, &mut out);
    out
}

fn collect_text(node: &Value, out: &mut String) {
    // nodeType 3 is a text node.
    if node["nodeType"].as_i64() == Some(3) {
        if let Some(text) = node["nodeValue"].as_str() {
            out.push_str(text);
            out.push(' ');
        }
    }
    if let Some(children) = node["children"].as_array() {
        for child in children {
            collect_text(child, out);
        }
    }
}

/// Synthesize a minimal accessibility node for a DOM subtree.
fn synthesize_from_dom(node: &Value) -> Value {
    // The #document node wraps the html element.
    if node["nodeType"].as_i64() == Some(9) {
        let children: Vec<Value> = node["children"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|c| c["nodeType"].as_i64() == Some(1))
                    .map(synthesize_from_dom)
                    .collect()
            })
            .unwrap_or_default();
        return json!({
            "role": "document",
            "name": "",
            "inferred": true,
            "children": children,
        });
    }

    let tag = node["nodeName"].as_str().unwrap_or("").to_ascii_lowercase();
    let (role, level) = implicit_role(&tag);
    let name = truncate_preview(&subtree_text(node), MAX_NAME_PREVIEW);

    let mut out = json!({
        "role": role,
        "name": name,
        "inferred": true,
    });
    if let Some(level) = level {
        out["properties"] = json!({"level": level});
    }
    if let Some(backend_id) = node["backendNodeId"].as_i64() {
        out["backendNodeId"] = json!(backend_id);
    }

    let children: Vec<Value> = node["children"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter(|c| c["nodeType"].as_i64() == Some(1))
                .map(synthesize_from_dom)
                .collect()
        })
        .unwrap_or_default();
    if !children.is_empty() {
        out["children"] = Value::Array(children);
    }
    out
}
