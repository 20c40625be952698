// Kabeuchi Engine — Response Extraction
//
// The agent service's response schema is only partially documented and has
// changed shape more than once. All knowledge of it lives in two functions:
//   extract_text      the reply text, by ordered shape heuristics
//   extract_metadata  model name and the tools that actually ran
//
// Both only ever see the *response* body.

use serde_json::{Map, Value};

use crate::atoms::constants::{OFFERED_TOOL_KEYS, TOOL_CALL_SUFFIX, TOOL_TYPE_MARKERS};

/// Model name and tool usage found in a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub model: Option<String>,
    pub tools_used: Vec<String>,
}

// ── Text ───────────────────────────────────────────────────────────────────

/// Reply text from a raw response body.
///
/// Tries, in order: a top-level direct text field, the `output[].content[]`
/// parts, the legacy `choices[0].message.content`. Falls back to the raw body
/// when nothing matches, so an unknown shape never fails the call.
pub fn extract_text(body: &str) -> String {
    let Ok(root) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };

    direct_text(&root)
        .or_else(|| output_text(&root))
        .or_else(|| choice_text(&root))
        .unwrap_or_else(|| body.to_string())
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

fn direct_text(root: &Value) -> Option<String> {
    ["output_text", "text", "output"]
        .iter()
        .find_map(|key| root.get(key).and_then(Value::as_str).and_then(non_empty))
}

fn output_text(root: &Value) -> Option<String> {
    let items = root.get("output")?.as_array()?;
    let mut fragments = Vec::new();
    for item in items {
        match item.get("content") {
            Some(Value::Array(parts)) => fragments.extend(parts.iter().filter_map(part_text)),
            Some(Value::String(s)) => fragments.push(s.clone()),
            _ => {}
        }
    }
    let joined = fragments
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    non_empty(&joined)
}

/// `{"text": "…"}` or the older `{"text": {"value": "…"}}`.
fn part_text(part: &Value) -> Option<String> {
    match part.get("text")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("value").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn choice_text(root: &Value) -> Option<String> {
    root.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .and_then(non_empty)
}

// ── Metadata ───────────────────────────────────────────────────────────────

/// Model name and tools used, from a raw response body.
///
/// Tools are deduplicated case-insensitively (first spelling wins) and
/// sorted case-insensitively. A body that is not JSON yields nothing.
pub fn extract_metadata(body: &str) -> ResponseMetadata {
    let Ok(root) = serde_json::from_str::<Value>(body) else {
        return ResponseMetadata::default();
    };

    let model = root
        .get("model")
        .and_then(Value::as_str)
        .and_then(non_empty);

    let mut tools = Vec::new();
    walk(&root, &mut tools);

    ResponseMetadata { model, tools_used: normalize_tools(tools) }
}

fn walk(value: &Value, tools: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            collect_tools(map, tools);
            for (key, child) in map {
                if OFFERED_TOOL_KEYS.contains(&key.as_str()) {
                    continue;
                }
                walk(child, tools);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| walk(v, tools)),
        _ => {}
    }
}

fn is_tool_type(t: &str) -> bool {
    let lower = t.to_lowercase();
    TOOL_TYPE_MARKERS.contains(&lower.as_str()) || lower.ends_with(TOOL_CALL_SUFFIX)
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn collect_tools(map: &Map<String, Value>, tools: &mut Vec<String>) {
    let ty = str_field(map, "type");
    if let Some(t) = ty.filter(|t| is_tool_type(t)) {
        tools.push(t.to_string());
    }

    // openapi tool: {"type":"openapi","openapi":{"name":…}} or a call item
    // carrying its own name.
    if let Some(name) = map
        .get("openapi")
        .and_then(Value::as_object)
        .and_then(|o| str_field(o, "name"))
    {
        tools.push(format!("openapi:{name}"));
    } else if let (Some(t), Some(name)) = (ty, str_field(map, "name")) {
        if t.to_lowercase().starts_with("openapi") {
            tools.push(format!("openapi:{name}"));
        }
    }

    // function call: flat `function_name`, a `function_call` item with
    // `name`, or the chat-completions `{"function":{"name":…}}` form.
    if let Some(name) = str_field(map, "function_name") {
        tools.push(format!("function:{name}"));
    }
    if let (Some(t), Some(name)) = (ty, str_field(map, "name")) {
        if t.eq_ignore_ascii_case("function_call") {
            tools.push(format!("function:{name}"));
        }
    }
    if let Some(name) = map
        .get("function")
        .and_then(Value::as_object)
        .and_then(|o| str_field(o, "name"))
    {
        tools.push(format!("function:{name}"));
    }
}

fn normalize_tools(tools: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut unique: Vec<String> = tools
        .into_iter()
        .filter(|t| seen.insert(t.to_lowercase()))
        .collect();
    unique.sort_by_key(|t| t.to_lowercase());
    unique
}
