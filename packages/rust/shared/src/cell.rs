//! Normalization of loosely shaped JSON cells into canonical text.
//!
//! Store cells and model output arrive as plain strings, numbers, nested
//! objects or lists. Everything that needs text goes through these two
//! functions so the key precedence lives in one place.

use serde_json::Value;

/// Keys that carry text inside a nested cell, in precedence order.
pub const TEXT_KEYS: [&str; 4] = ["value", "text", "description", "range"];

/// Canonical scalar text of a single store cell.
///
/// Strings are trimmed, numbers and booleans are rendered, objects resolve
/// through [`TEXT_KEYS`]. An object carrying none of those keys, or an array,
/// is returned as its compact JSON text so payload columns survive intact.
/// Blank results become `None`.
pub fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => {
            if TEXT_KEYS.iter().any(|k| map.contains_key(*k)) {
                TEXT_KEYS
                    .iter()
                    .filter_map(|k| map.get(*k))
                    .find_map(cell_text)
            } else if map.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        Value::Array(items) if items.is_empty() => None,
        Value::Array(_) => Some(value.to_string()),
    }
}

/// Depth-first collapse of a nested text-bearing node.
///
/// An object yields its first non-empty [`TEXT_KEYS`] entry; failing that, the
/// collapse of each child value. Lists collapse element-wise. Parts are joined
/// by newlines and empty nodes are skipped.
pub fn collapse_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => {
            let direct = TEXT_KEYS
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(collapse_text);
            direct.or_else(|| join_lines(map.values().filter_map(collapse_text)))
        }
        Value::Array(items) => join_lines(items.iter().filter_map(collapse_text)),
    }
}

/// Return the first candidate that is present and non-blank.
pub fn first_non_empty<I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    candidates
        .into_iter()
        .flatten()
        .find_map(|s| non_empty(&s))
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn join_lines(parts: impl Iterator<Item = String>) -> Option<String> {
    let parts: Vec<String> = parts.collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cell_text_follows_key_precedence() {
        assert_eq!(cell_text(&json!("  hi ")), Some("hi".into()));
        assert_eq!(cell_text(&json!(42)), Some("42".into()));
        assert_eq!(
            cell_text(&json!({ "text": "t", "value": "v" })),
            Some("v".into())
        );
        assert_eq!(
            cell_text(&json!({ "value": "", "description": "d" })),
            Some("d".into())
        );
        assert_eq!(cell_text(&json!({ "range": "2025" })), Some("2025".into()));
    }

    #[test]
    fn cell_text_blank_is_none() {
        assert_eq!(cell_text(&json!(null)), None);
        assert_eq!(cell_text(&json!("   ")), None);
        assert_eq!(cell_text(&json!({ "value": null })), None);
        assert_eq!(cell_text(&json!({})), None);
    }

    #[test]
    fn cell_text_keeps_payload_objects() {
        let text = cell_text(&json!({ "grantName": { "value": "A" } })).unwrap();
        assert_eq!(text, r#"{"grantName":{"value":"A"}}"#);
    }

    #[test]
    fn collapse_prefers_direct_text() {
        let node = json!({ "description": "Apply online", "sourceUrl": "https://x" });
        assert_eq!(collapse_text(&node), Some("Apply online".into()));
    }

    #[test]
    fn collapse_recurses_and_skips_empty_nodes() {
        let node = json!({
            "first": { "text": "one" },
            "empty": { "text": "  " },
            "list": [ { "value": "two" }, null, "three" ]
        });
        assert_eq!(collapse_text(&node), Some("one\ntwo\nthree".into()));
    }

    #[test]
    fn first_non_empty_skips_blanks() {
        let got = first_non_empty([None, Some("  ".into()), Some(" b ".into())]);
        assert_eq!(got, Some("b".into()));
        assert_eq!(first_non_empty([None, None]), None);
    }
}
