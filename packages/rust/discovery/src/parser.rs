//! Parsers for the two kinds of discovery responses.
//!
//! - Name lists: a JSON array of strings, possibly fenced or wrapped in prose.
//!   When no array can be recovered, Markdown bullet or numbered lines are
//!   accepted instead.
//! - Candidate details: one JSON object checked against the candidate schema.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use granthub_gateway::{Extraction, extract_array, extract_object};
use granthub_shared::{CandidateRecord, GrantHubError, Result, normalize_name, validate_candidate};

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches `- Name`, `* Name`, `1. Name` or `2) Name`.
static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*\u{2022}]|\d+[.)])\s+(.+?)\s*$").expect("list item regex")
});

/// Surrounding quotes or emphasis markers left on a list item.
static DECORATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[\s"'*_`]+|[\s"'*_`,]+$"#).expect("decoration regex")
});

// ---------------------------------------------------------------------------
// Name lists
// ---------------------------------------------------------------------------

/// Parse a candidate name list, deduplicated case-insensitively and capped.
///
/// Order of first appearance is preserved. Blank and non-string entries are
/// dropped. Fails with `MalformedOutput` when nothing usable is found.
pub fn parse_name_list(text: &str, cap: usize) -> Result<Vec<String>> {
    let raw: Vec<String> = match extract_array(text) {
        Extraction::Unparsed(stripped) => bullet_lines(&stripped),
        extraction => extraction
            .into_value()
            .and_then(|v| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
    };

    let mut seen = HashSet::new();
    let names: Vec<String> = raw
        .into_iter()
        .map(|name| name.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(normalize_name(name)))
        .take(cap)
        .collect();

    if names.is_empty() {
        return Err(GrantHubError::malformed(
            "name list response contained no grant names",
        ));
    }
    Ok(names)
}

fn bullet_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| LIST_ITEM_RE.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|m| DECORATION_RE.replace_all(m.as_str(), "").into_owned())
        .collect()
}

// ---------------------------------------------------------------------------
// Candidate details
// ---------------------------------------------------------------------------

/// Parse and validate one candidate detail response.
pub fn parse_candidate(text: &str) -> Result<CandidateRecord> {
    let extraction = extract_object(text);
    let stage = extraction.stage();
    let value = extraction
        .into_value()
        .ok_or_else(|| GrantHubError::malformed("detail response is not a JSON object"))?;
    tracing::trace!(stage, "detail response parsed");
    validate_candidate(&value)
}
