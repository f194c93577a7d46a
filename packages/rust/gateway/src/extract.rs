//! Best-effort JSON extraction from language-model text.
//!
//! Fallback order is fixed: code fences are stripped, then the text is parsed
//! directly, then the first balanced `{...}` / `[...]` span is parsed, then
//! that span is repaired (curly quotes, trailing commas) and parsed again.
//! When everything fails the caller gets [`Extraction::Unparsed`] and decides
//! what the fallback value is.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").expect("valid fence regex")
});

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid trailing comma regex"));

/// Which step of the fallback chain produced a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// The whole (fence-stripped) text parsed as JSON.
    Direct(Value),
    /// A balanced span inside surrounding prose parsed as JSON.
    Embedded(Value),
    /// The balanced span parsed after light repair.
    Repaired(Value),
    /// Nothing parsed; carries the fence-stripped text.
    Unparsed(String),
}

impl Extraction {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Direct(v) | Self::Embedded(v) | Self::Repaired(v) => Some(v),
            Self::Unparsed(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Direct(v) | Self::Embedded(v) | Self::Repaired(v) => Some(v),
            Self::Unparsed(_) => None,
        }
    }

    /// Short label for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Embedded(_) => "embedded",
            Self::Repaired(_) => "repaired",
            Self::Unparsed(_) => "unparsed",
        }
    }
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> String {
    match FENCE_RE.captures(text) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        None => text.trim().to_string(),
    }
}

/// Extract a JSON object from model text.
pub fn extract_object(text: &str) -> Extraction {
    extract_with(text, '{', '}', Value::is_object)
}

/// Extract a JSON array from model text.
pub fn extract_array(text: &str) -> Extraction {
    extract_with(text, '[', ']', Value::is_array)
}

fn extract_with(text: &str, open: char, close: char, accept: fn(&Value) -> bool) -> Extraction {
    let stripped = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str::<Value>(&stripped) {
        if accept(&value) {
            return Extraction::Direct(value);
        }
    }

    let Some(span) = balanced_span(&stripped, open, close) else {
        // Repair may still make an unterminated-looking span parse.
        return match repair(&stripped)
            .and_then(|fixed| balanced_span(&fixed, open, close).map(str::to_string))
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .filter(accept)
        {
            Some(value) => Extraction::Repaired(value),
            None => Extraction::Unparsed(stripped),
        };
    };

    if let Ok(value) = serde_json::from_str::<Value>(span) {
        if accept(&value) {
            return Extraction::Embedded(value);
        }
    }

    if let Some(fixed) = repair(span) {
        if let Ok(value) = serde_json::from_str::<Value>(&fixed) {
            if accept(&value) {
                return Extraction::Repaired(value);
            }
        }
    }

    Extraction::Unparsed(stripped)
}

/// Normalize typographic quotes and drop trailing commas.
/// Returns `None` when nothing changed.
fn repair(text: &str) -> Option<String> {
    let quoted: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();
    let fixed = TRAILING_COMMA_RE.replace_all(&quoted, "$1").into_owned();
    (fixed != text).then_some(fixed)
}

/// Find the first balanced span starting at `open`, ignoring brackets that
/// appear inside JSON string literals.
fn balanced_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' | '\u{201C}' | '\u{201D}' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' | '\u{201C}' | '\u{201D}' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}
