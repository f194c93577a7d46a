//! Core domain types for GrantHub grant records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cell::cell_text;
use crate::config::ColumnNames;

/// The fixed string stored as a final payload when verification gave up.
pub const FAILED_TO_VERIFY: &str = "failed to verify";

/// Maximum number of characters kept in a sync status value.
pub const MAX_STATUS_LEN: usize = 200;

// ---------------------------------------------------------------------------
// CandidateRecord
// ---------------------------------------------------------------------------

/// A draft grant record proposed by discovery. Every leaf carries a source URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub grant_name: SourcedValue,
    pub period: SourcedRange,
    pub grant_description: SourcedText,
    pub application_process: ApplicationProcess,
}

impl CandidateRecord {
    /// The display name of the grant.
    pub fn name(&self) -> &str {
        self.grant_name.value.trim()
    }

    /// Serialize into a JSON value with the wire (camelCase) field names.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcedValue {
    pub value: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcedRange {
    pub range: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcedText {
    pub text: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcedDescription {
    pub description: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationProcess {
    pub steps: SourcedDescription,
    pub required_documents: RequiredDocuments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredDocuments {
    pub source_url: String,
    pub files: Vec<DocumentFile>,
}

/// One required document. `download_url` is null when no direct link exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFile {
    pub name: String,
    pub download_url: Option<String>,
    pub source_url: String,
}

// ---------------------------------------------------------------------------
// RowId / Row
// ---------------------------------------------------------------------------

/// Opaque row identifier assigned by the structured store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub String);

impl RowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Column map for one row: names to scalars or `{value|text|...}` cells.
pub type Columns = Map<String, Value>;

/// Column updates keyed by row, as sent in one batch update call.
pub type RowUpdates = BTreeMap<RowId, Columns>;

/// A raw row as returned by a table store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub columns: Columns,
}

impl Row {
    /// Canonical text of a column, or `None` when absent or blank.
    pub fn text(&self, column: &str) -> Option<String> {
        self.columns.get(column).and_then(cell_text)
    }
}

// ---------------------------------------------------------------------------
// StoredRow
// ---------------------------------------------------------------------------

/// A persisted grant row, projected through the configured column names.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: RowId,
    pub candidate_payload: Option<String>,
    pub verified_payload: Option<String>,
    pub final_payload: Option<String>,
    pub decision: Option<String>,
    pub sync_status: Option<SyncStatus>,
    pub updated_at: Option<String>,
}

impl StoredRow {
    /// Project a raw row using the configured column names.
    pub fn from_row(row: &Row, columns: &ColumnNames) -> Self {
        Self {
            row_id: row.id.clone(),
            candidate_payload: row.text(&columns.draft),
            verified_payload: row.text(&columns.verified),
            final_payload: row.text(&columns.final_payload),
            decision: row.text(&columns.decision),
            sync_status: row.text(&columns.sync_status).map(|s| SyncStatus::parse(&s)),
            updated_at: row.text(&columns.updated_at),
        }
    }

    /// The parsed draft record, when the draft column holds a JSON object.
    pub fn candidate_value(&self) -> Option<Value> {
        let raw = self.candidate_payload.as_deref()?;
        match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => Some(v),
            _ => None,
        }
    }

    /// Normalized grant name read from the draft payload.
    pub fn normalized_name(&self) -> Option<String> {
        let value = self.candidate_value()?;
        let name = value.get("grantName").and_then(cell_text)?;
        Some(normalize_name(&name))
    }

    /// The final payload, interpreted.
    pub fn final_state(&self) -> Option<FinalPayload> {
        self.final_payload.as_deref().map(FinalPayload::parse)
    }

    /// Whether this row has reached the terminal `synced` state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.sync_status, Some(SyncStatus::Synced))
    }
}

// ---------------------------------------------------------------------------
// FinalPayload
// ---------------------------------------------------------------------------

/// Outcome of verification as stored in the final column.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalPayload {
    /// The echoed or corrected record.
    Verified(Value),
    /// Verification could not produce a trustworthy result.
    FailedToVerify,
    /// The column holds something that is neither a record nor the sentinel.
    Invalid(String),
}

impl FinalPayload {
    /// Interpret a stored final column.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_sentinel(trimmed) {
            return Self::FailedToVerify;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Self::Verified(Value::Object(map)),
            Ok(other) => Self::Invalid(format!("expected a JSON object, got {}", json_kind(&other))),
            Err(e) => Self::Invalid(format!("invalid JSON in final payload: {e}")),
        }
    }

    /// Column value written to the store.
    pub fn to_column(&self) -> String {
        match self {
            Self::Verified(value) => value.to_string(),
            Self::FailedToVerify => FAILED_TO_VERIFY.to_string(),
            Self::Invalid(raw) => raw.clone(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::FailedToVerify)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Whether a string is the verification-failed sentinel (case-insensitive).
pub fn is_sentinel(text: &str) -> bool {
    text.trim().trim_matches('"').eq_ignore_ascii_case(FAILED_TO_VERIFY)
}

// ---------------------------------------------------------------------------
// SyncStatus
// ---------------------------------------------------------------------------

/// Knowledge sync marker written on the origin row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Skipped(String),
    Failed(String),
}

impl SyncStatus {
    /// Parse a stored status. Unrecognized values are kept as failures so that
    /// the row stays eligible for another attempt.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("synced") {
            return Self::Synced;
        }
        if let Some(reason) = strip_prefix_ci(trimmed, "skipped:") {
            return Self::Skipped(reason.trim().to_string());
        }
        if let Some(reason) = strip_prefix_ci(trimmed, "failed:") {
            return Self::Failed(reason.trim().to_string());
        }
        Self::Failed(trimmed.to_string())
    }

    /// Column value written to the store, truncated to [`MAX_STATUS_LEN`].
    pub fn to_column(&self) -> String {
        truncate_chars(&self.to_string(), MAX_STATUS_LEN)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => f.write_str("synced"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Truncate to at most `max` characters, ending in `...` when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

// ---------------------------------------------------------------------------
// KnowledgeEntry
// ---------------------------------------------------------------------------

/// Flattened, publish-ready projection of a verified grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    #[serde(rename = "grant_name")]
    pub name: String,
    #[serde(rename = "grant_period")]
    pub period: Option<String>,
    #[serde(rename = "grant_description")]
    pub description: String,
    pub eligibility_criteria: Option<String>,
    pub application_steps: Option<String>,
    pub document_required: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalize a grant name for matching: trim, collapse whitespace, lowercase.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Current UTC time formatted for the `updated_at` column.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
