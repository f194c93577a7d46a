//! Verification pass: per-field claim checks followed by one final
//! correction request per row.
//!
//! A row is finalized exactly once. Rows that already carry a final payload
//! are skipped without any gateway call.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use granthub_gateway::{Gateway, GenerationConfig, extract_object, strip_code_fences};
use granthub_shared::{
    ColumnNames, Columns, FinalPayload, GrantHubError, Result, Row, RowId, RowUpdates,
    StoreConfig, StoredRow, cell_text, is_sentinel, timestamp, validate_candidate,
};
use granthub_storage::{Predicate, RowFilter, TableStore};

use crate::prompts;

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Accuracy of one claim against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    Accurate,
    Inaccurate,
    Unknown,
}

impl Accuracy {
    /// Read a boolean or a loose string such as `"true"`, `"no"` or `"unknown"`.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Self::Accurate,
            Value::Bool(false) => Self::Inaccurate,
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "accurate" => Self::Accurate,
                "false" | "no" | "inaccurate" => Self::Inaccurate,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    fn to_value(self) -> Value {
        match self {
            Self::Accurate => Value::Bool(true),
            Self::Inaccurate => Value::Bool(false),
            Self::Unknown => Value::String("unknown".into()),
        }
    }
}

/// Structured verdict for one claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub accuracy: Accuracy,
    pub explanation: String,
    pub evidence: Vec<String>,
}

impl Verdict {
    pub fn unknown(explanation: impl Into<String>) -> Self {
        Self {
            accuracy: Accuracy::Unknown,
            explanation: explanation.into(),
            evidence: Vec::new(),
        }
    }

    /// Parse a claim-check reply. Accepts `accurate` or `is_accurate`.
    pub fn from_response(text: &str) -> Self {
        let Some(value) = extract_object(text).into_value() else {
            return Self::unknown("model returned invalid JSON");
        };
        let accuracy = value
            .get("is_accurate")
            .or_else(|| value.get("accurate"))
            .map(Accuracy::from_value)
            .unwrap_or(Accuracy::Unknown);
        let explanation = value
            .get("explanation")
            .and_then(cell_text)
            .unwrap_or_default();
        let evidence = match value.get("evidence") {
            Some(Value::Array(items)) => items.iter().filter_map(cell_text).collect(),
            Some(other) => cell_text(other).into_iter().collect(),
            None => Vec::new(),
        };
        Self {
            accuracy,
            explanation,
            evidence,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "is_accurate": self.accuracy.to_value(),
            "explanation": self.explanation,
            "evidence": self.evidence,
        })
    }
}

/// Interpret the final correction reply.
///
/// Only a record that passes the candidate schema is accepted; the sentinel,
/// unparseable text and schema failures all become the sentinel.
pub fn resolve_final(text: &str) -> FinalPayload {
    if is_sentinel(&strip_code_fences(text)) {
        return FinalPayload::FailedToVerify;
    }
    let Some(value) = extract_object(text).into_value() else {
        return FinalPayload::FailedToVerify;
    };
    match validate_candidate(&value) {
        Ok(record) => FinalPayload::Verified(record.to_value()),
        Err(e) => {
            debug!(error = %e, "final record rejected by schema");
            FinalPayload::FailedToVerify
        }
    }
}

// ---------------------------------------------------------------------------
// Targets & summary
// ---------------------------------------------------------------------------

/// Which rows a verification pass looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyTarget {
    /// Exactly these rows, in order.
    Rows(Vec<RowId>),
    /// Catch-up: rows with a draft but no final payload, oldest first.
    MissingFinal { limit: usize },
}

/// Counters for one verification pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationSummary {
    /// Rows whose verdict and final columns were both written.
    pub processed: usize,
    /// Rows left alone (already final, or no usable draft).
    pub skipped: usize,
    /// Rows where a request or a write failed.
    pub failed: usize,
    pub verified_written: usize,
    pub final_written: usize,
    /// Final payloads written as the sentinel.
    pub sentinel: usize,
    /// Every row looked at.
    pub row_ids: Vec<RowId>,
    /// Rows whose final payload is now a verified record.
    pub finalized: Vec<RowId>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct RowReport {
    verified_written: bool,
    final_written: Option<FinalPayload>,
    errors: Vec<String>,
}

enum Pending {
    Loaded(Row),
    Id(RowId),
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

pub struct Verifier {
    gateway: Gateway,
    store: Arc<dyn TableStore>,
    table_id: String,
    columns: ColumnNames,
}

impl Verifier {
    pub fn new(gateway: Gateway, store: Arc<dyn TableStore>, config: &StoreConfig) -> Self {
        Self {
            gateway,
            store,
            table_id: config.action_table_id.clone(),
            columns: config.columns.clone(),
        }
    }

    /// Verify the targeted rows one at a time.
    ///
    /// Errors are returned only when the catch-up listing fails. A read
    /// failure while fetching a single row ends the pass with the partial
    /// summary; per-row failures are recorded and the pass continues.
    #[instrument(skip_all, fields(table_id = %self.table_id))]
    pub async fn verify(
        &self,
        target: VerifyTarget,
        cancel: &CancellationToken,
    ) -> Result<VerificationSummary> {
        let queue: Vec<Pending> = match target {
            VerifyTarget::Rows(ids) => ids.into_iter().map(Pending::Id).collect(),
            VerifyTarget::MissingFinal { limit } => {
                let filter = RowFilter::all()
                    .and(Predicate::Present(self.columns.draft.clone()))
                    .and(Predicate::Absent(self.columns.final_payload.clone()))
                    .limit(limit);
                self.store
                    .list_rows(&self.table_id, &filter)
                    .await?
                    .into_iter()
                    .map(Pending::Loaded)
                    .collect()
            }
        };
        info!(rows = queue.len(), "verification started");

        let mut summary = VerificationSummary::default();
        for item in queue {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let row = match item {
                Pending::Loaded(row) => row,
                Pending::Id(id) => match self.store.get_row(&self.table_id, &id).await {
                    Ok(Some(row)) => row,
                    Ok(None) => {
                        summary.failed += 1;
                        summary.errors.push(format!("{id}: row not found"));
                        continue;
                    }
                    Err(e) => {
                        warn!(row_id = %id, error = %e, "row read failed, stopping verification");
                        summary.errors.push(format!("{id}: {e}"));
                        break;
                    }
                },
            };

            let stored = StoredRow::from_row(&row, &self.columns);
            let id = stored.row_id.clone();
            summary.row_ids.push(id.clone());

            if stored.final_payload.is_some() {
                debug!(row_id = %id, "already finalized");
                summary.skipped += 1;
                continue;
            }
            let Some(draft) = stored.candidate_value() else {
                summary.skipped += 1;
                summary
                    .errors
                    .push(format!("{id}: draft payload missing or invalid"));
                continue;
            };

            match self.verify_row(&id, &draft).await {
                Ok(report) => {
                    summary.verified_written += usize::from(report.verified_written);
                    if let Some(payload) = &report.final_written {
                        summary.final_written += 1;
                        if payload.is_sentinel() {
                            summary.sentinel += 1;
                        } else {
                            summary.finalized.push(id.clone());
                        }
                    }
                    if report.errors.is_empty() {
                        summary.processed += 1;
                    } else {
                        summary.failed += 1;
                        summary.errors.extend(report.errors);
                    }
                }
                Err(GrantHubError::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(row_id = %id, error = %e, "verification failed");
                    summary.failed += 1;
                    summary.errors.push(format!("{id}: {e}"));
                }
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            sentinel = summary.sentinel,
            "verification finished"
        );
        Ok(summary)
    }

    /// Check every claim, then write verdicts and the final payload as two
    /// separate updates. A failed request leaves the row untouched.
    async fn verify_row(&self, id: &RowId, draft: &Value) -> Result<RowReport> {
        let verdicts = Value::Object(self.verify_fields(draft).await?);
        let mut report = RowReport::default();

        match self
            .write(id, &self.columns.verified, verdicts.to_string())
            .await
        {
            Ok(()) => report.verified_written = true,
            Err(e) => {
                warn!(row_id = %id, error = %e, "writing verdicts failed");
                report.errors.push(format!("{id}: writing verdicts failed: {e}"));
            }
        }

        let reply = self
            .gateway
            .generate(
                &prompts::final_prompt(draft, &verdicts),
                &GenerationConfig::verification(),
            )
            .await?;
        let payload = resolve_final(&reply);

        match self
            .write(id, &self.columns.final_payload, payload.to_column())
            .await
        {
            Ok(()) => {
                info!(row_id = %id, sentinel = payload.is_sentinel(), "final payload written");
                report.final_written = Some(payload);
            }
            Err(e) => {
                warn!(row_id = %id, error = %e, "writing final payload failed");
                report
                    .errors
                    .push(format!("{id}: writing final payload failed: {e}"));
            }
        }
        Ok(report)
    }

    async fn verify_fields(&self, draft: &Value) -> Result<Map<String, Value>> {
        let mut out = Map::new();

        for (field, key) in [
            ("grantName", "value"),
            ("period", "range"),
            ("grantDescription", "text"),
        ] {
            if let Some(node) = present(draft.get(field)) {
                let verdict = self.check(leaf_text(node, key), source_of(node)).await?;
                out.insert(field.into(), verdict.to_value());
            }
        }

        let mut documents_checked = false;
        if let Some(process) = present(draft.get("applicationProcess")) {
            let mut app = Map::new();
            if let Some(steps) = present(process.get("steps")) {
                let verdict = self
                    .check(leaf_text(steps, "description"), source_of(steps))
                    .await?;
                app.insert("steps".into(), verdict.to_value());
            }
            let documents = self.check_documents(process.get("requiredDocuments")).await?;
            if !documents.is_empty() {
                documents_checked = true;
                app.insert("requiredDocuments".into(), Value::Array(documents));
            }
            if !app.is_empty() {
                out.insert("applicationProcess".into(), Value::Object(app));
            }
        }

        if !documents_checked {
            let documents = self.check_documents(draft.get("requiredDocuments")).await?;
            if !documents.is_empty() {
                out.insert("requiredDocuments".into(), Value::Array(documents));
            }
        }
        Ok(out)
    }

    async fn check_documents(&self, section: Option<&Value>) -> Result<Vec<Value>> {
        let Some(section) = present(section) else {
            return Ok(Vec::new());
        };
        let fallback_url = source_of(section);
        let files = match section.get("files") {
            Some(Value::Array(files)) => files.as_slice(),
            _ => &[],
        };

        let mut verdicts = Vec::with_capacity(files.len());
        for file in files {
            let claim = file
                .get("name")
                .and_then(cell_text)
                .map(|name| format!("Document required: {name}"));
            let url = source_of(file).or_else(|| fallback_url.clone());
            verdicts.push(self.check(claim, url).await?.to_value());
        }
        Ok(verdicts)
    }

    async fn check(&self, claim: Option<String>, source_url: Option<String>) -> Result<Verdict> {
        let Some(claim) = claim else {
            return Ok(Verdict::unknown("missing claim text"));
        };
        let Some(source_url) = source_url else {
            return Ok(Verdict::unknown("missing source URL"));
        };
        let reply = self
            .gateway
            .generate(
                &prompts::claim_prompt(&claim, &source_url),
                &GenerationConfig::verification(),
            )
            .await?;
        Ok(Verdict::from_response(&reply))
    }

    async fn write(&self, id: &RowId, column: &str, value: String) -> Result<()> {
        let mut columns = Columns::new();
        columns.insert(column.to_string(), Value::String(value));
        columns.insert(
            self.columns.updated_at.clone(),
            Value::String(timestamp(Utc::now())),
        );
        let updates = RowUpdates::from([(id.clone(), columns)]);
        self.store.update_rows(&self.table_id, &updates).await
    }
}

fn present(node: Option<&Value>) -> Option<&Value> {
    node.filter(|v| match v {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

fn leaf_text(node: &Value, key: &str) -> Option<String> {
    match node {
        Value::Object(map) => map.get(key).and_then(cell_text),
        other => cell_text(other),
    }
}

fn source_of(node: &Value) -> Option<String> {
    node.get("sourceUrl").and_then(cell_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, ScriptedGenerator, columns, record_json, store_config};
    use granthub_gateway::Prompt;
    use granthub_shared::{BackoffPolicy, ManualClock};
    use std::time::Duration;

    const TABLE: &str = "scrap_result";

    fn gateway(generator: Arc<ScriptedGenerator>) -> Gateway {
        let policy = BackoffPolicy {
            base: Duration::from_secs(15),
            cap: Duration::from_secs(120),
            max_attempts: 3,
        };
        Gateway::new(generator, policy, Arc::new(ManualClock::new()))
    }

    fn is_claim(prompt: &Prompt) -> bool {
        prompt.user.contains("Claim:")
    }

    /// Claims are accurate; the final call echoes `final_reply`.
    fn generator(final_reply: &'static str) -> Arc<ScriptedGenerator> {
        Arc::new(ScriptedGenerator::new(move |prompt| {
            if is_claim(prompt) {
                Ok(r#"{"is_accurate": true, "explanation": "matches", "evidence": ["quote"]}"#.into())
            } else if final_reply == "echo" {
                Ok(format!("```json\n{}\n```", record_json("Digital Grant X")))
            } else {
                Ok(final_reply.into())
            }
        }))
    }

    fn seed_draft(store: &MemoryStore, id: &str, draft: &Value) {
        store.seed(TABLE, id, columns(&[("grant_scrap", json!(draft.to_string()))]));
    }

    fn verifier(generator: Arc<ScriptedGenerator>, store: Arc<MemoryStore>) -> Verifier {
        Verifier::new(gateway(generator), store, &store_config())
    }

    #[test]
    fn verdict_parsing_accepts_both_keys() {
        let v = Verdict::from_response(r#"{"accurate": "false", "explanation": "wrong year"}"#);
        assert_eq!(v.accuracy, Accuracy::Inaccurate);
        assert_eq!(v.explanation, "wrong year");

        let v = Verdict::from_response(r#"{"is_accurate": "unknown", "evidence": "one quote"}"#);
        assert_eq!(v.accuracy, Accuracy::Unknown);
        assert_eq!(v.evidence, vec!["one quote"]);

        let v = Verdict::from_response("The page could not be loaded.");
        assert_eq!(v, Verdict::unknown("model returned invalid JSON"));
        assert_eq!(v.to_value()["is_accurate"], json!("unknown"));
    }

    #[test]
    fn final_reply_resolution() {
        let record = record_json("Digital Grant X");
        assert!(matches!(
            resolve_final(&format!("Corrected:\n{record}")),
            FinalPayload::Verified(_)
        ));
        assert!(resolve_final("Failed to verify").is_sentinel());
        assert!(resolve_final("\"failed to verify\"").is_sentinel());
        assert!(resolve_final("no idea").is_sentinel());
        assert!(resolve_final(r#"{"grantName": {"value": "X"}}"#).is_sentinel());
    }

    #[tokio::test]
    async fn verifies_each_claim_then_writes_both_columns() {
        let store = Arc::new(MemoryStore::new());
        seed_draft(&store, "r1", &record_json("Digital Grant X"));
        let generator = generator("echo");

        let summary = verifier(generator.clone(), store.clone())
            .verify(
                VerifyTarget::Rows(vec![RowId::from("r1")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // name, period, description, steps, one document, final
        assert_eq!(generator.calls(), 6);
        assert!(
            generator
                .prompts()
                .iter()
                .any(|p| p.user.contains("Document required: Company registration"))
        );
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.finalized, vec![RowId::from("r1")]);

        let row = store.row(TABLE, "r1").unwrap();
        let verified: Value = serde_json::from_str(&row.text("grant_verified").unwrap()).unwrap();
        assert_eq!(verified["grantName"]["is_accurate"], json!(true));
        assert_eq!(
            verified["applicationProcess"]["requiredDocuments"][0]["is_accurate"],
            json!(true)
        );
        let stored = StoredRow::from_row(&row, &ColumnNames::default());
        assert!(matches!(stored.final_state(), Some(FinalPayload::Verified(_))));
    }

    #[tokio::test]
    async fn second_pass_makes_no_requests() {
        let store = Arc::new(MemoryStore::new());
        seed_draft(&store, "r1", &record_json("Digital Grant X"));
        let generator = generator("echo");
        let verifier = verifier(generator.clone(), store);
        let target = VerifyTarget::Rows(vec![RowId::from("r1")]);

        verifier
            .verify(target.clone(), &CancellationToken::new())
            .await
            .unwrap();
        let calls = generator.calls();
        let again = verifier
            .verify(target, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(generator.calls(), calls);
        assert_eq!(again.skipped, 1);
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn missing_source_is_unknown_without_a_request() {
        let store = Arc::new(MemoryStore::new());
        let mut draft = record_json("Digital Grant X");
        draft["period"] = json!({ "range": "Ongoing" });
        draft["grantDescription"] = json!({ "text": "", "sourceUrl": "https://example.gov" });
        seed_draft(&store, "r1", &draft);
        let generator = generator("echo");

        verifier(generator.clone(), store.clone())
            .verify(
                VerifyTarget::Rows(vec![RowId::from("r1")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(generator.calls(), 4);
        let row = store.row(TABLE, "r1").unwrap();
        let verified: Value = serde_json::from_str(&row.text("grant_verified").unwrap()).unwrap();
        assert_eq!(verified["period"]["explanation"], json!("missing source URL"));
        assert_eq!(
            verified["grantDescription"]["explanation"],
            json!("missing claim text")
        );
    }

    #[tokio::test]
    async fn unusable_final_reply_stores_the_sentinel() {
        let store = Arc::new(MemoryStore::new());
        seed_draft(&store, "r1", &record_json("Digital Grant X"));

        let summary = verifier(generator("I am not sure about this one."), store.clone())
            .verify(
                VerifyTarget::Rows(vec![RowId::from("r1")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.sentinel, 1);
        assert!(summary.finalized.is_empty());
        let row = store.row(TABLE, "r1").unwrap();
        assert_eq!(row.text("grant_final").as_deref(), Some("failed to verify"));
    }

    #[tokio::test]
    async fn failed_verdict_write_does_not_block_final_write() {
        let store = Arc::new(MemoryStore::new());
        seed_draft(&store, "r1", &record_json("Digital Grant X"));
        store
            .fail_update_of
            .lock()
            .unwrap()
            .insert("grant_verified".into());

        let summary = verifier(generator("echo"), store.clone())
            .verify(
                VerifyTarget::Rows(vec![RowId::from("r1")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.verified_written, 0);
        assert_eq!(summary.final_written, 1);
        assert!(summary.errors[0].contains("writing verdicts failed"));
        let row = store.row(TABLE, "r1").unwrap();
        assert!(row.text("grant_verified").is_none());
        assert!(row.text("grant_final").is_some());
    }

    #[tokio::test]
    async fn request_failure_leaves_row_untouched() {
        let store = Arc::new(MemoryStore::new());
        seed_draft(&store, "r1", &record_json("Digital Grant X"));
        let generator = Arc::new(ScriptedGenerator::new(|_| {
            Err(GrantHubError::RequestFailed("HTTP 500".into()))
        }));

        let summary = verifier(generator, store.clone())
            .verify(
                VerifyTarget::Rows(vec![RowId::from("r1")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        let row = store.row(TABLE, "r1").unwrap();
        assert!(row.text("grant_verified").is_none());
        assert!(row.text("grant_final").is_none());
    }

    #[tokio::test]
    async fn catch_up_selects_rows_without_final() {
        let store = Arc::new(MemoryStore::new());
        seed_draft(&store, "done", &record_json("Grant A"));
        store.set_cell(TABLE, "done", "grant_final", json!("failed to verify"));
        seed_draft(&store, "r2", &record_json("Grant B"));
        seed_draft(&store, "r3", &record_json("Grant C"));
        let generator = generator("echo");

        let summary = verifier(generator, store)
            .verify(VerifyTarget::MissingFinal { limit: 1 }, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.row_ids, vec![RowId::from("r2")]);
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn unknown_row_and_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let generator = generator("echo");
        let verifier = verifier(generator.clone(), store);

        let summary = verifier
            .verify(
                VerifyTarget::Rows(vec![RowId::from("ghost")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].contains("row not found"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = verifier
            .verify(VerifyTarget::Rows(vec![RowId::from("ghost")]), &cancel)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(generator.calls(), 0);
    }
}
