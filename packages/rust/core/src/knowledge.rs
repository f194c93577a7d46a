//! Knowledge sync: promotes approved, verified rows into the knowledge table
//! and marks the origin rows so they are never promoted twice.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use granthub_shared::{
    ColumnNames, Columns, FAILED_TO_VERIFY, FinalPayload, KnowledgeEntry, Result, RowId,
    RowUpdates, StoreConfig, StoredRow, SyncStatus, cell_text, clamp_sync_limit, collapse_text,
    first_non_empty, timestamp,
};
use granthub_storage::{KnowledgeStore, Predicate, RowFilter, TableStore};

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Flatten a verified record into a knowledge entry.
///
/// Accepts camelCase and snake_case spellings. Fails with a short reason
/// when the name or description cannot be found.
pub fn map_to_knowledge(record: &Value) -> std::result::Result<KnowledgeEntry, String> {
    let text = |key: &str| record.get(key).and_then(collapse_text);
    let process = record
        .get("applicationProcess")
        .or_else(|| record.get("application_process"));

    let name = first_non_empty([text("grantName"), text("grant_name")])
        .ok_or_else(|| "missing grant name".to_string())?;
    let description = first_non_empty([text("grantDescription"), text("grant_description")])
        .ok_or_else(|| "missing grant description".to_string())?;

    let documents = [
        record.get("requiredDocuments"),
        process.and_then(|p| p.get("requiredDocuments")),
        record.get("documentRequired"),
    ]
    .into_iter()
    .flatten()
    .find(|section| is_filled(section));

    Ok(KnowledgeEntry {
        name,
        period: first_non_empty([text("period"), text("grant_period")]),
        description,
        eligibility_criteria: first_non_empty([
            text("eligibilityCriteria"),
            text("eligibility_criteria"),
            record
                .get("grantDescription")
                .and_then(|d| d.get("eligibilityCriteria"))
                .and_then(collapse_text),
        ]),
        application_steps: first_non_empty([
            process.and_then(|p| p.get("steps")).and_then(collapse_text),
            text("application_steps"),
        ]),
        document_required: documents.and_then(document_lines),
    })
}

/// One `"<name> - <link>"` line per file, preferring the download link.
fn document_lines(section: &Value) -> Option<String> {
    if let Some(Value::Array(files)) = section.get("files") {
        let lines: Vec<String> = files
            .iter()
            .filter(|f| f.is_object())
            .filter_map(|file| {
                let name = file.get("name").and_then(cell_text);
                let link = first_non_empty([
                    file.get("downloadUrl").and_then(cell_text),
                    file.get("sourceUrl").and_then(cell_text),
                ]);
                match (name, link) {
                    (Some(name), Some(link)) => Some(format!("{name} - {link}")),
                    (Some(only), None) | (None, Some(only)) => Some(only),
                    (None, None) => None,
                }
            })
            .collect();
        if !lines.is_empty() {
            return Some(lines.join("\n"));
        }
    }
    collapse_text(section)
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Counters for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    /// Rows given a status in this pass.
    pub processed: usize,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Origin rows promoted in this pass.
    pub synced_rows: Vec<RowId>,
    pub errors: Vec<String>,
}

pub struct KnowledgeSync {
    tables: Arc<dyn TableStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    action_table: String,
    knowledge_table: String,
    columns: ColumnNames,
    approved_token: String,
}

impl KnowledgeSync {
    pub fn new(
        tables: Arc<dyn TableStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            tables,
            knowledge,
            action_table: config.action_table_id.clone(),
            knowledge_table: config.knowledge_table_id.clone(),
            columns: config.columns.clone(),
            approved_token: config.approved_token.clone(),
        }
    }

    /// Rows eligible for promotion: verified record, approved, not yet synced.
    pub fn selection(&self, limit: usize) -> RowFilter {
        RowFilter::all()
            .and(Predicate::Present(self.columns.final_payload.clone()))
            .and(Predicate::NotEquals(
                self.columns.final_payload.clone(),
                FAILED_TO_VERIFY.into(),
            ))
            .and(Predicate::Equals(
                self.columns.decision.clone(),
                self.approved_token.clone(),
            ))
            .and(Predicate::NotEquals(
                self.columns.sync_status.clone(),
                "synced".into(),
            ))
            .limit(limit)
    }

    /// Sentinel rows that have not been marked yet.
    fn unmarked_sentinels(&self, limit: usize) -> RowFilter {
        RowFilter::all()
            .and(Predicate::Equals(
                self.columns.final_payload.clone(),
                FAILED_TO_VERIFY.into(),
            ))
            .and(Predicate::Absent(self.columns.sync_status.clone()))
            .limit(limit)
    }

    /// Promote up to `limit` rows (clamped to 1..=100).
    ///
    /// Every status is written in one update call at the end. A failure of
    /// that write is recorded but never reverts inserted knowledge rows.
    #[instrument(skip_all, fields(table_id = %self.action_table))]
    pub async fn sync(&self, limit: usize) -> Result<SyncSummary> {
        let limit = clamp_sync_limit(limit);
        let selected = self
            .tables
            .list_rows(&self.action_table, &self.selection(limit))
            .await?;
        let sentinels = self
            .tables
            .list_rows(&self.action_table, &self.unmarked_sentinels(limit))
            .await?;
        info!(
            selected = selected.len(),
            sentinels = sentinels.len(),
            "sync rows listed"
        );

        let mut summary = SyncSummary::default();
        let mut statuses: Vec<(RowId, SyncStatus)> = Vec::new();

        for row in sentinels.iter().chain(selected.iter()) {
            let stored = StoredRow::from_row(row, &self.columns);
            if stored.is_terminal() || statuses.iter().any(|(id, _)| *id == stored.row_id) {
                continue;
            }
            let status = match stored.final_state() {
                Some(FinalPayload::Verified(record)) => self.promote(&record).await,
                Some(FinalPayload::FailedToVerify) => {
                    if matches!(stored.sync_status, Some(SyncStatus::Skipped(_))) {
                        continue;
                    }
                    SyncStatus::Skipped("final payload is failed to verify".into())
                }
                Some(FinalPayload::Invalid(reason)) => SyncStatus::Failed(reason),
                None => continue,
            };
            match &status {
                SyncStatus::Synced => {
                    summary.synced += 1;
                    summary.synced_rows.push(stored.row_id.clone());
                }
                SyncStatus::Skipped(_) => summary.skipped += 1,
                SyncStatus::Failed(reason) => {
                    summary.failed += 1;
                    summary.errors.push(format!("{}: {reason}", stored.row_id));
                }
            }
            statuses.push((stored.row_id, status));
        }
        summary.processed = statuses.len();

        if !statuses.is_empty() {
            let stamp = timestamp(Utc::now());
            let updates: RowUpdates = statuses
                .iter()
                .map(|(id, status)| {
                    let mut columns = Columns::new();
                    columns.insert(
                        self.columns.sync_status.clone(),
                        Value::String(status.to_column()),
                    );
                    columns.insert(
                        self.columns.updated_at.clone(),
                        Value::String(stamp.clone()),
                    );
                    (id.clone(), columns)
                })
                .collect();
            if let Err(e) = self.tables.update_rows(&self.action_table, &updates).await {
                warn!(error = %e, rows = updates.len(), "writing sync statuses failed");
                summary.errors.push(format!("writing sync statuses failed: {e}"));
            }
        }

        info!(
            processed = summary.processed,
            synced = summary.synced,
            skipped = summary.skipped,
            failed = summary.failed,
            "sync finished"
        );
        Ok(summary)
    }

    async fn promote(&self, record: &Value) -> SyncStatus {
        let entry = match map_to_knowledge(record) {
            Ok(entry) => entry,
            Err(reason) => return SyncStatus::Failed(reason),
        };
        match self
            .knowledge
            .add_knowledge_rows(&self.knowledge_table, std::slice::from_ref(&entry))
            .await
        {
            Ok(()) => SyncStatus::Synced,
            Err(e) => {
                warn!(name = %entry.name, error = %e, "knowledge insert failed");
                SyncStatus::Failed(e.to_string())
            }
        }
    }
}
