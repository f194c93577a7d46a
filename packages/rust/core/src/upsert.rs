//! Upsert of discovered candidates into the action table, keyed by
//! normalized grant name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use granthub_shared::{
    CandidateRecord, ColumnNames, Columns, ConflictPolicy, Result, RowId, StoreConfig, StoredRow,
    normalize_name, timestamp,
};
use granthub_storage::{RowFilter, TableStore};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one upsert stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertOutcome {
    /// Candidates inserted under a new name.
    pub added: usize,
    /// Candidates that replaced an existing row.
    pub updated: usize,
    /// Candidates dropped because of the conflict policy or a duplicate name.
    pub skipped: usize,
    /// Identifiers of the rows just inserted, in candidate order.
    pub row_ids: Vec<RowId>,
    /// Identifiers of the rows deleted by replacement.
    pub replaced: Vec<RowId>,
}

impl UpsertOutcome {
    pub fn processed(&self) -> usize {
        self.added + self.updated
    }
}

// ---------------------------------------------------------------------------
// UpsertEngine
// ---------------------------------------------------------------------------

/// Reconciles candidates against a fresh snapshot of the action table.
pub struct UpsertEngine {
    store: Arc<dyn TableStore>,
    table_id: String,
    columns: ColumnNames,
    policy: ConflictPolicy,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn TableStore>, config: &StoreConfig, policy: ConflictPolicy) -> Self {
        Self {
            store,
            table_id: config.action_table_id.clone(),
            columns: config.columns.clone(),
            policy,
        }
    }

    /// Normalized name to row ids, read fresh from the store.
    ///
    /// Rows whose draft payload carries no readable name are left out.
    pub async fn snapshot(&self) -> Result<HashMap<String, Vec<RowId>>> {
        let rows = self.store.list_rows(&self.table_id, &RowFilter::all()).await?;
        let mut by_name: HashMap<String, Vec<RowId>> = HashMap::new();
        for row in &rows {
            let stored = StoredRow::from_row(row, &self.columns);
            if let Some(name) = stored.normalized_name() {
                by_name.entry(name).or_default().push(stored.row_id);
            }
        }
        Ok(by_name)
    }

    /// Normalized names currently in the store.
    pub async fn existing_names(&self) -> Result<HashSet<String>> {
        Ok(self.snapshot().await?.into_keys().collect())
    }

    /// Replace-or-insert every candidate.
    ///
    /// Deletions run first as one batch, then insertions as one batch. A
    /// failed deletion aborts before anything is inserted, so no duplicate
    /// row is ever left behind.
    #[instrument(skip_all, fields(table_id = %self.table_id, candidates = candidates.len()))]
    pub async fn upsert(
        &self,
        candidates: &[CandidateRecord],
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let snapshot = self.snapshot().await?;
        let mut seen = HashSet::new();
        let mut inserts: Vec<(&CandidateRecord, bool)> = Vec::new();
        let mut deletes: Vec<RowId> = Vec::new();

        for candidate in candidates {
            let key = normalize_name(candidate.name());
            if !seen.insert(key.clone()) {
                warn!(name = candidate.name(), "duplicate candidate name in batch");
                outcome.skipped += 1;
                continue;
            }
            match (snapshot.get(&key), self.policy) {
                (Some(_), ConflictPolicy::Skip) => {
                    info!(name = candidate.name(), "name exists, keeping stored row");
                    outcome.skipped += 1;
                }
                (Some(existing), ConflictPolicy::Replace) => {
                    deletes.extend(existing.iter().cloned());
                    inserts.push((candidate, true));
                }
                (None, _) => inserts.push((candidate, false)),
            }
        }

        if !deletes.is_empty() {
            self.store.delete_rows(&self.table_id, &deletes).await?;
            info!(rows = deletes.len(), "replaced rows deleted");
        }

        let stamp = timestamp(now);
        let rows: Vec<Columns> = inserts
            .iter()
            .map(|(candidate, _)| self.draft_columns(candidate, &stamp))
            .collect();
        if rows.is_empty() {
            return Ok(outcome);
        }

        outcome.row_ids = self.store.add_rows(&self.table_id, rows).await?;
        outcome.replaced = deletes;
        for (_, replaced) in &inserts {
            if *replaced {
                outcome.updated += 1;
            } else {
                outcome.added += 1;
            }
        }

        info!(
            added = outcome.added,
            updated = outcome.updated,
            skipped = outcome.skipped,
            "upsert finished"
        );
        Ok(outcome)
    }

    fn draft_columns(&self, candidate: &CandidateRecord, stamp: &str) -> Columns {
        let mut columns = Columns::new();
        columns.insert(
            self.columns.draft.clone(),
            Value::String(candidate.to_value().to_string()),
        );
        columns.insert(
            self.columns.updated_at.clone(),
            Value::String(stamp.to_string()),
        );
        columns
    }
}
