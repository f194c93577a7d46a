//! Test doubles shared by the stage tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use granthub_gateway::{GenerationConfig, Prompt, TextGenerator};
use granthub_shared::{
    Columns, GrantHubError, KnowledgeEntry, Result, Row, RowId, RowUpdates, StoreConfig,
};
use granthub_storage::{KnowledgeStore, RowFilter, TableStore};

// ---------------------------------------------------------------------------
// ScriptedGenerator
// ---------------------------------------------------------------------------

type Responder = Box<dyn Fn(&Prompt) -> Result<String> + Send + Sync>;

/// Generator that answers through a closure and records every prompt.
pub struct ScriptedGenerator {
    respond: Responder,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn new(respond: impl Fn(&Prompt) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &Prompt, _: &GenerationConfig) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.clone());
        (self.respond)(prompt)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory table and knowledge store with failure switches.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    knowledge: Mutex<BTreeMap<String, Vec<KnowledgeEntry>>>,
    next_id: Mutex<u64>,
    delayed_cells: Mutex<HashMap<RowId, (usize, String, String)>>,
    pub fail_delete: Mutex<bool>,
    pub fail_add: Mutex<bool>,
    pub fail_list: Mutex<bool>,
    pub fail_update_of: Mutex<HashSet<String>>,
    pub fail_knowledge_for: Mutex<HashSet<String>>,
    pub update_calls: Mutex<usize>,
    pub get_calls: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row with a fixed id.
    pub fn seed(&self, table_id: &str, id: &str, columns: Columns) {
        self.tables
            .lock()
            .unwrap()
            .entry(table_id.to_string())
            .or_default()
            .push(Row {
                id: id.into(),
                columns,
            });
    }

    pub fn rows(&self, table_id: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table_id: &str, id: &str) -> Option<Row> {
        self.rows(table_id).into_iter().find(|r| r.id.as_str() == id)
    }

    pub fn knowledge(&self, table_id: &str) -> Vec<KnowledgeEntry> {
        self.knowledge
            .lock()
            .unwrap()
            .get(table_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Write `column = value` on the row once it has been read `reads` times.
    pub fn set_after_reads(&self, row_id: &str, reads: usize, column: &str, value: &str) {
        self.delayed_cells.lock().unwrap().insert(
            row_id.into(),
            (reads, column.to_string(), value.to_string()),
        );
    }

    pub fn set_cell(&self, table_id: &str, row_id: &str, column: &str, value: Value) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) = tables
            .get_mut(table_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id.as_str() == row_id))
        {
            row.columns.insert(column.to_string(), value);
        }
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn add_rows(&self, table_id: &str, rows: Vec<Columns>) -> Result<Vec<RowId>> {
        if *self.fail_add.lock().unwrap() {
            return Err(GrantHubError::StoreWrite("add refused".into()));
        }
        let mut ids = Vec::new();
        for columns in rows {
            let id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                RowId(format!("row-{next}"))
            };
            self.seed(table_id, id.as_str(), columns);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn list_rows(&self, table_id: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        if *self.fail_list.lock().unwrap() {
            return Err(GrantHubError::StoreRead("list refused".into()));
        }
        let rows = self.rows(table_id).into_iter().filter(|r| filter.matches(r));
        Ok(match filter.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn update_rows(&self, table_id: &str, updates: &RowUpdates) -> Result<()> {
        *self.update_calls.lock().unwrap() += 1;
        {
            let refused = self.fail_update_of.lock().unwrap();
            if updates
                .values()
                .any(|cols| cols.keys().any(|k| refused.contains(k)))
            {
                return Err(GrantHubError::StoreWrite("update refused".into()));
            }
        }
        for (id, columns) in updates {
            for (column, value) in columns {
                self.set_cell(table_id, id.as_str(), column, value.clone());
            }
        }
        Ok(())
    }

    async fn delete_rows(&self, table_id: &str, row_ids: &[RowId]) -> Result<()> {
        if *self.fail_delete.lock().unwrap() {
            return Err(GrantHubError::StoreWrite("delete refused".into()));
        }
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table_id) {
            rows.retain(|r| !row_ids.contains(&r.id));
        }
        Ok(())
    }

    async fn get_row(&self, table_id: &str, row_id: &RowId) -> Result<Option<Row>> {
        *self.get_calls.lock().unwrap() += 1;
        let due = {
            let mut delayed = self.delayed_cells.lock().unwrap();
            match delayed.get_mut(row_id) {
                Some((reads, _, _)) if *reads > 1 => {
                    *reads -= 1;
                    None
                }
                Some(_) => delayed.remove(row_id),
                None => None,
            }
        };
        if let Some((_, column, value)) = due {
            self.set_cell(table_id, row_id.as_str(), &column, json!(value));
        }
        Ok(self.row(table_id, row_id.as_str()))
    }
}

#[async_trait]
impl KnowledgeStore for MemoryStore {
    async fn add_knowledge_rows(&self, table_id: &str, entries: &[KnowledgeEntry]) -> Result<()> {
        let refused = self.fail_knowledge_for.lock().unwrap().clone();
        if entries.iter().any(|e| refused.contains(&e.name)) {
            return Err(GrantHubError::StoreWrite("knowledge insert refused".into()));
        }
        self.knowledge
            .lock()
            .unwrap()
            .entry(table_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn store_config() -> StoreConfig {
    StoreConfig::default()
}

/// A complete, valid candidate record as JSON.
pub fn record_json(name: &str) -> Value {
    json!({
        "grantName": { "value": name, "sourceUrl": "https://example.gov/grant" },
        "period": { "range": "1 Jan 2025 - 31 Dec 2025", "sourceUrl": "https://example.gov/grant" },
        "grantDescription": { "text": "Co-funding for digital adoption.", "sourceUrl": "https://example.gov/grant" },
        "applicationProcess": {
            "steps": { "description": "Register, then apply on the portal.", "sourceUrl": "https://example.gov/apply" },
            "requiredDocuments": {
                "sourceUrl": "https://example.gov/docs",
                "files": [
                    { "name": "Company registration", "downloadUrl": "https://example.gov/form.pdf", "sourceUrl": "https://example.gov/docs" }
                ]
            }
        }
    })
}

/// Columns map from `(name, value)` pairs.
pub fn columns(pairs: &[(&str, Value)]) -> Columns {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}
