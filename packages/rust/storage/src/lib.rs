//! Table and knowledge stores for GrantHub.
//!
//! The pipeline only talks to the [`TableStore`] and [`KnowledgeStore`]
//! traits. Two backends implement both:
//! - [`JamaiStore`]: the hosted table product over its REST API
//! - [`LocalStore`]: a libSQL database file for offline runs and tests

mod jamai;
mod local;
mod migrations;

use std::sync::Arc;

use async_trait::async_trait;

use granthub_shared::{
    AppConfig, Columns, Credentials, GrantHubError, KnowledgeEntry, Result, Row, RowId, RowUpdates,
    StoreBackend, expand_home,
};

pub use jamai::{JamaiOptions, JamaiStore};
pub use local::LocalStore;

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// A structured row store. Reads fail with `StoreRead`, writes with `StoreWrite`.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Insert rows and return their new identifiers, in input order.
    async fn add_rows(&self, table_id: &str, rows: Vec<Columns>) -> Result<Vec<RowId>>;

    /// List rows matching `filter`, oldest first.
    async fn list_rows(&self, table_id: &str, filter: &RowFilter) -> Result<Vec<Row>>;

    /// Merge column updates into existing rows in one call.
    async fn update_rows(&self, table_id: &str, updates: &RowUpdates) -> Result<()>;

    /// Delete rows in one call.
    async fn delete_rows(&self, table_id: &str, row_ids: &[RowId]) -> Result<()>;

    /// Fetch one row, or `None` if it does not exist.
    async fn get_row(&self, table_id: &str, row_id: &RowId) -> Result<Option<Row>>;
}

/// Destination for flattened knowledge entries.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn add_knowledge_rows(&self, table_id: &str, entries: &[KnowledgeEntry]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RowFilter
// ---------------------------------------------------------------------------

/// One condition on a column's canonical text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Column holds non-blank text.
    Present(String),
    /// Column is absent or blank.
    Absent(String),
    /// Column text equals the value.
    Equals(String, String),
    /// Column is absent or its text differs from the value.
    NotEquals(String, String),
}

impl Predicate {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Present(col) => row.text(col).is_some(),
            Self::Absent(col) => row.text(col).is_none(),
            Self::Equals(col, value) => row.text(col).as_deref() == Some(value.trim()),
            Self::NotEquals(col, value) => row.text(col).as_deref() != Some(value.trim()),
        }
    }

    fn to_sql(&self) -> String {
        match self {
            Self::Present(col) => format!("{} IS NOT NULL", ident(col)),
            Self::Absent(col) => format!("{} IS NULL", ident(col)),
            Self::Equals(col, value) => format!("{} = {}", ident(col), literal(value)),
            Self::NotEquals(col, value) => {
                let col = ident(col);
                format!("({col} IS NULL OR {col} != {})", literal(value))
            }
        }
    }
}

/// Conjunction of predicates plus an optional row limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub predicates: Vec<Predicate>,
    pub limit: Option<usize>,
}

impl RowFilter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a row satisfies every predicate.
    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }

    /// SQL-style `where` clause for the hosted list endpoint.
    pub fn to_where_clause(&self) -> Option<String> {
        if self.predicates.is_empty() {
            return None;
        }
        Some(
            self.predicates
                .iter()
                .map(Predicate::to_sql)
                .collect::<Vec<_>>()
                .join(" AND "),
        )
    }
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Both store handles, backed by the same configured backend.
#[derive(Clone)]
pub struct Stores {
    pub tables: Arc<dyn TableStore>,
    pub knowledge: Arc<dyn KnowledgeStore>,
}

impl Stores {
    /// Open the backend named in `[store]`.
    pub async fn open(config: &AppConfig, credentials: &Credentials) -> Result<Self> {
        match config.store.backend {
            StoreBackend::Jamai => {
                let creds = credentials.store.as_ref().ok_or_else(|| {
                    GrantHubError::config("hosted store credentials are not configured")
                })?;
                let store = Arc::new(JamaiStore::new(JamaiOptions {
                    base_url: config.store.base_url.clone(),
                    project_id: creds.project_id.clone(),
                    api_key: creds.api_key.clone(),
                    timeout_secs: jamai::DEFAULT_TIMEOUT_SECS,
                })?);
                Ok(Self {
                    tables: store.clone(),
                    knowledge: store,
                })
            }
            StoreBackend::Local => {
                let path = expand_home(&config.store.local_path)?;
                let store = Arc::new(LocalStore::open(&path).await?);
                Ok(Self {
                    tables: store.clone(),
                    knowledge: store,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        Row {
            id: "r1".into(),
            columns: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn predicates_use_canonical_text() {
        let r = row(&[
            ("grant_final", json!({ "value": "{}" })),
            ("grant_decider", json!("proceed")),
            ("status", json!("  ")),
        ]);
        assert!(Predicate::Present("grant_final".into()).matches(&r));
        assert!(Predicate::Absent("status".into()).matches(&r));
        assert!(Predicate::Absent("missing".into()).matches(&r));
        assert!(Predicate::Equals("grant_decider".into(), "proceed".into()).matches(&r));
        assert!(Predicate::NotEquals("status".into(), "synced".into()).matches(&r));
    }

    #[test]
    fn filter_is_a_conjunction() {
        let filter = RowFilter::all()
            .and(Predicate::Present("a".into()))
            .and(Predicate::NotEquals("b".into(), "synced".into()));
        assert!(filter.matches(&row(&[("a", json!("x"))])));
        assert!(!filter.matches(&row(&[("a", json!("x")), ("b", json!("synced"))])));
        assert!(RowFilter::all().matches(&row(&[])));
    }

    #[test]
    fn where_clause_quotes_identifiers_and_literals() {
        let filter = RowFilter::all()
            .and(Predicate::Present("grant_final".into()))
            .and(Predicate::Equals(
                "grant_decider".into(),
                "proceed to knowledge table sync".into(),
            ))
            .and(Predicate::NotEquals(
                "knowledge_sync_status".into(),
                "synced".into(),
            ))
            .limit(20);
        assert_eq!(
            filter.to_where_clause().unwrap(),
            "\"grant_final\" IS NOT NULL AND \"grant_decider\" = 'proceed to knowledge table sync' \
             AND (\"knowledge_sync_status\" IS NULL OR \"knowledge_sync_status\" != 'synced')"
        );

        let tricky = RowFilter::all().and(Predicate::Equals("a\"b".into(), "it's".into()));
        assert_eq!(tricky.to_where_clause().unwrap(), "\"a\"\"b\" = 'it''s'");
        assert!(RowFilter::all().to_where_clause().is_none());
    }
}
