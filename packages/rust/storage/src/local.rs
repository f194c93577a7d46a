//! Local libSQL backend.
//!
//! Rows of every table live in `table_rows` with their cells as a JSON
//! object, so any column layout from `[store.columns]` works unchanged.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use granthub_shared::{Columns, GrantHubError, KnowledgeEntry, Result, Row, RowId, RowUpdates};

use crate::{KnowledgeStore, RowFilter, TableStore, migrations};

/// Storage handle wrapping a local libSQL database.
pub struct LocalStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

fn read_err(e: impl std::fmt::Display) -> GrantHubError {
    GrantHubError::StoreRead(e.to_string())
}

fn write_err(e: impl std::fmt::Display) -> GrantHubError {
    GrantHubError::StoreWrite(e.to_string())
}

impl LocalStore {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GrantHubError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| GrantHubError::config(format!("failed to open {}: {e}", path.display())))?;

        let conn = db.connect().map_err(read_err)?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    GrantHubError::StoreWrite(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    async fn load_columns(&self, table_id: &str, row_id: &str) -> Result<Option<Columns>> {
        let mut rows = self
            .conn
            .query(
                "SELECT columns_json FROM table_rows WHERE table_id = ?1 AND row_id = ?2",
                params![table_id, row_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => {
                let raw = row.get::<String>(0).map_err(read_err)?;
                Ok(Some(parse_columns(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Every knowledge entry in a table, in insertion order.
    pub async fn list_knowledge_rows(&self, table_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT grant_name, grant_period, grant_description, eligibility_criteria,
                        application_steps, document_required
                 FROM knowledge_rows WHERE table_id = ?1 ORDER BY rowid",
                params![table_id],
            )
            .await
            .map_err(read_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            entries.push(KnowledgeEntry {
                name: row.get::<String>(0).map_err(read_err)?,
                period: row.get::<Option<String>>(1).map_err(read_err)?,
                description: row.get::<String>(2).map_err(read_err)?,
                eligibility_criteria: row.get::<Option<String>>(3).map_err(read_err)?,
                application_steps: row.get::<Option<String>>(4).map_err(read_err)?,
                document_required: row.get::<Option<String>>(5).map_err(read_err)?,
            });
        }
        Ok(entries)
    }
}

fn parse_columns(raw: &str) -> Result<Columns> {
    match serde_json::from_str::<Value>(raw).map_err(read_err)? {
        Value::Object(map) => Ok(map),
        _ => Err(GrantHubError::StoreRead(
            "stored columns are not a JSON object".into(),
        )),
    }
}

#[async_trait]
impl TableStore for LocalStore {
    #[instrument(skip_all, fields(table_id = %table_id, rows = rows.len()))]
    async fn add_rows(&self, table_id: &str, rows: Vec<Columns>) -> Result<Vec<RowId>> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(write_err)?;
        let mut ids = Vec::with_capacity(rows.len());

        for columns in rows {
            let row_id = Uuid::now_v7().to_string();
            let json = Value::Object(columns).to_string();
            tx.execute(
                "INSERT INTO table_rows (table_id, row_id, columns_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![table_id, row_id.as_str(), json, now.as_str(), now.as_str()],
            )
            .await
            .map_err(write_err)?;
            ids.push(RowId(row_id));
        }

        tx.commit().await.map_err(write_err)?;
        debug!(count = ids.len(), "rows added");
        Ok(ids)
    }

    async fn list_rows(&self, table_id: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        let mut rows = self
            .conn
            .query(
                "SELECT row_id, columns_json FROM table_rows WHERE table_id = ?1 ORDER BY seq",
                params![table_id],
            )
            .await
            .map_err(read_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            let id = row.get::<String>(0).map_err(read_err)?;
            let raw = row.get::<String>(1).map_err(read_err)?;
            let candidate = Row {
                id: RowId(id),
                columns: parse_columns(&raw)?,
            };
            if filter.matches(&candidate) {
                results.push(candidate);
                if filter.limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }
        Ok(results)
    }

    #[instrument(skip_all, fields(table_id = %table_id, rows = updates.len()))]
    async fn update_rows(&self, table_id: &str, updates: &RowUpdates) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();

        // Read everything first so a missing row fails before any write.
        let mut merged = Vec::with_capacity(updates.len());
        for (row_id, changes) in updates {
            let mut columns = self
                .load_columns(table_id, row_id.as_str())
                .await
                .map_err(write_err)?
                .ok_or_else(|| GrantHubError::StoreWrite(format!("row {row_id} not found")))?;
            for (key, value) in changes {
                columns.insert(key.clone(), value.clone());
            }
            merged.push((row_id, Value::Object(columns).to_string()));
        }

        let tx = self.conn.transaction().await.map_err(write_err)?;
        for (row_id, json) in merged {
            tx.execute(
                "UPDATE table_rows SET columns_json = ?1, updated_at = ?2
                 WHERE table_id = ?3 AND row_id = ?4",
                params![json, now.as_str(), table_id, row_id.as_str()],
            )
            .await
            .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    #[instrument(skip_all, fields(table_id = %table_id, rows = row_ids.len()))]
    async fn delete_rows(&self, table_id: &str, row_ids: &[RowId]) -> Result<()> {
        let tx = self.conn.transaction().await.map_err(write_err)?;
        for row_id in row_ids {
            tx.execute(
                "DELETE FROM table_rows WHERE table_id = ?1 AND row_id = ?2",
                params![table_id, row_id.as_str()],
            )
            .await
            .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    async fn get_row(&self, table_id: &str, row_id: &RowId) -> Result<Option<Row>> {
        Ok(self
            .load_columns(table_id, row_id.as_str())
            .await?
            .map(|columns| Row {
                id: row_id.clone(),
                columns,
            }))
    }
}

#[async_trait]
impl KnowledgeStore for LocalStore {
    #[instrument(skip_all, fields(table_id = %table_id, rows = entries.len()))]
    async fn add_knowledge_rows(&self, table_id: &str, entries: &[KnowledgeEntry]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(write_err)?;
        for entry in entries {
            let id = Uuid::now_v7().to_string();
            tx.execute(
                "INSERT INTO knowledge_rows (id, table_id, grant_name, grant_period,
                    grant_description, eligibility_criteria, application_steps,
                    document_required, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.as_str(),
                    table_id,
                    entry.name.as_str(),
                    entry.period.as_deref(),
                    entry.description.as_str(),
                    entry.eligibility_criteria.as_deref(),
                    entry.application_steps.as_deref(),
                    entry.document_required.as_deref(),
                    now.as_str()
                ],
            )
            .await
            .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(())
    }
}
