//! SQL migration definitions for the local GrantHub database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: table_rows, knowledge_rows",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Generic action-table rows; columns are a JSON object of cells
CREATE TABLE IF NOT EXISTS table_rows (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    table_id     TEXT NOT NULL,
    row_id       TEXT NOT NULL,
    columns_json TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE(table_id, row_id)
);

CREATE INDEX IF NOT EXISTS idx_table_rows_table ON table_rows(table_id);

-- Flattened knowledge entries
CREATE TABLE IF NOT EXISTS knowledge_rows (
    id                   TEXT PRIMARY KEY,
    table_id             TEXT NOT NULL,
    grant_name           TEXT NOT NULL,
    grant_period         TEXT,
    grant_description    TEXT NOT NULL,
    eligibility_criteria TEXT,
    application_steps    TEXT,
    document_required    TEXT,
    created_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_rows_table ON knowledge_rows(table_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
