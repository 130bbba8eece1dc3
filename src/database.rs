use std::collections::BTreeMap;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::Text;
use diesel::*;

use crate::config;
use crate::errors::Error;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Operational tables that are never created as user tables, never written by
/// an import, and never exposed to the LLM.
pub const PROTECTED_TABLES: &[&str] = &[
    "import_history",
    "mapping_errors",
    "table_metadata",
    "uploaded_files",
    "upload_sessions",
    "users",
    "file_imports",
    "import_jobs",
    "import_duplicates",
    "query_messages",
    "query_threads",
    "llm_instructions",
    "spatial_ref_sys",
];

pub fn is_protected(table: &str) -> bool {
    PROTECTED_TABLES.iter().any(|t| t.eq_ignore_ascii_case(table))
}

pub fn get_pool() -> Result<PgPool, Error> {
    let url = config::get_database_url()?;
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder().build(manager)?;
    Ok(pool)
}

pub fn get_pool_with_url(url: &str) -> Result<PgPool, Error> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder().build(manager)?;
    Ok(pool)
}

/// Create the system tables if they are missing. Idempotent; run at startup.
pub fn ensure_system_tables(conn: &mut PgConnection) -> Result<(), Error> {
    const DDL: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS import_history (
            import_id uuid PRIMARY KEY,
            fingerprint text NOT NULL,
            table_name text NOT NULL,
            status text NOT NULL,
            strategy text,
            mapping jsonb,
            rows_processed integer NOT NULL DEFAULT 0,
            rows_inserted integer NOT NULL DEFAULT 0,
            rows_skipped integer NOT NULL DEFAULT 0,
            rows_errored integer NOT NULL DEFAULT 0,
            error_message text,
            created_at timestamptz NOT NULL DEFAULT now(),
            finished_at timestamptz
        )",
        "CREATE INDEX IF NOT EXISTS idx_import_history_fingerprint
            ON import_history (fingerprint, table_name)",
        "CREATE TABLE IF NOT EXISTS mapping_errors (
            id uuid PRIMARY KEY,
            import_id uuid NOT NULL REFERENCES import_history (import_id) ON DELETE CASCADE,
            source_row_number integer NOT NULL,
            reason text NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS import_jobs (
            task_id uuid PRIMARY KEY,
            status text NOT NULL,
            progress integer NOT NULL DEFAULT 0,
            message text,
            result jsonb,
            import_id uuid,
            payload jsonb NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS uploaded_files (
            id uuid PRIMARY KEY,
            file_name text NOT NULL,
            size_bytes bigint NOT NULL,
            fingerprint text NOT NULL,
            upload_id uuid,
            created_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS upload_sessions (
            upload_id uuid PRIMARY KEY,
            file_name text NOT NULL,
            declared_size bigint NOT NULL,
            expected_parts integer NOT NULL,
            parts jsonb NOT NULL DEFAULT '{}'::jsonb,
            status text NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS query_threads (
            thread_id uuid PRIMARY KEY,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS query_messages (
            id uuid PRIMARY KEY,
            thread_id uuid NOT NULL REFERENCES query_threads (thread_id) ON DELETE CASCADE,
            role text NOT NULL,
            content jsonb NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        )",
    ];

    for ddl in DDL {
        sql_query(*ddl).execute(conn)?;
    }
    Ok(())
}

/// Quote an identifier for inclusion in dynamically built SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a text literal for inclusion in dynamically built SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct ColumnRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    data_type: String,
}

/// The live database schema as seen by the validator and the analyzer.
/// Protected tables are filtered out at construction so they never reach
/// the LLM context.
#[derive(Debug, Clone, Default)]
pub struct LiveSchema {
    tables: BTreeMap<String, Vec<(String, String)>>,
}

impl LiveSchema {
    pub fn load(conn: &mut PgConnection) -> Result<LiveSchema, Error> {
        let tables = sql_query(
            "SELECT table_name AS name FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
        )
        .load::<NameRow>(conn)?;

        let mut schema = LiveSchema::default();
        for table in tables {
            if is_protected(&table.name) {
                continue;
            }

            let columns = sql_query(
                "SELECT column_name AS name, data_type FROM information_schema.columns
                 WHERE table_schema = 'public' AND table_name = $1
                 ORDER BY ordinal_position",
            )
            .bind::<Text, _>(&table.name)
            .load::<ColumnRow>(conn)?;

            schema.tables.insert(
                table.name,
                columns.into_iter().map(|c| (c.name, c.data_type)).collect(),
            );
        }

        Ok(schema)
    }

    pub fn from_tables(tables: BTreeMap<String, Vec<(String, String)>>) -> LiveSchema {
        LiveSchema { tables }
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn columns(&self, table: &str) -> Option<&[(String, String)]> {
        self.tables.get(table).map(|c| c.as_slice())
    }

    /// The schema summary handed to the LLM. Metadata columns are elided so
    /// the agent reasons about user data only.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (table, columns) in &self.tables {
            out.push_str(table);
            out.push_str(": ");
            let cols: Vec<String> = columns
                .iter()
                .filter(|(name, _)| !name.starts_with('_'))
                .map(|(name, ty)| format!("{name} {ty}"))
                .collect();
            out.push_str(&cols.join(", "));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_tables_are_case_insensitive() {
        assert!(is_protected("import_history"));
        assert!(is_protected("Import_History"));
        assert!(!is_protected("customers"));
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn summary_hides_metadata_columns() {
        let mut tables = BTreeMap::new();
        tables.insert(
            "clients".to_string(),
            vec![
                ("id".to_string(), "integer".to_string()),
                ("_import_id".to_string(), "uuid".to_string()),
            ],
        );
        let schema = LiveSchema::from_tables(tables);
        let summary = schema.summary();
        assert!(summary.contains("id integer"));
        assert!(!summary.contains("_import_id"));
    }
}
