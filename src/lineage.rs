use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::database::{is_protected, quote_ident, quote_literal};
use crate::errors::{Error, ImportError};
use crate::mapping::{ColumnDecl, MappingConfig};
use crate::models::ImportHistory;

/// The provenance columns every dynamically created table carries. The FK
/// back to `import_history` with ON DELETE CASCADE is what undo relies on.
const METADATA_COLUMNS: &str = "\
    _import_id uuid NOT NULL REFERENCES import_history (import_id) ON DELETE CASCADE,
    _imported_at timestamptz NOT NULL DEFAULT now(),
    _source_row_number integer NOT NULL,
    _corrections_applied jsonb";

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct ExistsRow {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    present: bool,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

pub fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, Error> {
    let row = diesel::sql_query(
        "SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = $1
        ) AS present",
    )
    .bind::<Text, _>(table)
    .get_result::<ExistsRow>(conn)?;
    Ok(row.present)
}

/// Create the target table for a mapping config, with the metadata columns
/// and the `_import_id` index. Idempotent.
pub fn create_table(conn: &mut PgConnection, config: &MappingConfig) -> Result<(), Error> {
    let table = &config.table_name;

    let mut columns: Vec<String> = config
        .db_schema
        .iter()
        .map(|decl| format!("{} {}", quote_ident(&decl.name), decl.declared_type()))
        .collect();
    columns.push(METADATA_COLUMNS.to_string());

    let ddl = format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", quote_ident(table), columns.join(",\n    "));
    diesel::sql_query(ddl).execute(conn)?;

    let index = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (_import_id)",
        quote_ident(&format!("idx_{table}_import_id")),
        quote_ident(table),
    );
    diesel::sql_query(index).execute(conn)?;

    info!(table, "ensured target table");
    Ok(())
}

/// Additive column extension, the only schema evolution supported.
pub fn extend_table(conn: &mut PgConnection, table: &str, columns: &[ColumnDecl]) -> Result<(), Error> {
    for decl in columns {
        // new columns are always nullable: existing rows have no value for them
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            quote_ident(table),
            quote_ident(&decl.name),
            decl.sql_type.as_sql(),
        );
        diesel::sql_query(ddl).execute(conn)?;
    }
    Ok(())
}

/// Undo an import: delete its history row and let the FK cascade remove
/// exactly the data rows it produced. Returns the removed-row count.
pub fn undo_import(conn: &mut PgConnection, target: Uuid) -> Result<usize, Error> {
    use crate::schema::import_history::dsl::*;

    let record: ImportHistory = import_history
        .filter(import_id.eq(target))
        .select(ImportHistory::as_select())
        .first(conn)
        .optional()?
        .ok_or(ImportError::NotFound(target))?;

    let removed = if table_exists(conn, &record.table_name)? {
        let count_sql = format!(
            "SELECT count(*) AS count FROM {} WHERE _import_id = {}::uuid",
            quote_ident(&record.table_name),
            quote_literal(&target.to_string()),
        );
        diesel::sql_query(count_sql).get_result::<CountRow>(conn)?.count
    }
    else {
        0
    };

    diesel::delete(import_history.filter(import_id.eq(target))).execute(conn)?;

    info!(import_id = %target, table = record.table_name, removed, "undid import");
    Ok(removed as usize)
}

/// User tables only; the protected set is never listed.
pub fn list_tables(conn: &mut PgConnection) -> Result<Vec<String>, Error> {
    let rows = diesel::sql_query(
        "SELECT table_name AS name FROM information_schema.tables
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .load::<NameRow>(conn)?;

    Ok(rows.into_iter().map(|r| r.name).filter(|name| !is_protected(name)).collect())
}

#[derive(Debug, Serialize)]
pub struct TableStats {
    pub table_name: String,
    pub row_count: i64,
    pub import_count: i64,
    pub last_imported_at: Option<DateTime<Utc>>,
}

pub fn table_stats(conn: &mut PgConnection, table: &str) -> Result<TableStats, Error> {
    use crate::schema::import_history::dsl::*;

    if is_protected(table) || !table_exists(conn, table)? {
        return Err(Error::Config(format!("table {table} does not exist")));
    }

    let count_sql = format!("SELECT count(*) AS count FROM {}", quote_ident(table));
    let row_count = diesel::sql_query(count_sql).get_result::<CountRow>(conn)?.count;

    let imports: Vec<ImportHistory> = import_history
        .filter(table_name.eq(table))
        .select(ImportHistory::as_select())
        .load(conn)?;

    Ok(TableStats {
        table_name: table.to_string(),
        row_count,
        import_count: imports.len() as i64,
        last_imported_at: imports.iter().filter_map(|i| i.finished_at).max(),
    })
}

pub fn list_imports(conn: &mut PgConnection, table: &str) -> Result<Vec<ImportHistory>, Error> {
    use crate::schema::import_history::dsl::*;

    let records = import_history
        .filter(table_name.eq(table))
        .order(created_at.desc())
        .select(ImportHistory::as_select())
        .load(conn)?;
    Ok(records)
}
