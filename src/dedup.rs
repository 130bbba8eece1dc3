use std::collections::HashSet;
use std::sync::Mutex;

use diesel::prelude::*;
use diesel::sql_types::Jsonb;

use crate::database::quote_ident;
use crate::errors::{Error, ImportError};
use crate::fingerprint::values_key;
use crate::inference::SqlType;
use crate::mapping::{DuplicateCheck, MappedRow, MappingConfig};
use crate::models::ImportStatus;

/// File-level duplicate policy. A fingerprint that already produced a
/// successful import of the same table fails the new attempt unless a retry
/// is allowed; a prior import that is still running blocks even a forced
/// import until it reaches a terminal state.
pub fn check_file_level(
    conn: &mut PgConnection,
    file_fingerprint: &str,
    target_table: &str,
    check: &DuplicateCheck,
) -> Result<(), Error> {
    use crate::schema::import_history::dsl::*;

    if !check.check_file_level {
        return Ok(());
    }

    let statuses: Vec<String> = import_history
        .filter(fingerprint.eq(file_fingerprint))
        .filter(table_name.eq(target_table))
        .select(status)
        .load::<String>(conn)?;

    let in_flight = statuses
        .iter()
        .filter_map(|s| ImportStatus::parse(s))
        .any(|s| !s.is_terminal());
    if in_flight {
        return Err(ImportError::DuplicateFileInFlight {
            fingerprint: file_fingerprint.to_string(),
        }
        .into());
    }

    if check.force_import || check.allow_file_level_retry {
        return Ok(());
    }

    let succeeded = statuses
        .iter()
        .filter_map(|s| ImportStatus::parse(s))
        .any(|s| s == ImportStatus::Completed);
    if succeeded {
        return Err(ImportError::DuplicateFile {
            table: target_table.to_string(),
            fingerprint: file_fingerprint.to_string(),
        }
        .into());
    }

    Ok(())
}

/// The uniqueness key derivation shared by the preload and the in-pipeline
/// checks: column names sorted once, values taken in that order.
#[derive(Debug, Clone)]
pub struct UniquenessKey {
    columns: Vec<(String, SqlType)>,
    indices: Vec<usize>,
}

impl UniquenessKey {
    pub fn from_config(config: &MappingConfig) -> Option<UniquenessKey> {
        if !config.duplicate_check.enabled || config.duplicate_check.uniqueness_columns.is_empty() {
            return None;
        }

        let mut names = config.duplicate_check.uniqueness_columns.clone();
        names.sort();
        names.dedup();

        let mut columns = Vec::with_capacity(names.len());
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let index = config.db_schema.iter().position(|c| c.name == name)?;
            columns.push((name, config.db_schema[index].sql_type));
            indices.push(index);
        }

        Some(UniquenessKey { columns, indices })
    }

    pub fn key_of(&self, row: &MappedRow) -> u64 {
        let values: Vec<String> = self.indices.iter().map(|&i| row.values[i].key_text()).collect();
        values_key(&values)
    }

    /// Load every existing key from the target table with a single SELECT
    /// projecting the uniqueness columns. Timestamps are rendered the same
    /// way the mapper renders them so both sides hash identically.
    pub fn load_existing(&self, conn: &mut PgConnection, table: &str) -> Result<HashSet<u64>, Error> {
        #[derive(QueryableByName)]
        struct KeyValuesRow {
            #[diesel(sql_type = Jsonb)]
            key_values: serde_json::Value,
        }

        let projection: Vec<String> = self
            .columns
            .iter()
            .map(|(name, sql_type)| match sql_type {
                SqlType::Timestamp => {
                    format!("coalesce(to_char({}, 'YYYY-MM-DD\"T\"HH24:MI:SS'), '')", quote_ident(name))
                }
                _ => format!("coalesce({}::text, '')", quote_ident(name)),
            })
            .collect();

        let sql = format!(
            "SELECT to_jsonb(ARRAY[{}]) AS key_values FROM {}",
            projection.join(", "),
            quote_ident(table),
        );

        let rows = diesel::sql_query(sql).load::<KeyValuesRow>(conn)?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let values: Vec<String> = row
                .key_values
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|v| v.as_str().unwrap_or_default().to_string())
                        .collect()
                })
                .unwrap_or_default();
            keys.insert(values_key(&values));
        }
        Ok(keys)
    }
}

/// Row-level dedup state shared by all worker chunks. The pre-loaded key set
/// is read-only after construction; the in-flight set catches intra-file
/// duplicates behind a mutex.
pub struct DedupEngine {
    key: UniquenessKey,
    existing: HashSet<u64>,
    seen: Mutex<HashSet<u64>>,
}

impl DedupEngine {
    pub fn new(key: UniquenessKey, existing: HashSet<u64>) -> DedupEngine {
        DedupEngine {
            key,
            existing,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// True when the row is the first appearance of its key, across both the
    /// target table and the file being imported.
    pub fn is_unique(&self, row: &MappedRow) -> bool {
        let key = self.key.key_of(row);
        if self.existing.contains(&key) {
            return false;
        }
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).insert(key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::mapping::CellValue;

    fn config() -> MappingConfig {
        MappingConfig::from_json(
            r#"{
                "table_name": "t",
                "db_schema": {"id": "INTEGER", "email": "TEXT", "name": "TEXT"},
                "mappings": {},
                "duplicate_check": {"enabled": true, "uniqueness_columns": ["name", "email"]}
            }"#,
        )
        .unwrap()
    }

    fn mapped(id: i64, email: &str, name: &str) -> MappedRow {
        MappedRow {
            source_row_number: id as usize,
            values: vec![
                CellValue::Integer(id),
                CellValue::Text(email.to_string()),
                CellValue::Text(name.to_string()),
            ],
            corrections: HashMap::new(),
        }
    }

    #[test]
    fn key_columns_are_sorted_and_indexed() {
        let key = UniquenessKey::from_config(&config()).unwrap();
        // declared as [name, email] but the key sorts them
        let names: Vec<&str> = key.columns.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["email", "name"]);
        assert_eq!(key.indices, vec![1, 2]);
    }

    #[test]
    fn disabled_checks_produce_no_key() {
        let mut config = config();
        config.duplicate_check.enabled = false;
        assert!(UniquenessKey::from_config(&config).is_none());
    }

    #[test]
    fn intra_file_duplicates_are_caught() {
        let key = UniquenessKey::from_config(&config()).unwrap();
        let engine = DedupEngine::new(key, HashSet::new());

        assert!(engine.is_unique(&mapped(1, "a@example.com", "Ann")));
        // same key, different id: id is not a uniqueness column
        assert!(!engine.is_unique(&mapped(2, "A@Example.com ", "ann")));
        assert!(engine.is_unique(&mapped(3, "b@example.com", "Bob")));
    }

    #[test]
    fn preloaded_keys_block_inserts() {
        let key = UniquenessKey::from_config(&config()).unwrap();
        let existing = HashSet::from([key.key_of(&mapped(9, "a@example.com", "Ann"))]);
        let engine = DedupEngine::new(key, existing);

        assert!(!engine.is_unique(&mapped(1, "a@example.com", "Ann")));
        assert!(engine.is_unique(&mapped(2, "new@example.com", "New")));
    }
}
