use std::collections::HashMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::database::{quote_literal, is_protected};
use crate::errors::Error;
use crate::inference::{parse_timestamp, sanitize_table_name, SqlType};
use crate::readers::Row;
use crate::transform::RowTransform;

/// The mapping configuration an import runs under, either user-supplied or
/// produced by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub table_name: String,

    /// Ordered declaration of the target columns. JSON documents carry this
    /// as an object; declaration order is meaningful and preserved.
    #[serde(with = "ordered_schema")]
    pub db_schema: Vec<ColumnDecl>,

    /// target column -> source column
    #[serde(default)]
    pub mappings: HashMap<String, String>,

    #[serde(default)]
    pub rules: TransformRules,

    #[serde(default)]
    pub duplicate_check: DuplicateCheck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDecl {
    pub name: String,
    pub sql_type: SqlType,
    pub not_null: bool,
}

impl ColumnDecl {
    pub fn declared_type(&self) -> String {
        if self.not_null {
            format!("{} NOT NULL", self.sql_type.as_sql())
        }
        else {
            self.sql_type.as_sql().to_string()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformRules {
    #[serde(default)]
    pub row_transformations: Vec<RowTransform>,

    /// target column -> transforms applied during mapping. These mirror the
    /// row operators but never multiply rows.
    #[serde(default)]
    pub column_transformations: HashMap<String, Vec<ColumnTransform>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnTransform {
    RegexReplace {
        pattern: String,
        #[serde(default)]
        replacement: Option<String>,
        #[serde(default)]
        skip_on_no_match: bool,
    },
    MergeColumns {
        sources: Vec<String>,
        #[serde(default = "default_merge_separator")]
        separator: String,
    },
    /// Normalize a list-valued field: split, trim, drop empties, and rejoin
    /// with a canonical separator.
    ExplodeListColumn {
        #[serde(default)]
        delimiter: Option<String>,
        #[serde(default = "default_merge_separator")]
        output_separator: String,
        #[serde(default)]
        dedupe_values: bool,
    },
}

fn default_merge_separator() -> String {
    ", ".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateCheck {
    pub enabled: bool,
    pub check_file_level: bool,
    pub uniqueness_columns: Vec<String>,
    pub allow_file_level_retry: bool,
    pub force_import: bool,
}

impl Default for DuplicateCheck {
    fn default() -> DuplicateCheck {
        DuplicateCheck {
            enabled: false,
            check_file_level: true,
            uniqueness_columns: Vec::new(),
            allow_file_level_retry: false,
            force_import: false,
        }
    }
}

impl MappingConfig {
    pub fn from_json(json: &str) -> Result<MappingConfig, Error> {
        let mut config: MappingConfig = serde_json::from_str(json)?;
        config.table_name = sanitize_table_name(&config.table_name);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.db_schema.is_empty() {
            return Err(Error::Config("db_schema must declare at least one column".to_string()));
        }
        if is_protected(&self.table_name) {
            return Err(Error::Config(format!("table name {} is reserved", self.table_name)));
        }

        for target in self.mappings.keys() {
            if !self.has_column(target) {
                return Err(Error::Config(format!("mapping targets undeclared column {target}")));
            }
        }
        for column in &self.duplicate_check.uniqueness_columns {
            if !self.has_column(column) {
                return Err(Error::Config(format!("uniqueness column {column} is not declared")));
            }
        }
        Ok(())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.db_schema.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.db_schema.iter().map(|c| c.name.clone()).collect()
    }
}

mod ordered_schema {
    use super::*;

    pub fn serialize<S: Serializer>(schema: &[ColumnDecl], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(schema.len()))?;
        for decl in schema {
            map.serialize_entry(&decl.name, &decl.declared_type())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ColumnDecl>, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = Vec<ColumnDecl>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of column name to declared SQL type")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut schema = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, declared)) = access.next_entry::<String, String>()? {
                    let upper = declared.to_uppercase();
                    let not_null = upper.contains("NOT NULL");
                    let base = upper.replace("NOT NULL", "");
                    schema.push(ColumnDecl {
                        name,
                        sql_type: SqlType::parse(base.trim()),
                        not_null,
                    });
                }
                Ok(schema)
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}

/// A typed cell after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Decimal(BigDecimal),
    Timestamp(chrono::NaiveDateTime),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Integer(i) => Value::from(*i),
            CellValue::Decimal(d) => Value::String(d.to_string()),
            CellValue::Timestamp(t) => Value::String(t.format("%Y-%m-%dT%H:%M:%S").to_string()),
            CellValue::Text(s) => Value::String(s.clone()),
        }
    }

    /// Render as a SQL literal for the dynamically built INSERT.
    pub fn to_sql_literal(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Decimal(d) => d.to_string(),
            CellValue::Timestamp(t) => {
                format!("{}::timestamp", quote_literal(&t.format("%Y-%m-%dT%H:%M:%S").to_string()))
            }
            CellValue::Text(s) => quote_literal(s),
        }
    }

    /// The normalized text used when this cell participates in a uniqueness key.
    pub fn key_text(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Decimal(d) => d.to_string(),
            CellValue::Timestamp(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

/// A value change applied during mapping, recorded per field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub before: String,
    pub after: Value,
    pub correction_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_format: Option<String>,
}

/// A row after mapping: values aligned with `db_schema` order, plus any
/// corrections keyed by target column.
#[derive(Debug, Clone)]
pub struct MappedRow {
    pub source_row_number: usize,
    pub values: Vec<CellValue>,
    pub corrections: HashMap<String, Correction>,
}

impl MappedRow {
    pub fn corrections_json(&self) -> Option<Value> {
        if self.corrections.is_empty() {
            None
        }
        else {
            serde_json::to_value(&self.corrections).ok()
        }
    }
}

/// A row the mapper rejected. These are recorded in `mapping_errors` and do
/// not abort the import.
#[derive(Debug, Clone)]
pub struct RowError {
    pub source_row_number: usize,
    pub reason: String,
}

pub struct Mapper<'a> {
    config: &'a MappingConfig,
}

impl<'a> Mapper<'a> {
    pub fn new(config: &'a MappingConfig) -> Mapper<'a> {
        Mapper { config }
    }

    /// Produce the target record for one transformed row.
    pub fn map_row(&self, row: &Row) -> Result<MappedRow, RowError> {
        let mut values = Vec::with_capacity(self.config.db_schema.len());
        let mut corrections = HashMap::new();

        for decl in &self.config.db_schema {
            let source = self.config.mappings.get(&decl.name);
            let original = source.and_then(|s| row.get(s)).unwrap_or_default().to_string();

            let (raw, column_correction) = self
                .apply_column_transforms(&decl.name, &original, row)
                .map_err(|err| RowError {
                    source_row_number: row.source_row_number,
                    reason: err.to_string(),
                })?;

            let (value, coercion_correction) = coerce(&raw, decl.sql_type);

            if value.is_null() && decl.not_null {
                return Err(RowError {
                    source_row_number: row.source_row_number,
                    reason: format!("column {} is NOT NULL but the value {:?} coerced to NULL", decl.name, original),
                });
            }

            // one record per field: a coercion supersedes an earlier column
            // transform, keeping the true original as `before`
            if let Some(mut correction) = coercion_correction {
                correction.before = original.clone();
                corrections.insert(decl.name.clone(), correction);
            }
            else if let Some(correction) = column_correction {
                corrections.insert(decl.name.clone(), correction);
            }

            values.push(value);
        }

        Ok(MappedRow {
            source_row_number: row.source_row_number,
            values,
            corrections,
        })
    }

    fn apply_column_transforms(
        &self,
        target: &str,
        original: &str,
        row: &Row,
    ) -> Result<(String, Option<Correction>), Error> {
        let Some(transforms) = self.config.rules.column_transformations.get(target) else {
            return Ok((original.to_string(), None));
        };

        let mut value = original.to_string();
        let mut correction_type = None;

        for transform in transforms {
            match transform {
                ColumnTransform::RegexReplace {
                    pattern,
                    replacement,
                    skip_on_no_match,
                } => {
                    let regex = Regex::new(pattern)
                        .map_err(|err| Error::Config(format!("invalid regex '{pattern}': {err}")))?;
                    if !regex.is_match(&value) && *skip_on_no_match {
                        continue;
                    }
                    if let Some(replacement) = replacement {
                        let replaced = regex.replace_all(&value, replacement.as_str()).to_string();
                        if replaced != value {
                            value = replaced;
                            correction_type = Some("regex_replace");
                        }
                    }
                }

                ColumnTransform::MergeColumns { sources, separator } => {
                    let merged = sources
                        .iter()
                        .map(|s| row.get(s).unwrap_or_default())
                        .filter(|v| !v.is_empty())
                        .collect::<Vec<_>>()
                        .join(separator);
                    if merged != value {
                        value = merged;
                        correction_type = Some("merge_columns");
                    }
                }

                ColumnTransform::ExplodeListColumn {
                    delimiter,
                    output_separator,
                    dedupe_values,
                } => {
                    let mut items: Vec<String> = match delimiter {
                        Some(d) => value.split(d.as_str()).map(|i| i.trim().to_string()).collect(),
                        None => value.split([',', ';']).map(|i| i.trim().to_string()).collect(),
                    };
                    items.retain(|i| !i.is_empty());
                    if *dedupe_values {
                        let mut seen = Vec::new();
                        items.retain(|i| {
                            if seen.contains(i) {
                                false
                            }
                            else {
                                seen.push(i.clone());
                                true
                            }
                        });
                    }
                    let joined = items.join(output_separator);
                    if joined != value {
                        value = joined;
                        correction_type = Some("list_normalization");
                    }
                }
            }
        }

        let correction = correction_type.map(|kind| Correction {
            before: original.to_string(),
            after: Value::String(value.clone()),
            correction_type: kind.to_string(),
            target_type: None,
            source_format: None,
        });

        Ok((value, correction))
    }
}

/// Coerce a raw string to the declared type. Returns the value and, when the
/// value had to be altered to fit, a correction record. An empty input is
/// NULL with no correction.
pub fn coerce(raw: &str, sql_type: SqlType) -> (CellValue, Option<Correction>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (CellValue::Null, None);
    }

    match sql_type {
        SqlType::Integer => {
            if let Ok(i) = trimmed.parse::<i64>() {
                return (CellValue::Integer(i), None);
            }
            // float strings with a zero fractional part still count
            if let Ok(f) = trimmed.parse::<f64>() {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    let value = CellValue::Integer(f as i64);
                    let correction = type_coercion(trimmed, value.to_json(), "INTEGER");
                    return (value, Some(correction));
                }
            }
            (CellValue::Null, Some(type_coercion(trimmed, Value::Null, "INTEGER")))
        }

        SqlType::Decimal => match BigDecimal::from_str(trimmed) {
            Ok(d) => (CellValue::Decimal(d), None),
            Err(_) => (CellValue::Null, Some(type_coercion(trimmed, Value::Null, "DECIMAL"))),
        },

        SqlType::Timestamp => match parse_timestamp(trimmed) {
            Some((datetime, format)) => {
                let value = CellValue::Timestamp(datetime);
                let iso = datetime.format("%Y-%m-%dT%H:%M:%S").to_string();
                if iso == trimmed {
                    (value, None)
                }
                else {
                    let correction = Correction {
                        before: trimmed.to_string(),
                        after: Value::String(iso),
                        correction_type: "datetime_standardization".to_string(),
                        target_type: None,
                        source_format: Some(format.to_string()),
                    };
                    (value, Some(correction))
                }
            }
            None => (CellValue::Null, Some(type_coercion(trimmed, Value::Null, "TIMESTAMP"))),
        },

        SqlType::Varchar | SqlType::Text => (CellValue::Text(trimmed.to_string()), None),
    }
}

fn type_coercion(before: &str, after: Value, target_type: &str) -> Correction {
    Correction {
        before: before.to_string(),
        after,
        correction_type: "type_coercion".to_string(),
        target_type: Some(target_type.to_string()),
        source_format: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(json: &str) -> MappingConfig {
        MappingConfig::from_json(json).unwrap()
    }

    fn row(number: usize, pairs: &[(&str, &str)]) -> Row {
        Row {
            source_row_number: number,
            values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
        }
    }

    const BASIC: &str = r#"{
        "table_name": "people",
        "db_schema": {"id": "INTEGER NOT NULL", "name": "VARCHAR(255)", "age": "INTEGER"},
        "mappings": {"id": "id", "name": "name", "age": "age"}
    }"#;

    #[test]
    fn schema_order_is_preserved() {
        let config = config(BASIC);
        let names: Vec<&str> = config.db_schema.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "age"]);
        assert!(config.db_schema[0].not_null);
        assert_eq!(config.db_schema[1].sql_type, SqlType::Varchar);
    }

    #[test]
    fn reserved_table_names_are_suffixed_on_parse() {
        let config = config(r#"{
            "table_name": "users",
            "db_schema": {"id": "INTEGER"}
        }"#);
        assert_eq!(config.table_name, "users_user_data");
    }

    #[test]
    fn clean_rows_map_without_corrections() {
        let config = config(BASIC);
        let mapper = Mapper::new(&config);

        let mapped = mapper.map_row(&row(1, &[("id", "1"), ("name", "John Doe"), ("age", "30")])).unwrap();
        assert_eq!(mapped.values[0], CellValue::Integer(1));
        assert_eq!(mapped.values[1], CellValue::Text("John Doe".to_string()));
        assert_eq!(mapped.values[2], CellValue::Integer(30));
        assert!(mapped.corrections_json().is_none());
    }

    #[test]
    fn float_to_integer_records_type_coercion() {
        let (value, correction) = coerce("30.0", SqlType::Integer);
        assert_eq!(value, CellValue::Integer(30));

        let correction = correction.unwrap();
        assert_eq!(correction.before, "30.0");
        assert_eq!(correction.after, Value::from(30));
        assert_eq!(correction.correction_type, "type_coercion");
        assert_eq!(correction.target_type.as_deref(), Some("INTEGER"));
    }

    #[test]
    fn invalid_integer_becomes_null_with_correction() {
        let (value, correction) = coerce("thirty", SqlType::Integer);
        assert!(value.is_null());
        assert_eq!(correction.unwrap().after, Value::Null);
    }

    #[test]
    fn datetime_standardization_records_source_format() {
        let (value, correction) = coerce("10/09/2025 8:11 PM", SqlType::Timestamp);
        let correction = correction.unwrap();

        assert_eq!(correction.correction_type, "datetime_standardization");
        assert_eq!(correction.source_format.as_deref(), Some("%m/%d/%Y %I:%M %p"));
        assert_eq!(correction.after, Value::String("2025-10-09T20:11:00".to_string()));
        match value {
            CellValue::Timestamp(t) => {
                assert_eq!(t.format("%Y-%m-%dT%H:%M:%S").to_string(), "2025-10-09T20:11:00")
            }
            other => panic!("expected timestamp, got {other:?}"),
        }
    }

    #[test]
    fn already_iso_timestamps_need_no_correction() {
        let (_, correction) = coerce("2025-10-09T20:11:00", SqlType::Timestamp);
        assert!(correction.is_none());
    }

    #[test]
    fn empty_values_are_null_without_correction() {
        let (value, correction) = coerce("  ", SqlType::Integer);
        assert!(value.is_null());
        assert!(correction.is_none());
    }

    #[test]
    fn required_column_rejects_null() {
        let config = config(BASIC);
        let mapper = Mapper::new(&config);

        let err = mapper.map_row(&row(4, &[("id", "not-a-number"), ("name", "x")])).unwrap_err();
        assert_eq!(err.source_row_number, 4);
        assert!(err.reason.contains("NOT NULL"));
    }

    #[test]
    fn unmapped_columns_default_to_null() {
        let config = config(r#"{
            "table_name": "t",
            "db_schema": {"a": "INTEGER", "extra": "TEXT"},
            "mappings": {"a": "a"}
        }"#);
        let mapper = Mapper::new(&config);

        let mapped = mapper.map_row(&row(1, &[("a", "5"), ("ignored", "zzz")])).unwrap();
        assert_eq!(mapped.values[1], CellValue::Null);
    }

    #[test]
    fn merge_columns_runs_during_mapping() {
        let config = config(r#"{
            "table_name": "t",
            "db_schema": {"full_name": "TEXT"},
            "mappings": {"full_name": "first"},
            "rules": {
                "column_transformations": {
                    "full_name": [{"type": "merge_columns", "sources": ["first", "last"], "separator": " "}]
                }
            }
        }"#);
        let mapper = Mapper::new(&config);

        let mapped = mapper.map_row(&row(1, &[("first", "Ada"), ("last", "Lovelace")])).unwrap();
        assert_eq!(mapped.values[0], CellValue::Text("Ada Lovelace".to_string()));
        assert_eq!(mapped.corrections["full_name"].correction_type, "merge_columns");
    }

    #[test]
    fn sql_literals_are_escaped() {
        assert_eq!(CellValue::Text("O'Brien".to_string()).to_sql_literal(), "'O''Brien'");
        assert_eq!(CellValue::Null.to_sql_literal(), "NULL");
        assert_eq!(CellValue::Integer(-2).to_sql_literal(), "-2");
    }

    #[test]
    fn undeclared_mapping_target_fails_validation() {
        let result = MappingConfig::from_json(r#"{
            "table_name": "t",
            "db_schema": {"a": "INTEGER"},
            "mappings": {"missing": "a"}
        }"#);
        assert!(result.is_err());
    }
}
