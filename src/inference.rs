use chrono::{NaiveDate, NaiveDateTime};
use heck::ToSnakeCase;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::database::is_protected;
use crate::readers::Row;

lazy_static! {
    static ref INTEGER_REGEX: Regex = Regex::new(r"^[-+]?[0-9]{1,19}$").expect("invalid integer regex");
    static ref DECIMAL_REGEX: Regex =
        Regex::new(r"^[-+]?[0-9]*\.?[0-9]+([eE][-+]?[0-9]+)?$").expect("invalid decimal regex");
    static ref IDENT_REGEX: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("invalid ident regex");
}

/// The declared SQL types the pipeline maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    Decimal,
    Timestamp,
    Varchar,
    Text,
}

impl SqlType {
    pub fn parse(value: &str) -> SqlType {
        let upper = value.trim().to_uppercase();
        match upper.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => SqlType::Integer,
            "DECIMAL" | "NUMERIC" | "REAL" | "DOUBLE PRECISION" | "FLOAT" => SqlType::Decimal,
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" | "DATETIME" => SqlType::Timestamp,
            "TEXT" => SqlType::Text,
            _ => SqlType::Varchar,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Decimal => "DECIMAL",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Varchar => "VARCHAR(255)",
            SqlType::Text => "TEXT",
        }
    }
}

/// The fixed priority of recognized date/time formats. The first pattern that
/// parses wins, and its pattern string is recorded as the `source_format` of
/// a datetime correction.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Try the ordered format list; a date-only match lands on midnight.
pub fn parse_timestamp(value: &str) -> Option<(NaiveDateTime, &'static str)> {
    let value = value.trim();

    // RFC 3339 first: it is the only variant carrying an offset
    if let Ok(datetime) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some((datetime.naive_utc(), "%Y-%m-%dT%H:%M:%S%:z"));
    }

    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Some((datetime, format));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some((date.and_hms_opt(0, 0, 0)?, format));
        }
    }

    None
}

pub fn is_integer(value: &str) -> bool {
    INTEGER_REGEX.is_match(value.trim())
}

pub fn is_decimal(value: &str) -> bool {
    DECIMAL_REGEX.is_match(value.trim())
}

/// One inferred column of a sampled file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredColumn {
    pub name: String,
    pub source_column: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

#[derive(Default)]
struct ColumnState {
    non_empty: usize,
    any_empty: bool,
    all_integer: bool,
    all_decimal: bool,
    any_fraction: bool,
    all_timestamp: bool,
}

impl ColumnState {
    fn new() -> ColumnState {
        ColumnState {
            all_integer: true,
            all_decimal: true,
            all_timestamp: true,
            ..ColumnState::default()
        }
    }

    fn observe(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            self.any_empty = true;
            return;
        }
        self.non_empty += 1;

        let integer = is_integer(value);
        let decimal = is_decimal(value);

        self.all_integer &= integer;
        self.all_decimal &= decimal;
        self.any_fraction |= decimal && !integer;
        self.all_timestamp &= parse_timestamp(value).is_some();
    }

    /// The narrowest type that fits every non-null value seen.
    fn resolve(&self) -> SqlType {
        if self.non_empty == 0 {
            return SqlType::Varchar;
        }
        if self.all_integer {
            return SqlType::Integer;
        }
        if self.all_decimal && self.any_fraction {
            return SqlType::Decimal;
        }
        if self.all_timestamp {
            return SqlType::Timestamp;
        }
        SqlType::Varchar
    }
}

/// Infer a schema from sampled rows. Column names are sanitized for SQL; a
/// column that is empty in every sampled row falls back to VARCHAR.
pub fn infer_schema(headers: &[String], sample: &[&Row]) -> Vec<InferredColumn> {
    let mut states: Vec<ColumnState> = headers.iter().map(|_| ColumnState::new()).collect();

    for row in sample {
        for (header, state) in headers.iter().zip(states.iter_mut()) {
            state.observe(row.get(header).unwrap_or_default());
        }
    }

    let mut columns = Vec::with_capacity(headers.len());
    for (header, state) in headers.iter().zip(states.iter()) {
        let name = sanitize_identifier(header);
        columns.push(InferredColumn {
            name: dedupe_name(name, &columns),
            source_column: header.clone(),
            sql_type: state.resolve(),
            nullable: state.any_empty || state.non_empty == 0,
        });
    }
    columns
}

fn dedupe_name(name: String, existing: &[InferredColumn]) -> String {
    if !existing.iter().any(|c| c.name == name) {
        return name;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{name}_{counter}");
        if !existing.iter().any(|c| c.name == candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Sanitize an arbitrary header into `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn sanitize_identifier(name: &str) -> String {
    let snake = name.trim().to_snake_case();
    let mut out: String = snake
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if out.is_empty() {
        out = "column".to_string();
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

pub fn is_valid_identifier(name: &str) -> bool {
    IDENT_REGEX.is_match(name)
}

/// Sanitize a requested table name, suffixing system-reserved names so a user
/// table can never shadow an operational one.
pub fn sanitize_table_name(name: &str) -> String {
    let sanitized = sanitize_identifier(name);
    if is_protected(&sanitized) {
        format!("{sanitized}_user_data")
    }
    else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn rows(values: &[&[(&str, &str)]]) -> Vec<Row> {
        values
            .iter()
            .enumerate()
            .map(|(i, pairs)| Row {
                source_row_number: i + 1,
                values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
            })
            .collect()
    }

    fn infer(headers: &[&str], data: &[&[(&str, &str)]]) -> Vec<InferredColumn> {
        let headers: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let owned = rows(data);
        let sample: Vec<&Row> = owned.iter().collect();
        infer_schema(&headers, &sample)
    }

    #[test]
    fn narrowest_type_wins() {
        let columns = infer(
            &["id", "price", "seen", "notes"],
            &[
                &[("id", "1"), ("price", "9.99"), ("seen", "2024-01-02 10:00:00"), ("notes", "ok")],
                &[("id", "2"), ("price", "12"), ("seen", "2024-02-03"), ("notes", "1")],
            ],
        );

        assert_eq!(columns[0].sql_type, SqlType::Integer);
        assert_eq!(columns[1].sql_type, SqlType::Decimal);
        assert_eq!(columns[2].sql_type, SqlType::Timestamp);
        assert_eq!(columns[3].sql_type, SqlType::Varchar);
    }

    #[test]
    fn integers_alone_do_not_become_decimal() {
        let columns = infer(&["n"], &[&[("n", "1")], &[("n", "200")]]);
        assert_eq!(columns[0].sql_type, SqlType::Integer);
    }

    #[test]
    fn empty_values_set_nullability() {
        let columns = infer(&["a", "b"], &[&[("a", "1"), ("b", "x")], &[("a", ""), ("b", "y")]]);
        assert!(columns[0].nullable);
        assert!(!columns[1].nullable);
        // blanks don't break the integer inference
        assert_eq!(columns[0].sql_type, SqlType::Integer);
    }

    #[test]
    fn format_priority_prefers_month_first() {
        let (parsed, format) = parse_timestamp("10/09/2025 8:11 PM").unwrap();
        assert_eq!(format, "%m/%d/%Y %I:%M %p");
        assert_eq!(parsed.format("%Y-%m-%dT%H:%M:%S").to_string(), "2025-10-09T20:11:00");

        // an impossible month falls through to day-first
        let (_, format) = parse_timestamp("25/12/2025").unwrap();
        assert_eq!(format, "%d/%m/%Y");
    }

    #[test]
    fn identifiers_are_sanitized() {
        assert_eq!(sanitize_identifier("First Name"), "first_name");
        assert_eq!(sanitize_identifier("2024 totals"), "_2024_totals");
        assert_eq!(sanitize_identifier("price ($)"), "price");
        assert!(is_valid_identifier(&sanitize_identifier("weird!! header")));
    }

    #[test]
    fn reserved_table_names_are_suffixed() {
        assert_eq!(sanitize_table_name("users"), "users_user_data");
        assert_eq!(sanitize_table_name("import history"), "import_history_user_data");
        assert_eq!(sanitize_table_name("clients"), "clients");
    }

    #[test]
    fn duplicate_headers_get_numbered() {
        let columns = infer(&["name", "Name"], &[&[("name", "a"), ("Name", "b")]]);
        assert_eq!(columns[0].name, "name");
        assert_eq!(columns[1].name, "name_2");
    }
}
