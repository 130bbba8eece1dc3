use serde_json::Value;

use crate::errors::{Error, ParseError};
use crate::readers::{ParsedFile, Row};

/// Parse a JSON document. Two shapes are accepted: a top-level array of
/// objects (each object a row, keys become headers) and a top-level object of
/// arrays (each key a column). Anything else is malformed.
pub fn parse(bytes: &[u8]) -> Result<ParsedFile, Error> {
    let value: Value = serde_json::from_slice(bytes)?;

    match value {
        Value::Array(items) => parse_array_of_objects(items),
        Value::Object(map) => parse_object_of_arrays(map),
        _ => Err(malformed("expected a top-level array of objects or object of arrays")),
    }
}

fn parse_array_of_objects(items: Vec<Value>) -> Result<ParsedFile, Error> {
    let mut headers: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(fields) = item else {
            return Err(malformed("array items must all be objects"));
        };

        let mut row = Row::new(index + 1);
        for (key, value) in fields {
            if !headers.contains(&key) {
                headers.push(key.clone());
            }
            row.values.insert(key, render(&value));
        }
        rows.push(row);
    }

    Ok(ParsedFile { headers, rows })
}

fn parse_object_of_arrays(map: serde_json::Map<String, Value>) -> Result<ParsedFile, Error> {
    let mut headers: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<String>> = Vec::new();

    for (key, value) in map {
        let Value::Array(items) = value else {
            return Err(malformed("object values must all be arrays"));
        };
        headers.push(key);
        columns.push(items.iter().map(render).collect());
    }

    // columns may be ragged; shorter ones pad with empty values so row
    // numbering stays defined for every row
    let row_count = columns.iter().map(Vec::len).max().unwrap_or(0);
    let mut rows = Vec::with_capacity(row_count);

    for index in 0..row_count {
        let mut row = Row::new(index + 1);
        for (header, column) in headers.iter().zip(columns.iter()) {
            let value = column.get(index).cloned().unwrap_or_default();
            row.values.insert(header.clone(), value);
        }
        rows.push(row);
    }

    Ok(ParsedFile { headers, rows })
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // nested structures are kept verbatim as JSON text
        other => other.to_string(),
    }
}

fn malformed(message: &str) -> Error {
    ParseError::Malformed {
        kind: "json".to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_of_objects() {
        let data = br#"[{"id": 1, "name": "John"}, {"id": 2, "name": "Jane", "age": 25}]"#;
        let parsed = parse(data).unwrap();

        assert!(parsed.headers.contains(&"id".to_string()));
        assert!(parsed.headers.contains(&"age".to_string()));
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].source_row_number, 1);
        assert_eq!(parsed.rows[0].get("id"), Some("1"));
        assert_eq!(parsed.rows[0].get("age"), None);
        assert_eq!(parsed.rows[1].get("age"), Some("25"));
    }

    #[test]
    fn object_of_arrays_pads_ragged_columns() {
        let data = br#"{"id": [1, 2, 3], "name": ["a", "b"]}"#;
        let parsed = parse(data).unwrap();

        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.rows[2].get("id"), Some("3"));
        assert_eq!(parsed.rows[2].get("name"), Some(""));
    }

    #[test]
    fn scalar_document_is_malformed() {
        assert!(parse(b"42").is_err());
        assert!(parse(br#"[1, 2]"#).is_err());
    }

    #[test]
    fn null_renders_empty_and_nested_renders_as_json() {
        let data = br#"[{"a": null, "b": {"x": 1}}]"#;
        let parsed = parse(data).unwrap();
        assert_eq!(parsed.rows[0].get("a"), Some(""));
        assert_eq!(parsed.rows[0].get("b"), Some(r#"{"x":1}"#));
    }
}
