pub mod csv;
pub mod excel;
pub mod json;
pub mod xml;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, ParseError};

/// The file formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Xlsx,
    Xls,
    Json,
    Xml,
}

impl FileKind {
    /// Determine the kind from a file name extension.
    pub fn from_name(name: &str) -> Result<FileKind, Error> {
        let ext = name.rsplit('.').next().unwrap_or_default().to_lowercase();
        match ext.as_str() {
            "csv" => Ok(FileKind::Csv),
            "xlsx" => Ok(FileKind::Xlsx),
            "xls" => Ok(FileKind::Xls),
            "json" => Ok(FileKind::Json),
            "xml" => Ok(FileKind::Xml),
            other => Err(ParseError::UnsupportedKind(other.to_string()).into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Csv => "csv",
            FileKind::Xlsx => "xlsx",
            FileKind::Xls => "xls",
            FileKind::Json => "json",
            FileKind::Xml => "xml",
        }
    }
}

/// One logical row of the source file.
///
/// The `source_row_number` is assigned at parse time, 1-indexed at the first
/// data row, and survives every later pipeline stage. Transformations that
/// multiply a row (explode) give every child the parent's number.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub source_row_number: usize,
    pub values: HashMap<String, String>,
}

impl Row {
    pub fn new(source_row_number: usize) -> Row {
        Row {
            source_row_number,
            values: HashMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }
}

/// A fully parsed file: ordered headers plus the row buffer. This is what the
/// parse cache stores and what the sampler and executor consume.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl ParsedFile {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Decode a file into rows. CSV input must be valid UTF-8; a decode failure
/// is a parse error, not a silent lossy conversion.
pub fn parse(bytes: &[u8], kind: FileKind) -> Result<ParsedFile, Error> {
    match kind {
        FileKind::Csv => csv::parse(bytes),
        FileKind::Xlsx | FileKind::Xls => excel::parse(bytes),
        FileKind::Json => json::parse(bytes),
        FileKind::Xml => xml::parse(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_extension() {
        assert_eq!(FileKind::from_name("data.CSV").unwrap(), FileKind::Csv);
        assert_eq!(FileKind::from_name("report.xlsx").unwrap(), FileKind::Xlsx);
        assert!(FileKind::from_name("notes.txt").is_err());
    }
}
