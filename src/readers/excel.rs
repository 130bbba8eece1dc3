use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};

use crate::errors::{Error, ParseError};
use crate::readers::{ParsedFile, Row};

/// Parse a spreadsheet. Sheets are read in workbook order with the first row
/// of each sheet treated as its header; row numbering continues across sheets
/// so a source row number stays unique within the file.
pub fn parse(bytes: &[u8]) -> Result<ParsedFile, Error> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor).map_err(ParseError::Spreadsheet)?;

    let mut headers: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::new();
    let mut next_row_number = 1;

    for sheet in workbook.sheet_names().to_vec() {
        let range = workbook.worksheet_range(&sheet).map_err(ParseError::Spreadsheet)?;
        let mut sheet_rows = range.rows();

        let Some(header_row) = sheet_rows.next() else {
            continue;
        };
        let sheet_headers: Vec<String> = header_row.iter().map(format_cell).collect();

        for header in &sheet_headers {
            if !header.is_empty() && !headers.contains(header) {
                headers.push(header.clone());
            }
        }

        for cells in sheet_rows {
            if cells.iter().all(|c| matches!(c, Data::Empty)) {
                continue;
            }

            let mut row = Row::new(next_row_number);
            next_row_number += 1;

            for (header, cell) in sheet_headers.iter().zip(cells.iter()) {
                if header.is_empty() {
                    continue;
                }
                row.values.insert(header.clone(), format_cell(cell));
            }
            rows.push(row);
        }
    }

    if headers.is_empty() {
        return Err(ParseError::Malformed {
            kind: "spreadsheet".to_string(),
            message: "no sheet contains a header row".to_string(),
        }
        .into());
    }

    Ok(ParsedFile { headers, rows })
}

/// Render a cell the way it reads in the sheet. Whole floats lose the
/// trailing `.0` so an integer column doesn't get polluted by Excel's
/// numeric storage.
fn format_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            }
            else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| naive.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| dt.to_string()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{e:?}"),
    }
}
