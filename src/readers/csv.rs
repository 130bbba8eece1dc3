use std::io::Read;

use crate::errors::{Error, ParseError};
use crate::readers::{ParsedFile, Row};

/// A reader that decodes CSV records into rows, assigning the 1-indexed
/// source row number as it goes. The header row is not a data row and does
/// not consume a number.
pub struct CsvRowReader<R: Read> {
    headers: Vec<String>,
    records: csv::ByteRecordsIntoIter<R>,
    next_row_number: usize,
}

impl<R: Read> CsvRowReader<R> {
    pub fn from_reader(reader: R) -> Result<CsvRowReader<R>, Error> {
        let mut inner = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

        let headers = inner
            .byte_headers()?
            .iter()
            .map(|h| Ok(std::str::from_utf8(h).map_err(ParseError::Encoding)?.trim().to_string()))
            .collect::<Result<Vec<String>, Error>>()?;

        Ok(CsvRowReader {
            headers,
            records: inner.into_byte_records(),
            next_row_number: 1,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn decode(&self, record: &csv::ByteRecord) -> Result<Row, Error> {
        let mut row = Row::new(self.next_row_number);
        for (header, raw) in self.headers.iter().zip(record.iter()) {
            let value = std::str::from_utf8(raw).map_err(ParseError::Encoding)?;
            row.values.insert(header.clone(), value.to_string());
        }
        Ok(row)
    }
}

impl<R: Read> Iterator for CsvRowReader<R> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.records.next()? {
            Err(err) => Some(Err(err.into())),
            Ok(record) => {
                let row = self.decode(&record);
                if row.is_ok() {
                    self.next_row_number += 1;
                }
                Some(row)
            }
        }
    }
}

pub fn parse(bytes: &[u8]) -> Result<ParsedFile, Error> {
    let reader = CsvRowReader::from_reader(bytes)?;
    let headers = reader.headers().to_vec();
    let rows = reader.collect::<Result<Vec<Row>, Error>>()?;
    Ok(ParsedFile { headers, rows })
}

/// Serialize rows back to CSV, used by the export path.
pub fn write<W: std::io::Write>(writer: W, headers: &[String], rows: &[Row]) -> Result<(), Error> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(headers)?;
    for row in rows {
        let record: Vec<&str> = headers.iter().map(|h| row.get(h).unwrap_or_default()).collect();
        out.write_record(record)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_numbered_from_one() {
        let data = b"id,name\n1,John Doe\n2,Jane Smith\n";
        let parsed = parse(data).unwrap();

        assert_eq!(parsed.headers, vec!["id", "name"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].source_row_number, 1);
        assert_eq!(parsed.rows[1].source_row_number, 2);
        assert_eq!(parsed.rows[0].get("name"), Some("John Doe"));
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let mut data = b"id,name\n1,".to_vec();
        data.extend_from_slice(&[0x9f, 0x92, 0x96]);
        data.push(b'\n');

        let result = parse(&data);
        assert!(matches!(result, Err(Error::Parsing(ParseError::Encoding(_)))));
    }

    #[test]
    fn round_trips_through_write() {
        let data = b"a,b\nx,y\n1,2\n";
        let parsed = parse(data).unwrap();

        let mut buf = Vec::new();
        write(&mut buf, &parsed.headers, &parsed.rows).unwrap();
        let reparsed = parse(&buf).unwrap();

        assert_eq!(reparsed.headers, parsed.headers);
        assert_eq!(reparsed.rows, parsed.rows);
    }

    #[test]
    fn short_records_leave_missing_columns_absent() {
        let data = b"a,b,c\n1,2\n";
        let parsed = parse(data).unwrap();
        assert_eq!(parsed.rows[0].get("a"), Some("1"));
        assert_eq!(parsed.rows[0].get("c"), None);
    }
}
