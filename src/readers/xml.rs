use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::errors::{Error, ParseError};
use crate::readers::{ParsedFile, Row};

/// Parse an XML document. The repeated child-element tag directly under the
/// root is the row unit; each row element's children become the columns.
///
/// ```text
/// <records>
///   <record><id>1</id><name>John</name></record>
///   <record><id>2</id><name>Jane</name></record>
/// </records>
/// ```
pub fn parse(bytes: &[u8]) -> Result<ParsedFile, Error> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    // candidate rows grouped by their element tag; the most frequent tag wins
    let mut candidates: Vec<(String, Vec<(String, String)>)> = Vec::new();

    let mut depth = 0usize;
    let mut row_tag: Option<String> = None;
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut field_tag: Option<String> = None;
    let mut field_text = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(ParseError::Xml)? {
            Event::Start(event) => {
                depth += 1;
                let tag = String::from_utf8_lossy(event.local_name().as_ref()).to_string();
                match depth {
                    2 => {
                        row_tag = Some(tag);
                        fields = Vec::new();
                    }
                    3 => {
                        field_tag = Some(tag);
                        field_text.clear();
                    }
                    _ => {}
                }
            }
            Event::Text(text) => {
                if depth >= 3 && field_tag.is_some() {
                    field_text.push_str(&text.unescape().map_err(ParseError::Xml)?);
                }
            }
            Event::End(_) => {
                match depth {
                    3 => {
                        if let Some(tag) = field_tag.take() {
                            fields.push((tag, std::mem::take(&mut field_text)));
                        }
                    }
                    2 => {
                        if let Some(tag) = row_tag.take() {
                            candidates.push((tag, std::mem::take(&mut fields)));
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Empty(event) => {
                if depth + 1 == 3 {
                    let tag = String::from_utf8_lossy(event.local_name().as_ref()).to_string();
                    fields.push((tag, String::new()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // pick the tag that repeats the most as the row unit
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (tag, _) in &candidates {
        *counts.entry(tag.as_str()).or_default() += 1;
    }
    let Some(row_unit) = counts.into_iter().max_by_key(|(_, n)| *n).map(|(tag, _)| tag.to_string()) else {
        return Err(ParseError::Malformed {
            kind: "xml".to_string(),
            message: "no repeated child element found under the document root".to_string(),
        }
        .into());
    };

    let mut headers: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::new();

    for (tag, fields) in candidates {
        if tag != row_unit {
            continue;
        }

        let mut row = Row::new(rows.len() + 1);
        for (name, value) in fields {
            if !headers.contains(&name) {
                headers.push(name.clone());
            }
            row.values.insert(name, value);
        }
        rows.push(row);
    }

    Ok(ParsedFile { headers, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_child_becomes_row_unit() {
        let data = br#"<records>
            <record><id>1</id><name>John</name></record>
            <record><id>2</id><name>Jane &amp; co</name></record>
        </records>"#;

        let parsed = parse(data).unwrap();
        assert_eq!(parsed.headers, vec!["id", "name"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].source_row_number, 1);
        assert_eq!(parsed.rows[1].get("name"), Some("Jane & co"));
    }

    #[test]
    fn minority_elements_are_ignored() {
        let data = br#"<doc>
            <meta><version>3</version></meta>
            <item><sku>a</sku></item>
            <item><sku>b</sku></item>
        </doc>"#;

        let parsed = parse(data).unwrap();
        assert_eq!(parsed.headers, vec!["sku"]);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn empty_elements_yield_empty_values() {
        let data = br#"<rows><r><a>1</a><b/></r><r><a>2</a><b>x</b></r></rows>"#;
        let parsed = parse(data).unwrap();
        assert_eq!(parsed.rows[0].get("b"), Some(""));
        assert_eq!(parsed.rows[1].get("b"), Some("x"));
    }

    #[test]
    fn no_rows_is_malformed() {
        assert!(parse(b"<empty/>").is_err());
    }
}
