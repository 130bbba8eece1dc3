use std::collections::HashSet;

use datalift::dedup::{DedupEngine, UniquenessKey};
use datalift::executor::{plan_chunks, LaunchMode};
use datalift::fingerprint::file_fingerprint;
use datalift::mapping::{CellValue, Mapper, MappingConfig};
use datalift::readers::{self, FileKind};
use datalift::sampler::{sample_rows, SampleSize};
use datalift::transform::{self, RowTransform};

const CSV: &[u8] = b"id,name,age,joined\n\
1,John Doe,30,2024-01-15T10:30:00\n\
2,Jane Smith,25.0,10/09/2025 8:11 PM\n\
2,jane smith,25,2024-02-02\n\
,Missing Id,40,2024-03-03\n";

fn mapping() -> MappingConfig {
    MappingConfig::from_json(
        r#"{
            "table_name": "people",
            "db_schema": {
                "id": "INTEGER NOT NULL",
                "name": "VARCHAR(255)",
                "age": "INTEGER",
                "joined": "TIMESTAMP"
            },
            "mappings": {"id": "id", "name": "name", "age": "age", "joined": "joined"},
            "duplicate_check": {"enabled": true, "uniqueness_columns": ["name"]}
        }"#,
    )
    .unwrap()
}

#[test]
fn csv_to_mapped_rows_with_corrections_and_dedup() {
    let parsed = readers::parse(CSV, FileKind::Csv).unwrap();
    assert_eq!(parsed.rows.len(), 4);

    let config = mapping();
    let mapper = Mapper::new(&config);

    let mut mapped = Vec::new();
    let mut errors = Vec::new();
    for row in &parsed.rows {
        match mapper.map_row(row) {
            Ok(m) => mapped.push(m),
            Err(e) => errors.push(e),
        }
    }

    // the blank id violates NOT NULL and is rejected, not inserted
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source_row_number, 4);

    // row numbers survive mapping
    let numbers: Vec<usize> = mapped.iter().map(|m| m.source_row_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    // "25.0" was coerced with a recorded correction; "30" was not
    assert!(mapped[0].corrections_json().is_none());
    let corrections = mapped[1].corrections_json().unwrap();
    assert_eq!(corrections["age"]["correction_type"], "type_coercion");
    assert_eq!(corrections["age"]["before"], "25.0");
    assert_eq!(corrections["age"]["after"], 25);
    assert_eq!(corrections["joined"]["correction_type"], "datetime_standardization");
    assert_eq!(corrections["joined"]["source_format"], "%m/%d/%Y %I:%M %p");
    assert_eq!(corrections["joined"]["after"], "2025-10-09T20:11:00");

    // the case-folded duplicate name is skipped by the dedup engine
    let key = UniquenessKey::from_config(&config).unwrap();
    let engine = DedupEngine::new(key, HashSet::new());
    let unique: Vec<_> = mapped.iter().filter(|m| engine.is_unique(m)).collect();
    assert_eq!(unique.len(), 2);
    assert_eq!(unique[0].values[0], CellValue::Integer(1));
}

#[test]
fn exploded_rows_keep_their_source_row_number_through_mapping() {
    let csv = b"id,emails\n7,a@x.com;b@x.com\n8,c@x.com\n";
    let parsed = readers::parse(csv, FileKind::Csv).unwrap();

    let transforms = vec![RowTransform::ExplodeListRows {
        source: "emails".to_string(),
        delimiter: None,
        target: "email".to_string(),
        options: Default::default(),
    }];
    let rows = transform::apply_all(parsed.rows, &transforms).unwrap();
    assert_eq!(rows.len(), 3);

    let config = MappingConfig::from_json(
        r#"{
            "table_name": "contacts",
            "db_schema": {"id": "INTEGER", "email": "TEXT"},
            "mappings": {"id": "id", "email": "email"}
        }"#,
    )
    .unwrap();
    let mapper = Mapper::new(&config);

    let mapped: Vec<_> = rows.iter().map(|r| mapper.map_row(r).unwrap()).collect();
    let numbers: Vec<usize> = mapped.iter().map(|m| m.source_row_number).collect();
    // both children of row 1 share its number
    assert_eq!(numbers, vec![1, 1, 2]);
}

#[test]
fn zero_rows_after_filtering_is_not_an_error() {
    let csv = b"status,name\narchived,a\narchived,b\n";
    let parsed = readers::parse(csv, FileKind::Csv).unwrap();

    let transforms = vec![RowTransform::FilterRows {
        include_regex: Some("^active$".to_string()),
        exclude_regex: None,
        columns: Some(vec!["status".to_string()]),
    }];
    let rows = transform::apply_all(parsed.rows, &transforms).unwrap();
    assert!(rows.is_empty());

    // chunk planning still yields a runnable single-chunk plan
    assert_eq!(plan_chunks(rows.len(), LaunchMode::Sync).unwrap(), (1, 1));
}

#[test]
fn fingerprints_are_stable_and_drive_sampling() {
    let fp_a = file_fingerprint(CSV);
    let fp_b = file_fingerprint(CSV);
    assert_eq!(fp_a, fp_b);
    assert_eq!(fp_a.len(), 64);

    let parsed = readers::parse(CSV, FileKind::Csv).unwrap();
    let sample = sample_rows(&parsed.rows, SampleSize::Auto, &fp_a);
    // small file: the sample is the whole file
    assert_eq!(sample.len(), parsed.rows.len());
}

#[test]
fn round_trip_preserves_the_logical_row_set() {
    let parsed = readers::parse(CSV, FileKind::Csv).unwrap();

    let mut buf = Vec::new();
    datalift::readers::csv::write(&mut buf, &parsed.headers, &parsed.rows).unwrap();
    let reparsed = readers::parse(&buf, FileKind::Csv).unwrap();

    assert_eq!(reparsed.headers, parsed.headers);
    assert_eq!(reparsed.rows, parsed.rows);
}
