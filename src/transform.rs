use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::readers::Row;

/// A row-level transformation. These run strictly before deduplication and
/// mapping, in the order they appear in the config. Every operator preserves
/// `source_row_number`; operators that multiply a row give each child the
/// parent's number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowTransform {
    /// Emit one child row per populated source column, moving that column's
    /// value into `target`. Source columns are dropped from the children
    /// unless `keep_sources` is set.
    ExplodeColumns {
        sources: Vec<String>,
        target: String,
        #[serde(default)]
        options: ExplodeOptions,
        #[serde(default)]
        keep_sources: bool,
    },

    /// Split a list-valued field into multiple rows, one per item.
    ExplodeListRows {
        source: String,
        #[serde(default)]
        delimiter: Option<String>,
        target: String,
        #[serde(default)]
        options: ExplodeOptions,
    },

    /// Keep rows where at least one targeted column matches `include_regex`
    /// (when given) and none matches `exclude_regex`. The default targets are
    /// all non-helper columns.
    FilterRows {
        #[serde(default)]
        include_regex: Option<String>,
        #[serde(default)]
        exclude_regex: Option<String>,
        #[serde(default)]
        columns: Option<Vec<String>>,
    },

    /// Regex substitution over the listed columns. Named capture groups can
    /// be projected into new columns through `outputs`.
    RegexReplace {
        pattern: String,
        columns: Vec<String>,
        #[serde(default)]
        replacement: Option<String>,
        #[serde(default)]
        outputs: Option<HashMap<String, String>>,
        #[serde(default)]
        skip_on_no_match: bool,
    },

    /// Apply a nested operator sequence only to rows matching the predicate.
    ConditionalTransform {
        #[serde(default)]
        include_regex: Option<String>,
        #[serde(default)]
        exclude_regex: Option<String>,
        #[serde(default)]
        columns: Option<Vec<String>>,
        actions: Vec<RowTransform>,
    },

    /// Merge multiple columns into one string.
    ConcatColumns {
        sources: Vec<String>,
        target: String,
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default)]
        skip_nulls: bool,
        #[serde(default)]
        null_replacement: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplodeOptions {
    pub include_original: bool,
    pub keep_empty: bool,
    pub dedupe_values: bool,
    pub case_insensitive_dedupe: bool,
    pub strip_whitespace: bool,
}

impl Default for ExplodeOptions {
    fn default() -> ExplodeOptions {
        ExplodeOptions {
            include_original: false,
            keep_empty: false,
            dedupe_values: false,
            case_insensitive_dedupe: false,
            strip_whitespace: true,
        }
    }
}

fn default_separator() -> String {
    ",".to_string()
}

/// Keys prefixed with an underscore are pipeline-internal. They are invisible
/// to uniqueness checks and are stripped before insert.
pub fn is_helper_column(name: &str) -> bool {
    name.starts_with('_')
}

pub fn strip_helper_columns(row: &mut Row) {
    row.values.retain(|key, _| !is_helper_column(key));
}

/// Run the configured operators over the row stream, in order.
pub fn apply_all(rows: Vec<Row>, transforms: &[RowTransform]) -> Result<Vec<Row>, Error> {
    let mut current = rows;
    for transform in transforms {
        current = apply(current, transform)?;
    }
    Ok(current)
}

fn apply(rows: Vec<Row>, transform: &RowTransform) -> Result<Vec<Row>, Error> {
    match transform {
        RowTransform::ExplodeColumns {
            sources,
            target,
            options,
            keep_sources,
        } => explode_columns(rows, sources, target, options, *keep_sources),

        RowTransform::ExplodeListRows {
            source,
            delimiter,
            target,
            options,
        } => explode_list_rows(rows, source, delimiter.as_deref(), target, options),

        RowTransform::FilterRows {
            include_regex,
            exclude_regex,
            columns,
        } => {
            let predicate = Predicate::compile(include_regex.as_deref(), exclude_regex.as_deref(), columns.clone())?;
            Ok(rows.into_iter().filter(|row| predicate.matches(row)).collect())
        }

        RowTransform::RegexReplace {
            pattern,
            columns,
            replacement,
            outputs,
            skip_on_no_match,
        } => regex_replace(rows, pattern, columns, replacement.as_deref(), outputs.as_ref(), *skip_on_no_match),

        RowTransform::ConditionalTransform {
            include_regex,
            exclude_regex,
            columns,
            actions,
        } => {
            let predicate = Predicate::compile(include_regex.as_deref(), exclude_regex.as_deref(), columns.clone())?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                if predicate.matches(&row) {
                    out.extend(apply_all(vec![row], actions)?);
                }
                else {
                    out.push(row);
                }
            }
            Ok(out)
        }

        RowTransform::ConcatColumns {
            sources,
            target,
            separator,
            skip_nulls,
            null_replacement,
        } => Ok(concat_columns(rows, sources, target, separator, *skip_nulls, null_replacement.as_deref())),
    }
}

struct Predicate {
    include: Option<Regex>,
    exclude: Option<Regex>,
    columns: Option<Vec<String>>,
}

impl Predicate {
    fn compile(include: Option<&str>, exclude: Option<&str>, columns: Option<Vec<String>>) -> Result<Predicate, Error> {
        Ok(Predicate {
            include: include.map(compile_regex).transpose()?,
            exclude: exclude.map(compile_regex).transpose()?,
            columns,
        })
    }

    fn matches(&self, row: &Row) -> bool {
        let targeted: Vec<&str> = match &self.columns {
            Some(columns) => columns
                .iter()
                .map(|c| row.get(c).unwrap_or_default())
                .collect(),
            None => row
                .values
                .iter()
                .filter(|(key, _)| !is_helper_column(key))
                .map(|(_, value)| value.as_str())
                .collect(),
        };

        if let Some(include) = &self.include {
            if !targeted.iter().any(|value| include.is_match(value)) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if targeted.iter().any(|value| exclude.is_match(value)) {
                return false;
            }
        }
        true
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|err| Error::Config(format!("invalid regex '{pattern}': {err}")))
}

fn explode_columns(
    rows: Vec<Row>,
    sources: &[String],
    target: &str,
    options: &ExplodeOptions,
    keep_sources: bool,
) -> Result<Vec<Row>, Error> {
    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        let mut values: Vec<String> = Vec::with_capacity(sources.len());
        for source in sources {
            let mut value = row.get(source).unwrap_or_default().to_string();
            if options.strip_whitespace {
                value = value.trim().to_string();
            }
            if value.is_empty() && !options.keep_empty {
                continue;
            }
            values.push(value);
        }
        dedupe(&mut values, options);

        if options.include_original {
            out.push(row.clone());
        }

        for value in values {
            let mut child = row.clone();
            if !keep_sources {
                for source in sources {
                    child.values.remove(source);
                }
            }
            child.values.insert(target.to_string(), value);
            out.push(child);
        }
    }

    Ok(out)
}

fn explode_list_rows(
    rows: Vec<Row>,
    source: &str,
    delimiter: Option<&str>,
    target: &str,
    options: &ExplodeOptions,
) -> Result<Vec<Row>, Error> {
    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        let raw = row.get(source).unwrap_or_default().to_string();

        let mut items: Vec<String> = match delimiter {
            Some(delimiter) => raw.split(delimiter).map(str::to_string).collect(),
            // default list delimiters
            None => raw.split([',', ';']).map(str::to_string).collect(),
        };
        if options.strip_whitespace {
            items = items.into_iter().map(|i| i.trim().to_string()).collect();
        }
        items.retain(|i| options.keep_empty || !i.is_empty());
        dedupe(&mut items, options);

        if options.include_original {
            out.push(row.clone());
        }

        for item in items {
            let mut child = row.clone();
            if target != source {
                child.values.remove(source);
            }
            child.values.insert(target.to_string(), item);
            out.push(child);
        }
    }

    Ok(out)
}

fn dedupe(values: &mut Vec<String>, options: &ExplodeOptions) {
    if !options.dedupe_values {
        return;
    }
    let mut seen: Vec<String> = Vec::new();
    values.retain(|value| {
        let key = if options.case_insensitive_dedupe {
            value.to_lowercase()
        }
        else {
            value.clone()
        };
        if seen.contains(&key) {
            false
        }
        else {
            seen.push(key);
            true
        }
    });
}

fn regex_replace(
    rows: Vec<Row>,
    pattern: &str,
    columns: &[String],
    replacement: Option<&str>,
    outputs: Option<&HashMap<String, String>>,
    skip_on_no_match: bool,
) -> Result<Vec<Row>, Error> {
    let regex = compile_regex(pattern)?;
    let mut out = Vec::with_capacity(rows.len());

    for mut row in rows {
        for column in columns {
            let Some(value) = row.get(column).map(str::to_string) else {
                continue;
            };

            let captures = regex.captures(&value);
            if captures.is_none() && skip_on_no_match {
                continue;
            }

            if let (Some(captures), Some(outputs)) = (captures.as_ref(), outputs) {
                for (group, output_column) in outputs {
                    let captured = captures.name(group).map(|m| m.as_str()).unwrap_or_default();
                    row.values.insert(output_column.clone(), captured.to_string());
                }
            }

            if let Some(replacement) = replacement {
                let replaced = regex.replace_all(&value, replacement).to_string();
                row.values.insert(column.clone(), replaced);
            }
        }
        out.push(row);
    }

    Ok(out)
}

fn concat_columns(
    rows: Vec<Row>,
    sources: &[String],
    target: &str,
    separator: &str,
    skip_nulls: bool,
    null_replacement: Option<&str>,
) -> Vec<Row> {
    rows.into_iter()
        .map(|mut row| {
            let mut parts: Vec<String> = Vec::with_capacity(sources.len());
            for source in sources {
                let value = row.get(source).unwrap_or_default();
                if value.is_empty() {
                    if skip_nulls {
                        continue;
                    }
                    parts.push(null_replacement.unwrap_or_default().to_string());
                }
                else {
                    parts.push(value.to_string());
                }
            }
            row.values.insert(target.to_string(), parts.join(separator));
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn row(number: usize, pairs: &[(&str, &str)]) -> Row {
        Row {
            source_row_number: number,
            values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn explode_columns_children_share_row_number() {
        let rows = vec![row(7, &[("phone_1", "123"), ("phone_2", " 456 "), ("phone_3", ""), ("name", "Jo")])];
        let transform = RowTransform::ExplodeColumns {
            sources: vec!["phone_1".into(), "phone_2".into(), "phone_3".into()],
            target: "phone".into(),
            options: ExplodeOptions::default(),
            keep_sources: false,
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.source_row_number == 7));
        assert_eq!(out[0].get("phone"), Some("123"));
        assert_eq!(out[1].get("phone"), Some("456"));
        // sources are dropped, other columns survive
        assert_eq!(out[0].get("phone_1"), None);
        assert_eq!(out[0].get("name"), Some("Jo"));
    }

    #[test]
    fn explode_dedupes_case_insensitively() {
        let rows = vec![row(1, &[("a", "X"), ("b", "x"), ("c", "y")])];
        let transform = RowTransform::ExplodeColumns {
            sources: vec!["a".into(), "b".into(), "c".into()],
            target: "v".into(),
            options: ExplodeOptions {
                dedupe_values: true,
                case_insensitive_dedupe: true,
                ..ExplodeOptions::default()
            },
            keep_sources: false,
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn explode_list_rows_splits_on_default_delimiters() {
        let rows = vec![row(3, &[("tags", "red, blue;green"), ("id", "1")])];
        let transform = RowTransform::ExplodeListRows {
            source: "tags".into(),
            delimiter: None,
            target: "tag".into(),
            options: ExplodeOptions::default(),
        };

        let out = apply_all(rows, &[transform]).unwrap();
        let tags: Vec<&str> = out.iter().map(|r| r.get("tag").unwrap()).collect();
        assert_eq!(tags, vec!["red", "blue", "green"]);
        assert!(out.iter().all(|r| r.source_row_number == 3 && r.get("id") == Some("1")));
    }

    #[test]
    fn filter_rows_include_and_exclude() {
        let rows = vec![
            row(1, &[("status", "active"), ("name", "a")]),
            row(2, &[("status", "archived"), ("name", "b")]),
            row(3, &[("status", "active-test"), ("name", "c")]),
        ];
        let transform = RowTransform::FilterRows {
            include_regex: Some("^active".into()),
            exclude_regex: Some("test".into()),
            columns: Some(vec!["status".into()]),
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source_row_number, 1);
    }

    #[test]
    fn filter_defaults_ignore_helper_columns() {
        let rows = vec![row(1, &[("_internal", "match"), ("real", "nope")])];
        let transform = RowTransform::FilterRows {
            include_regex: Some("match".into()),
            exclude_regex: None,
            columns: None,
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn regex_replace_projects_named_groups() {
        let rows = vec![row(1, &[("address", "12 High St, Leeds")])];
        let transform = RowTransform::RegexReplace {
            pattern: r"^(?P<street>[^,]+),\s*(?P<city>.+)$".into(),
            columns: vec!["address".into()],
            replacement: None,
            outputs: Some(HashMap::from([
                ("street".to_string(), "street".to_string()),
                ("city".to_string(), "city".to_string()),
            ])),
            skip_on_no_match: false,
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert_eq!(out[0].get("street"), Some("12 High St"));
        assert_eq!(out[0].get("city"), Some("Leeds"));
        assert_eq!(out[0].get("address"), Some("12 High St, Leeds"));
    }

    #[test]
    fn regex_replace_skip_on_no_match_leaves_value() {
        let rows = vec![row(1, &[("v", "plain")])];
        let transform = RowTransform::RegexReplace {
            pattern: r"\d+".into(),
            columns: vec!["v".into()],
            replacement: Some("#".into()),
            outputs: None,
            skip_on_no_match: true,
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert_eq!(out[0].get("v"), Some("plain"));
    }

    #[test]
    fn conditional_applies_actions_to_matching_rows_only() {
        let rows = vec![
            row(1, &[("kind", "multi"), ("tags", "a,b")]),
            row(2, &[("kind", "single"), ("tags", "c,d")]),
        ];
        let transform = RowTransform::ConditionalTransform {
            include_regex: Some("^multi$".into()),
            exclude_regex: None,
            columns: Some(vec!["kind".into()]),
            actions: vec![RowTransform::ExplodeListRows {
                source: "tags".into(),
                delimiter: None,
                target: "tag".into(),
                options: ExplodeOptions::default(),
            }],
        };

        let out = apply_all(rows, &[transform]).unwrap();
        // row 1 exploded into two, row 2 untouched
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].get("tags"), Some("c,d"));
        assert_eq!(out[2].get("tag"), None);
    }

    #[test]
    fn concat_with_null_replacement() {
        let rows = vec![row(1, &[("first", "Ada"), ("middle", ""), ("last", "Lovelace")])];
        let transform = RowTransform::ConcatColumns {
            sources: vec!["first".into(), "middle".into(), "last".into()],
            target: "full_name".into(),
            separator: " ".into(),
            skip_nulls: false,
            null_replacement: Some("-".into()),
        };

        let out = apply_all(rows, &[transform]).unwrap();
        assert_eq!(out[0].get("full_name"), Some("Ada - Lovelace"));
    }

    #[test]
    fn helper_columns_are_stripped() {
        let mut r = row(1, &[("_seen", "x"), ("name", "a")]);
        strip_helper_columns(&mut r);
        assert_eq!(r.get("_seen"), None);
        assert_eq!(r.get("name"), Some("a"));
    }
}
