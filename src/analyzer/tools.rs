use serde_json::{json, Value};

use crate::analyzer::ConflictPolicy;
use crate::analyzer::oracle::ToolSpec;
use crate::database::LiveSchema;
use crate::inference::InferredColumn;
use crate::readers::{ParsedFile, Row};

const SAMPLE_PREVIEW_ROWS: usize = 5;

/// Everything the tools can see: the sampled file, its inferred schema, and
/// the (already protected-table-filtered) live database schema.
pub struct ToolContext<'a> {
    pub file_name: &'a str,
    pub parsed: &'a ParsedFile,
    pub sample: &'a [&'a Row],
    pub inferred: &'a [InferredColumn],
    pub schema: &'a LiveSchema,
    pub conflict_policy: ConflictPolicy,
}

pub fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "analyze_file_structure",
            description: "Inspect the uploaded file: headers, inferred column types, row count, and sample rows.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "get_database_schema",
            description: "List the existing user tables and their columns.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "compare_with_tables",
            description: "Compare the file's inferred columns against existing tables to find merge candidates.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tables": {"type": "array", "items": {"type": "string"}}
                }
            }),
        },
        ToolSpec {
            name: "resolve_conflict",
            description: "Ask how a mapping conflict should be resolved under the configured policy.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "conflict": {"type": "string"},
                    "options": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["conflict"]
            }),
        },
    ]
}

/// Execute one tool call. Unknown tool names return an error payload rather
/// than failing the loop; the agent can correct itself.
pub fn dispatch(name: &str, input: &Value, ctx: &ToolContext) -> Value {
    match name {
        "analyze_file_structure" => analyze_file_structure(ctx),
        "get_database_schema" => json!({ "schema": ctx.schema.summary() }),
        "compare_with_tables" => compare_with_tables(input, ctx),
        "resolve_conflict" => resolve_conflict(input, ctx),
        other => json!({ "error": format!("unknown tool: {other}") }),
    }
}

fn analyze_file_structure(ctx: &ToolContext) -> Value {
    let columns: Vec<Value> = ctx
        .inferred
        .iter()
        .map(|column| {
            json!({
                "name": column.name,
                "source_column": column.source_column,
                "type": column.sql_type.as_sql(),
                "nullable": column.nullable,
            })
        })
        .collect();

    let preview: Vec<Value> = ctx
        .sample
        .iter()
        .take(SAMPLE_PREVIEW_ROWS)
        .map(|row| {
            let cells: serde_json::Map<String, Value> = ctx
                .parsed
                .headers
                .iter()
                .map(|h| (h.clone(), Value::String(row.get(h).unwrap_or_default().to_string())))
                .collect();
            Value::Object(cells)
        })
        .collect();

    json!({
        "file_name": ctx.file_name,
        "row_count": ctx.parsed.row_count(),
        "headers": ctx.parsed.headers,
        "columns": columns,
        "sample_rows": preview,
    })
}

fn compare_with_tables(input: &Value, ctx: &ToolContext) -> Value {
    let requested: Option<Vec<String>> = input
        .get("tables")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect());

    let tables: Vec<String> = match requested {
        Some(tables) => tables,
        None => ctx.schema.table_names().map(str::to_string).collect(),
    };

    let comparisons: Vec<Value> = tables
        .iter()
        .filter_map(|table| {
            let columns = ctx.schema.columns(table)?;
            let table_columns: Vec<&str> = columns
                .iter()
                .map(|(name, _)| name.as_str())
                .filter(|name| !name.starts_with('_'))
                .collect();

            let file_columns: Vec<&str> = ctx.inferred.iter().map(|c| c.name.as_str()).collect();

            let matching: Vec<&str> = file_columns.iter().copied().filter(|c| table_columns.contains(c)).collect();
            let missing: Vec<&str> = table_columns.iter().copied().filter(|c| !file_columns.contains(c)).collect();
            let extra: Vec<&str> = file_columns.iter().copied().filter(|c| !table_columns.contains(c)).collect();
            let exact_match = missing.is_empty() && extra.is_empty();

            Some(json!({
                "table": table,
                "matching_columns": matching,
                "missing_from_file": missing,
                "not_in_table": extra,
                "exact_match": exact_match,
            }))
        })
        .collect();

    json!({ "comparisons": comparisons })
}

fn resolve_conflict(input: &Value, ctx: &ToolContext) -> Value {
    let conflict = input.get("conflict").and_then(Value::as_str).unwrap_or_default();

    match ctx.conflict_policy {
        ConflictPolicy::AskUser => json!({
            "action": "ask_user",
            "conflict": conflict,
            "note": "record this conflict in the recommendation; the user decides before execution",
        }),
        ConflictPolicy::LlmDecide => json!({
            "action": "decide",
            "conflict": conflict,
            "note": "choose the resolution you judge best and explain it in the reasoning field",
        }),
        ConflictPolicy::PreferFlexible => json!({
            "action": "prefer_flexible",
            "conflict": conflict,
            "note": "prefer the resolution that loses no data: widen types, extend tables, keep extra columns",
        }),
    }
}
