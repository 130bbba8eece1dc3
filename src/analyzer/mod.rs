pub mod oracle;
pub mod tools;

use std::collections::HashMap;

use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::cache::ParseCache;
use crate::database::{LiveSchema, PgPool};
use crate::errors::{Error, ImportError};
use crate::executor::{FilePayload, ImportExecutor, ImportObserver, ImportSummary, LaunchMode};
use crate::fingerprint::file_fingerprint;
use crate::inference::{infer_schema, InferredColumn};
use crate::lineage;
use crate::mapping::MappingConfig;
use crate::models::{QueryMessage, QueryThread};
use crate::readers;
use crate::sampler::{sample_rows, SampleSize};
use oracle::{LlmOracle, OracleTurn};

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const HARD_ITERATION_CAP: u32 = 10;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Manual,
    AutoHigh,
    AutoAlways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    AskUser,
    LlmDecide,
    PreferFlexible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    NewTable,
    MergeExact,
    ExtendTable,
    AdaptData,
}

/// What the agent decided about how the file relates to the existing tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub strategy: Strategy,
    pub confidence: f64,
    pub target_table: String,
    #[serde(default)]
    pub column_mapping: HashMap<String, String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub data_quality_issues: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub iterations_used: u32,
}

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub mode: AnalysisMode,
    pub conflict_policy: ConflictPolicy,
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    /// Present when resuming an interactive analysis.
    pub thread_id: Option<Uuid>,
}

impl Default for AnalyzerOptions {
    fn default() -> AnalyzerOptions {
        AnalyzerOptions {
            mode: AnalysisMode::Manual,
            conflict_policy: ConflictPolicy::AskUser,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            thread_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub recommendation: Recommendation,
    /// True when the mode and confidence allow immediate execution.
    pub execute_now: bool,
    pub thread_id: Uuid,
}

const SYSTEM_PROMPT: &str = "You are a data import analyst. A tabular file has been uploaded; decide how it maps \
onto the existing database. Use the tools to inspect the file and the schema, then answer with a single JSON \
object: {\"strategy\": \"NEW_TABLE\"|\"MERGE_EXACT\"|\"EXTEND_TABLE\"|\"ADAPT_DATA\", \"confidence\": 0.0-1.0, \
\"target_table\": \"...\", \"column_mapping\": {target: source}, \"conflicts\": [..], \
\"data_quality_issues\": [..], \"reasoning\": \"...\"}.";

/// The iteration-bounded analysis agent. Each iteration is one oracle turn:
/// either a tool call (executed locally, result appended to the transcript)
/// or the final recommendation.
pub struct Analyzer<'a> {
    pool: PgPool,
    oracle: &'a dyn LlmOracle,
}

impl<'a> Analyzer<'a> {
    pub fn new(pool: PgPool, oracle: &'a dyn LlmOracle) -> Analyzer<'a> {
        Analyzer { pool, oracle }
    }

    #[tracing::instrument(skip_all, fields(file = %payload.name))]
    pub fn analyze(&self, payload: &FilePayload, options: &AnalyzerOptions) -> Result<AnalysisOutcome, Error> {
        let max_iterations = options.max_iterations.clamp(1, HARD_ITERATION_CAP);

        let parsed = readers::parse(&payload.bytes, payload.kind)?;
        let fingerprint = file_fingerprint(&payload.bytes);
        let sample = sample_rows(&parsed.rows, SampleSize::Auto, &fingerprint);
        let inferred = infer_schema(&parsed.headers, &sample);

        let mut conn = self.pool.get()?;
        let schema = LiveSchema::load(&mut conn)?;

        let ctx = tools::ToolContext {
            file_name: &payload.name,
            parsed: &parsed,
            sample: &sample,
            inferred: &inferred,
            schema: &schema,
            conflict_policy: options.conflict_policy,
        };
        let tool_specs = tools::specs();

        let thread_id = options.thread_id.unwrap_or_else(Uuid::new_v4);
        let mut transcript = self.load_transcript(&mut conn, thread_id)?;
        if transcript.is_empty() {
            let opening = json!({
                "role": "user",
                "content": format!(
                    "File '{}' was uploaded ({} rows). Analyze it and recommend an import strategy.",
                    payload.name,
                    parsed.row_count(),
                ),
            });
            self.persist_message(&mut conn, thread_id, &opening)?;
            transcript.push(opening);
        }

        let mut iterations_used = 0;
        let mut recommendation = None;

        while iterations_used < max_iterations {
            iterations_used += 1;

            match self.oracle.next_turn(SYSTEM_PROMPT, &transcript, &tool_specs)? {
                OracleTurn::ToolCall { id, name, input } => {
                    info!(tool = name, iteration = iterations_used, "agent tool call");
                    let result = tools::dispatch(&name, &input, &ctx);

                    let call = json!({
                        "role": "assistant",
                        "content": [{"type": "tool_use", "id": id, "name": name, "input": input}],
                    });
                    let reply = json!({
                        "role": "user",
                        "content": [{"type": "tool_result", "tool_use_id": id, "content": result.to_string()}],
                    });
                    self.persist_message(&mut conn, thread_id, &call)?;
                    self.persist_message(&mut conn, thread_id, &reply)?;
                    transcript.push(call);
                    transcript.push(reply);
                }

                OracleTurn::Final { text } => {
                    let message = json!({"role": "assistant", "content": text});
                    self.persist_message(&mut conn, thread_id, &message)?;
                    transcript.push(message);
                    recommendation = parse_recommendation(&text);
                    break;
                }
            }
        }

        // iteration exhaustion is not a failure: fall back to a fresh-table
        // recommendation derived from the inferred schema
        let mut recommendation = recommendation.unwrap_or_else(|| fallback_recommendation(&payload.name, &inferred));
        recommendation.iterations_used = iterations_used;

        let execute_now = match options.mode {
            AnalysisMode::AutoAlways => true,
            AnalysisMode::AutoHigh => recommendation.confidence >= options.confidence_threshold,
            AnalysisMode::Manual => false,
        };

        Ok(AnalysisOutcome {
            recommendation,
            execute_now,
            thread_id,
        })
    }

    fn load_transcript(&self, conn: &mut PgConnection, thread: Uuid) -> Result<Vec<Value>, Error> {
        use crate::schema::query_messages::dsl::*;
        use crate::schema::query_threads;

        diesel::insert_into(query_threads::table)
            .values(QueryThread {
                thread_id: thread,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .on_conflict_do_nothing()
            .execute(conn)?;

        let messages = query_messages
            .filter(thread_id.eq(thread))
            .order(created_at.asc())
            .select(QueryMessage::as_select())
            .load(conn)?;

        Ok(messages.into_iter().map(|m| m.content).collect())
    }

    fn persist_message(&self, conn: &mut PgConnection, thread: Uuid, message: &Value) -> Result<(), Error> {
        use crate::schema::query_messages;

        let role = message.get("role").and_then(Value::as_str).unwrap_or("assistant");
        diesel::insert_into(query_messages::table)
            .values(QueryMessage {
                id: Uuid::new_v4(),
                thread_id: thread,
                role: role.to_string(),
                content: message.clone(),
                created_at: Utc::now(),
            })
            .execute(conn)?;
        Ok(())
    }
}

/// Pull the recommendation JSON out of the agent's final text. The agent is
/// prompted to answer with a bare object but may wrap it in prose.
fn parse_recommendation(text: &str) -> Option<Recommendation> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn fallback_recommendation(file_name: &str, inferred: &[InferredColumn]) -> Recommendation {
    let table = crate::inference::sanitize_table_name(file_name.rsplit('.').nth(1).unwrap_or("imported_data"));
    Recommendation {
        strategy: Strategy::NewTable,
        confidence: 0.0,
        target_table: table,
        column_mapping: inferred.iter().map(|c| (c.name.clone(), c.source_column.clone())).collect(),
        conflicts: vec![],
        data_quality_issues: vec![],
        reasoning: "iteration budget exhausted; best-effort recommendation from the inferred schema".to_string(),
        iterations_used: 0,
    }
}

/// Turn a recommendation into a mapping config and run the import. The
/// strategy decides how the target table is prepared first.
pub fn execute_recommendation(
    pool: &PgPool,
    cache: &ParseCache,
    payload: &FilePayload,
    recommendation: &Recommendation,
    mode: LaunchMode,
    observer: &dyn ImportObserver,
) -> Result<ImportSummary, Error> {
    let parsed = readers::parse(&payload.bytes, payload.kind)?;
    let fingerprint = file_fingerprint(&payload.bytes);
    let sample = sample_rows(&parsed.rows, SampleSize::Auto, &fingerprint);
    let inferred = infer_schema(&parsed.headers, &sample);

    let config = config_from_recommendation(recommendation, &inferred)?;

    let mut conn = pool.get()?;
    if lineage::table_exists(&mut conn, &config.table_name)? {
        let schema = LiveSchema::load(&mut conn)?;
        let live_columns: Vec<String> = schema
            .columns(&config.table_name)
            .unwrap_or_default()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();

        let missing: Vec<_> = config
            .db_schema
            .iter()
            .filter(|decl| !live_columns.contains(&decl.name))
            .cloned()
            .collect();

        if !missing.is_empty() {
            if recommendation.strategy == Strategy::ExtendTable {
                lineage::extend_table(&mut conn, &config.table_name, &missing)?;
            }
            else {
                return Err(ImportError::SchemaMismatch {
                    table: config.table_name.clone(),
                    column: missing[0].name.clone(),
                }
                .into());
            }
        }
    }
    drop(conn);

    let executor = ImportExecutor::new(pool.clone(), cache);
    let summary = executor.run(payload, &config, mode, observer)?;

    // stamp the strategy onto the history row for later inspection
    {
        use crate::schema::import_history::dsl::*;

        let mut conn = pool.get()?;
        let attempted = serde_json::to_value(recommendation.strategy)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        diesel::update(import_history.filter(import_id.eq(summary.import_id)))
            .set(strategy.eq(attempted))
            .execute(&mut conn)?;
    }

    Ok(summary)
}

fn config_from_recommendation(
    recommendation: &Recommendation,
    inferred: &[InferredColumn],
) -> Result<MappingConfig, Error> {
    let mut schema_object = serde_json::Map::new();
    let mut mappings = serde_json::Map::new();

    for column in inferred {
        schema_object.insert(column.name.clone(), Value::String(column.sql_type.as_sql().to_string()));
        let source = recommendation
            .column_mapping
            .get(&column.name)
            .cloned()
            .unwrap_or_else(|| column.source_column.clone());
        mappings.insert(column.name.clone(), Value::String(source));
    }

    let config = json!({
        "table_name": recommendation.target_table,
        "db_schema": schema_object,
        "mappings": mappings,
    });
    MappingConfig::from_json(&config.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommendation_json_parses_from_prose() {
        let text = r#"Based on the comparison, here is my decision:
            {"strategy": "MERGE_EXACT", "confidence": 0.95, "target_table": "clients",
             "column_mapping": {"first_name": "First Name"}, "reasoning": "exact column match"}"#;

        let recommendation = parse_recommendation(text).unwrap();
        assert_eq!(recommendation.strategy, Strategy::MergeExact);
        assert_eq!(recommendation.target_table, "clients");
        assert_eq!(recommendation.column_mapping["first_name"], "First Name");
    }

    #[test]
    fn malformed_final_text_yields_none() {
        assert!(parse_recommendation("no json here").is_none());
        assert!(parse_recommendation("{not valid json}").is_none());
    }

    #[test]
    fn fallback_names_table_after_the_file() {
        let recommendation = fallback_recommendation("contacts.csv", &[]);
        assert_eq!(recommendation.strategy, Strategy::NewTable);
        assert_eq!(recommendation.target_table, "contacts");
        assert_eq!(recommendation.confidence, 0.0);
    }

    #[test]
    fn strategies_serialize_screaming() {
        assert_eq!(serde_json::to_string(&Strategy::NewTable).unwrap(), "\"NEW_TABLE\"");
        let parsed: Strategy = serde_json::from_str("\"EXTEND_TABLE\"").unwrap();
        assert_eq!(parsed, Strategy::ExtendTable);
    }
}
