use diesel::prelude::*;
use diesel::sql_types::Jsonb;
use serde_json::{json, Value};
use tracing::info;

use crate::analyzer::oracle::LlmOracle;
use crate::database::{LiveSchema, PgPool};
use crate::errors::{Error, ValidationError};
use crate::validator::{QueryValidator, ValidationOutcome};

const MAX_GENERATION_ATTEMPTS: usize = 3;

const SQL_SYSTEM_PROMPT: &str = "You translate analyst questions into a single PostgreSQL SELECT statement. \
Only the tables and columns listed in the schema exist. Answer with SQL only, no commentary.";

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}

/// The natural-language query pathway: the LLM proposes SQL, the validator
/// gates it, and rejections loop back to the model for self-correction
/// instead of surfacing as raw database errors.
pub struct QueryEngine<'a> {
    pool: PgPool,
    oracle: &'a dyn LlmOracle,
}

impl<'a> QueryEngine<'a> {
    pub fn new(pool: PgPool, oracle: &'a dyn LlmOracle) -> QueryEngine<'a> {
        QueryEngine { pool, oracle }
    }

    /// Ask the model for SQL answering `question`, validating each attempt.
    pub fn generate_sql(&self, question: &str) -> Result<String, Error> {
        let mut conn = self.pool.get()?;
        let schema = LiveSchema::load(&mut conn)?;
        let validator = QueryValidator::new(&schema);

        let mut transcript = vec![json!({
            "role": "user",
            "content": format!("Schema:\n{}\nQuestion: {question}", schema.summary()),
        })];

        let mut last_rejection = String::new();
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let turn = self.oracle.next_turn(SQL_SYSTEM_PROMPT, &transcript, &[])?;
            let text = match turn {
                crate::analyzer::oracle::OracleTurn::Final { text } => text,
                crate::analyzer::oracle::OracleTurn::ToolCall { .. } => continue,
            };
            let sql = extract_sql(&text);

            match validator.validate(&sql) {
                ValidationOutcome::Allowed => {
                    info!(attempt, "generated SQL passed validation");
                    return Ok(sql);
                }
                ValidationOutcome::Rejected { message } => {
                    info!(attempt, message, "generated SQL rejected, feeding back");
                    transcript.push(json!({"role": "assistant", "content": text}));
                    transcript.push(json!({"role": "user", "content": message.clone()}));
                    last_rejection = message;
                }
            }
        }

        Err(ValidationError::Rejected(last_rejection).into())
    }

    /// Validate and run a SELECT, returning rows as JSON objects.
    pub fn run(&self, sql: &str, row_limit: usize) -> Result<QueryResult, Error> {
        let mut conn = self.pool.get()?;
        let schema = LiveSchema::load(&mut conn)?;

        if let ValidationOutcome::Rejected { message } = QueryValidator::new(&schema).validate(sql) {
            return Err(ValidationError::Rejected(message).into());
        }

        execute_select(&mut conn, sql, row_limit)
    }

    /// The export path: validated query, bounded rows, CSV out.
    pub fn export_csv<W: std::io::Write>(
        &self,
        sql: &str,
        row_limit: usize,
        timeout_seconds: u64,
        writer: W,
    ) -> Result<usize, Error> {
        let mut conn = self.pool.get()?;
        let schema = LiveSchema::load(&mut conn)?;

        if let ValidationOutcome::Rejected { message } = QueryValidator::new(&schema).validate(sql) {
            return Err(ValidationError::Rejected(message).into());
        }

        let result = conn.transaction::<_, Error, _>(|conn| {
            diesel::sql_query(format!("SET LOCAL statement_timeout = {}", timeout_seconds * 1000)).execute(conn)?;
            execute_select(conn, sql, row_limit)
        })?;

        let mut out = csv::Writer::from_writer(writer);
        out.write_record(&result.columns)?;
        for row in &result.rows {
            let record: Vec<String> = result
                .columns
                .iter()
                .map(|column| match row.get(column) {
                    Some(Value::Null) | None => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                })
                .collect();
            out.write_record(&record)?;
        }
        out.flush()?;

        Ok(result.rows.len())
    }
}

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    row: Value,
}

/// Wrap the validated SELECT so each result row comes back as one JSON
/// object, which sidesteps needing a static result type for arbitrary
/// user queries.
fn execute_select(conn: &mut PgConnection, sql: &str, row_limit: usize) -> Result<QueryResult, Error> {
    let wrapped = format!(
        "SELECT to_jsonb(sub) AS row FROM ({}) sub LIMIT {row_limit}",
        sql.trim_end_matches(';'),
    );
    let rows: Vec<Value> = diesel::sql_query(wrapped)
        .load::<JsonRow>(conn)?
        .into_iter()
        .map(|r| r.row)
        .collect();

    let columns = rows
        .first()
        .and_then(Value::as_object)
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default();

    Ok(QueryResult { columns, rows })
}

/// Strip markdown fences and commentary from a model reply, keeping the SQL.
fn extract_sql(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("sql").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_is_extracted_from_fences() {
        assert_eq!(extract_sql("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(extract_sql("```\nSELECT 2\n```"), "SELECT 2");
        assert_eq!(extract_sql("  SELECT 3  "), "SELECT 3");
    }
}
