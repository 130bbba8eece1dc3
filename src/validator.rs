use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::database::{LiveSchema, PROTECTED_TABLES};

lazy_static! {
    static ref SELECT_DISTINCT: Regex = Regex::new(r"(?i)\bselect\s+distinct\b").expect("invalid distinct regex");
    static ref ORDER_BY: Regex = Regex::new(r"(?i)\border\s+by\b").expect("invalid order-by regex");
    static ref FIRST_FROM: Regex = Regex::new(r"(?i)\bfrom\b").expect("invalid from regex");
    static ref MODIFYING: Regex =
        Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|copy)\b")
            .expect("invalid modify regex");
    static ref TABLE_REF: Regex = Regex::new(
        r#"(?i)\b(?:from|join)\s+(?:public\s*\.\s*)?(?:"(?P<quoted>[^"]+)"|(?P<bare>[a-zA-Z_][a-zA-Z0-9_]*))"#
    )
    .expect("invalid table ref regex");
    static ref PROTECTED_REFS: Vec<(&'static str, Regex)> = PROTECTED_TABLES
        .iter()
        .map(|table| {
            let pattern = format!(
                r#"(?i)\b(?:from|join)\s+(?:public\s*\.\s*)?(?:"{table}"|{table}\b)"#
            );
            (*table, Regex::new(&pattern).expect("invalid protected table regex"))
        })
        .collect();
    static ref IDENT: Regex =
        Regex::new(r#""(?P<quoted>[^"]+)"|(?P<bare>[a-zA-Z_][a-zA-Z0-9_]*)"#).expect("invalid ident regex");
    static ref QUALIFIED_REF: Regex = Regex::new(
        r#"(?:"(?P<q1>[^"]+)"|\b(?P<b1>[a-zA-Z_][a-zA-Z0-9_]*))\s*\.\s*(?:"(?P<q2>[^"]+)"|(?P<b2>[a-zA-Z_][a-zA-Z0-9_]*))"#
    )
    .expect("invalid qualified ref regex");
}

const KEYWORDS: &[&str] = &[
    "select", "distinct", "from", "where", "join", "inner", "outer", "left", "right", "full", "cross", "on", "and",
    "or", "not", "in", "is", "null", "like", "ilike", "between", "case", "when", "then", "else", "end", "as", "asc",
    "desc", "nulls", "first", "last", "order", "by", "group", "having", "limit", "offset", "union", "all", "exists",
    "cast", "true", "false", "with", "interval", "public",
];

/// The result of validating one LLM-produced SQL string. A rejection message
/// is sent back to the agent for self-correction, never executed.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Allowed,
    Rejected { message: String },
}

impl ValidationOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ValidationOutcome::Allowed)
    }
}

/// Pre-execution guard for LLM-generated SQL. These are targeted checks over
/// the raw text, not a full parse; the live schema provides the ground truth
/// for table and column existence.
pub struct QueryValidator<'a> {
    schema: &'a LiveSchema,
}

impl<'a> QueryValidator<'a> {
    pub fn new(schema: &'a LiveSchema) -> QueryValidator<'a> {
        QueryValidator { schema }
    }

    pub fn validate(&self, sql: &str) -> ValidationOutcome {
        // a bug in the validator must not block legitimate queries, so any
        // internal panic fails open
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.validate_inner(sql)));
        match result {
            Ok(Some(message)) => ValidationOutcome::Rejected { message },
            Ok(None) => ValidationOutcome::Allowed,
            Err(_) => {
                warn!("query validator failed internally, allowing query");
                ValidationOutcome::Allowed
            }
        }
    }

    fn validate_inner(&self, sql: &str) -> Option<String> {
        let stripped = strip_string_literals(sql);

        if let Some(message) = check_statement_kind(&stripped) {
            return Some(message);
        }
        if let Some(message) = check_protected_tables(&stripped) {
            return Some(message);
        }
        if let Some(message) = check_distinct_order_by(&stripped) {
            return Some(message);
        }

        let tables = referenced_tables(&stripped);
        if let Some(message) = self.check_table_refs(&tables) {
            return Some(message);
        }
        self.check_column_refs(&stripped, &tables)
    }

    fn check_table_refs(&self, tables: &[TableRef]) -> Option<String> {
        for table in tables {
            if !self.schema.has_table(&table.name) {
                let suggestion = closest(&table.name, self.schema.table_names());
                return Some(match suggestion {
                    Some(best) => format!(
                        "VALIDATION ERROR: Table '{}' does not exist. Fix: did you mean '{best}'?",
                        table.name
                    ),
                    None => format!(
                        "VALIDATION ERROR: Table '{}' does not exist. Fix: query one of the available tables.",
                        table.name
                    ),
                });
            }
        }
        None
    }

    fn check_column_refs(&self, sql: &str, tables: &[TableRef]) -> Option<String> {
        if tables.is_empty() {
            return None;
        }

        let aliases: HashMap<&str, &str> = tables
            .iter()
            .filter_map(|t| t.alias.as_deref().map(|a| (a, t.name.as_str())))
            .collect();

        let known: HashSet<String> = tables
            .iter()
            .flat_map(|t| self.schema.columns(&t.name).unwrap_or_default())
            .map(|(name, _)| name.to_lowercase())
            .collect();

        // qualified references pin the column to a table
        for captures in QUALIFIED_REF.captures_iter(sql) {
            let qualifier = captures
                .name("q1")
                .or_else(|| captures.name("b1"))
                .map(|m| m.as_str())?;
            let column = captures
                .name("q2")
                .or_else(|| captures.name("b2"))
                .map(|m| m.as_str())?;

            let table = aliases.get(qualifier).copied().unwrap_or(qualifier);
            let Some(columns) = self.schema.columns(table) else {
                continue;
            };
            if !columns.iter().any(|(name, _)| name.eq_ignore_ascii_case(column)) {
                let suggestion = closest(column, columns.iter().map(|(name, _)| name.as_str()));
                return Some(column_message(column, table, suggestion));
            }
        }

        // quoted bare identifiers are column references by construction
        for captures in IDENT.captures_iter(sql) {
            let Some(quoted) = captures.name("quoted") else {
                continue;
            };
            let column = quoted.as_str();
            if tables.iter().any(|t| t.name.eq_ignore_ascii_case(column)) || aliases.contains_key(column) {
                continue;
            }
            if !known.contains(&column.to_lowercase()) {
                let suggestion = closest(column, known.iter().map(String::as_str));
                let table = &tables[0].name;
                return Some(column_message(column, table, suggestion));
            }
        }

        None
    }
}

fn column_message(column: &str, table: &str, suggestion: Option<String>) -> String {
    match suggestion {
        Some(best) => format!(
            "VALIDATION ERROR: Column '{column}' does not exist in table '{table}'. Fix: did you mean '{best}'?"
        ),
        None => format!(
            "VALIDATION ERROR: Column '{column}' does not exist in table '{table}'. Fix: remove it from the query."
        ),
    }
}

/// Replace single-quoted literal contents so literals can't trip the
/// keyword or identifier scans. Doubled quotes inside a literal are escapes.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            if in_literal && chars.peek() == Some(&'\'') {
                chars.next();
                continue;
            }
            in_literal = !in_literal;
            out.push('\'');
            continue;
        }
        if !in_literal {
            out.push(c);
        }
    }
    out
}

fn check_statement_kind(sql: &str) -> Option<String> {
    let first = sql.trim_start().split_whitespace().next().unwrap_or_default().to_lowercase();
    if first != "select" && first != "with" {
        return Some(
            "VALIDATION ERROR: Only SELECT statements are allowed here. Fix: rewrite the query as a SELECT."
                .to_string(),
        );
    }
    if MODIFYING.is_match(sql) {
        let keyword = MODIFYING
            .find(sql)
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();
        return Some(format!(
            "VALIDATION ERROR: {keyword} is not allowed here. Fix: rewrite the query as a read-only SELECT."
        ));
    }
    None
}

fn check_protected_tables(sql: &str) -> Option<String> {
    for (table, pattern) in PROTECTED_REFS.iter() {
        if pattern.is_match(sql) {
            return Some(format!(
                "VALIDATION ERROR: Table '{table}' is a protected system table. Fix: query user data tables only."
            ));
        }
    }
    None
}

/// DISTINCT requires every column the ORDER BY touches (including inside a
/// CASE expression) to appear in the select list, or Postgres rejects the
/// query with a much less helpful message.
fn check_distinct_order_by(sql: &str) -> Option<String> {
    if !SELECT_DISTINCT.is_match(sql) {
        return None;
    }
    let order_by = ORDER_BY.find(sql)?;

    let select_start = SELECT_DISTINCT.find(sql)?.end();
    let select_end = FIRST_FROM.find(sql).map(|m| m.start()).unwrap_or(sql.len());
    if select_end <= select_start {
        return None;
    }
    let select_list = &sql[select_start..select_end];

    let select_columns: HashSet<String> = identifiers(select_list).into_iter().collect();
    let order_clause = &sql[order_by.end()..];

    for column in identifiers(order_clause) {
        if !select_columns.contains(&column) {
            return Some(format!(
                "VALIDATION ERROR: Column '{column}' is referenced in ORDER BY but is not in the SELECT list. \
                 Fix: add '{column}' to SELECT or remove DISTINCT."
            ));
        }
    }
    None
}

/// Identifier tokens in a clause, keywords and function calls excluded.
fn identifiers(clause: &str) -> Vec<String> {
    let mut out = Vec::new();
    for captures in IDENT.captures_iter(clause) {
        let (token, quoted) = match (captures.name("quoted"), captures.name("bare")) {
            (Some(m), _) => (m, true),
            (_, Some(m)) => (m, false),
            _ => continue,
        };

        let text = token.as_str();
        if !quoted && KEYWORDS.contains(&text.to_lowercase().as_str()) {
            continue;
        }
        // a token immediately followed by '(' is a function name
        let rest = clause[token.end()..].trim_start();
        if rest.starts_with('(') {
            continue;
        }

        out.push(text.to_lowercase());
    }
    out
}

#[derive(Debug, Clone)]
struct TableRef {
    name: String,
    alias: Option<String>,
}

fn referenced_tables(sql: &str) -> Vec<TableRef> {
    let mut tables = Vec::new();
    for captures in TABLE_REF.captures_iter(sql) {
        let Some(name) = captures
            .name("quoted")
            .or_else(|| captures.name("bare"))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };

        // a bare word right after the table name is its alias
        let end = captures.get(0).map(|m| m.end()).unwrap_or_default();
        let rest = sql[end..].trim_start();
        let alias = rest
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .next()
            .filter(|word| !word.is_empty() && !KEYWORDS.contains(&word.to_lowercase().as_str()))
            .map(|word| word.to_string());

        tables.push(TableRef { name, alias });
    }
    tables
}

fn closest<'i, I: IntoIterator<Item = &'i str>>(target: &str, candidates: I) -> Option<String> {
    let target = target.to_lowercase();
    candidates
        .into_iter()
        .map(|candidate| (levenshtein(&target, &candidate.to_lowercase()), candidate))
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn schema() -> LiveSchema {
        let mut tables = BTreeMap::new();
        tables.insert(
            "clients".to_string(),
            vec![
                ("first_name".to_string(), "text".to_string()),
                ("last_name".to_string(), "text".to_string()),
                ("seniority".to_string(), "text".to_string()),
            ],
        );
        tables.insert(
            "orders".to_string(),
            vec![
                ("id".to_string(), "integer".to_string()),
                ("total".to_string(), "numeric".to_string()),
            ],
        );
        LiveSchema::from_tables(tables)
    }

    fn rejected(sql: &str) -> String {
        let schema = schema();
        match QueryValidator::new(&schema).validate(sql) {
            ValidationOutcome::Rejected { message } => message,
            ValidationOutcome::Allowed => panic!("expected rejection for: {sql}"),
        }
    }

    fn allowed(sql: &str) {
        let schema = schema();
        let outcome = QueryValidator::new(&schema).validate(sql);
        assert!(outcome.is_allowed(), "expected allow for: {sql}, got {outcome:?}");
    }

    #[test]
    fn plain_selects_pass() {
        allowed(r#"SELECT "first_name" FROM "clients""#);
        allowed("SELECT first_name, last_name FROM clients ORDER BY last_name");
        allowed("SELECT c.first_name FROM clients c JOIN orders o ON o.id = 1");
    }

    #[test]
    fn non_select_statements_are_rejected() {
        let message = rejected("DELETE FROM clients");
        assert!(message.starts_with("VALIDATION ERROR"));

        let message = rejected("SELECT first_name FROM clients; DROP TABLE clients");
        assert!(message.contains("DROP"));
    }

    #[test]
    fn modify_keywords_inside_literals_are_fine() {
        allowed("SELECT first_name FROM clients WHERE last_name = 'delete me'");
    }

    #[test]
    fn protected_tables_are_blocked_in_every_spelling() {
        for sql in [
            "SELECT * FROM import_history",
            "SELECT * FROM public.import_history",
            r#"SELECT * FROM "import_history""#,
            r#"SELECT * FROM public."import_history""#,
            "SELECT c.x FROM clients c JOIN IMPORT_HISTORY h ON true",
        ] {
            let message = rejected(sql);
            assert!(message.contains("protected"), "{sql} -> {message}");
        }
    }

    #[test]
    fn identifier_boundaries_do_not_overmatch() {
        // a user table whose name merely contains a protected name is fine
        let mut tables = BTreeMap::new();
        tables.insert("users_user_data".to_string(), vec![("id".to_string(), "integer".to_string())]);
        let schema = LiveSchema::from_tables(tables);
        let outcome = QueryValidator::new(&schema).validate("SELECT id FROM users_user_data");
        assert!(outcome.is_allowed());
    }

    #[test]
    fn distinct_order_by_coherence() {
        let message = rejected(
            r#"SELECT DISTINCT "first_name","last_name" FROM "clients"
               ORDER BY CASE WHEN "seniority"='C-Suite' THEN 1 ELSE 2 END"#,
        );
        assert!(message.contains("Column 'seniority'"));
        assert!(message.contains("not in the SELECT"));
        assert!(message.contains("Fix: add 'seniority' to SELECT or remove DISTINCT"));
    }

    #[test]
    fn distinct_with_matching_order_by_passes() {
        allowed(r#"SELECT DISTINCT "first_name" FROM "clients" ORDER BY "first_name" DESC"#);
        // no DISTINCT means no coherence requirement
        allowed(r#"SELECT "first_name" FROM "clients" ORDER BY "seniority""#);
    }

    #[test]
    fn unknown_tables_get_a_suggestion() {
        let message = rejected("SELECT first_name FROM clientz");
        assert!(message.contains("Table 'clientz' does not exist"));
        assert!(message.contains("did you mean 'clients'"));
    }

    #[test]
    fn unknown_columns_get_a_suggestion() {
        let message = rejected(r#"SELECT "first_nam" FROM clients"#);
        assert!(message.contains("Column 'first_nam'"));
        assert!(message.contains("did you mean 'first_name'"));
    }

    #[test]
    fn qualified_references_resolve_aliases() {
        let message = rejected("SELECT c.firstname FROM clients c");
        assert!(message.contains("Column 'firstname'"));
    }

    #[test]
    fn edit_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
