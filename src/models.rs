use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{import_history, import_jobs, mapping_errors, query_messages, query_threads, upload_sessions, uploaded_files};

/// One row per import attempt. Every data row produced by the attempt carries
/// this record's `import_id`, which is what makes cascading undo possible.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = import_history)]
pub struct ImportHistory {
    pub import_id: Uuid,
    pub fingerprint: String,
    pub table_name: String,
    pub status: String,
    pub strategy: Option<String>,
    pub mapping: Option<serde_json::Value>,
    pub rows_processed: i32,
    pub rows_inserted: i32,
    pub rows_skipped: i32,
    pub rows_errored: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    pub fn parse(value: &str) -> Option<ImportStatus> {
        match value {
            "pending" => Some(ImportStatus::Pending),
            "processing" => Some(ImportStatus::Processing),
            "completed" => Some(ImportStatus::Completed),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

/// A rejected row. Successful-but-altered values are recorded per row in
/// `_corrections_applied` instead; a field never contributes to both.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = mapping_errors)]
pub struct MappingError {
    pub id: Uuid,
    pub import_id: Uuid,
    pub source_row_number: i32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = import_jobs)]
pub struct ImportJob {
    pub task_id: Uuid,
    pub status: String,
    pub progress: i32,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub import_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = uploaded_files)]
pub struct UploadedFile {
    pub id: Uuid,
    pub file_name: String,
    pub size_bytes: i64,
    pub fingerprint: String,
    pub upload_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A multipart upload in progress. `parts` maps part number to the ETag the
/// store returned for it.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = upload_sessions)]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub file_name: String,
    pub declared_size: i64,
    pub expected_parts: i32,
    pub parts: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = query_threads)]
pub struct QueryThread {
    pub thread_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = query_messages)]
pub struct QueryMessage {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub role: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
