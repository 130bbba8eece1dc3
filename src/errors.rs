use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred with the database connection")]
    Database(#[from] diesel::result::Error),

    #[error("an error occurred getting a database connection")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("an error occurred parsing the file")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Parsing(#[from] ParseError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("an error occurred talking to a remote service")]
    Http(#[from] Box<ureq::Error>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Error {
        Error::Http(Box::new(err))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("the file is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("unsupported file kind: {0}")]
    UnsupportedKind(String),

    #[error("malformed {kind} file: {message}")]
    Malformed { kind: String, message: String },

    #[error(transparent)]
    DateFormat(#[from] chrono::ParseError),

    #[error("an error occurred reading the spreadsheet")]
    Spreadsheet(#[from] calamine::Error),

    #[error("an error occurred reading the xml document")]
    Xml(#[from] quick_xml::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error("a previous import of this file already exists for table {table}")]
    DuplicateFile { table: String, fingerprint: String },

    #[error("a previous import of this file is still processing")]
    DuplicateFileInFlight { fingerprint: String },

    #[error("import is too large for a synchronous request ({rows} rows), submit it as a task")]
    Timeout { rows: usize },

    #[error("target table {table} has no column {column} and the strategy does not extend it")]
    SchemaMismatch { table: String, column: String },

    #[error("the import was cancelled")]
    Cancelled,

    #[error("import {0} not found")]
    NotFound(Uuid),

    #[error("file exceeds the configured upload limit of {limit_mb} MB")]
    PayloadTooLarge { limit_mb: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("{0}")]
    Rejected(String),

    #[error("query touches a protected table: {0}")]
    ProtectedTable(String),
}

/// The JSON failure envelope returned to callers when an operation fails.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub error_details: ErrorDetails,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub error_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_attempted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_decision_context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<String>,
}

impl Error {
    /// The stable tag used in the failure envelope and in `mapping_errors` rows.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Parsing(_) | Error::Csv(_) => "parse_error",
            Error::Import(ImportError::DuplicateFile { .. }) => "duplicate_file",
            Error::Import(ImportError::DuplicateFileInFlight { .. }) => "duplicate_file",
            Error::Import(ImportError::Timeout { .. }) => "timeout",
            Error::Import(ImportError::SchemaMismatch { .. }) => "EXECUTION_FAILED",
            Error::Import(ImportError::PayloadTooLarge { .. }) => "payload_too_large",
            Error::Import(ImportError::Cancelled) => "cancelled",
            Error::Import(ImportError::NotFound(_)) => "not_found",
            Error::Validation(ValidationError::ProtectedTable(_)) => "protected_table",
            Error::Validation(_) => "validation_error",
            _ => "internal_error",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            success: false,
            error: self.to_string(),
            error_details: ErrorDetails {
                error_type: self.error_type().to_string(),
                timestamp: Utc::now().to_rfc3339(),
                strategy_attempted: None,
                target_table: match self {
                    Error::Import(ImportError::DuplicateFile { table, .. }) => Some(table.clone()),
                    Error::Import(ImportError::SchemaMismatch { table, .. }) => Some(table.clone()),
                    _ => None,
                },
                llm_decision_context: None,
                suggestions: match self {
                    Error::Import(ImportError::Timeout { .. }) => {
                        vec!["resubmit the import as an async task".to_string()]
                    }
                    Error::Import(ImportError::DuplicateFile { .. }) => {
                        vec!["set allow_file_level_retry to import the file again".to_string()]
                    }
                    _ => vec![],
                },
                error_history: vec![],
            },
        }
    }
}
