use std::env;

use crate::errors::Error;

const DEFAULT_UPLOAD_MAX_FILE_SIZE_MB: u64 = 100;
const DEFAULT_EXPORT_ROW_LIMIT: usize = 100_000;
const DEFAULT_EXPORT_TIMEOUT_SECONDS: u64 = 120;

/// Runtime configuration pulled from the environment.
///
/// `dotenvy::dotenv()` is called by the binary before this is constructed so a
/// local `.env` file works the same as real environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub storage: StorageConfig,
    pub llm: LlmConfig,

    pub upload_max_file_size_mb: u64,
    pub export_row_limit: usize,
    pub export_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub endpoint_url: String,
    pub provider: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        Ok(Config {
            database_url: require("DATABASE_URL")?,
            storage: StorageConfig {
                access_key_id: env::var("STORAGE_ACCESS_KEY_ID").unwrap_or_default(),
                secret_access_key: env::var("STORAGE_SECRET_ACCESS_KEY").unwrap_or_default(),
                bucket_name: env::var("STORAGE_BUCKET_NAME").unwrap_or_default(),
                endpoint_url: env::var("STORAGE_ENDPOINT_URL").unwrap_or_default(),
                provider: env::var("STORAGE_PROVIDER").unwrap_or_else(|_| "s3".to_string()),
            },
            llm: LlmConfig {
                api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                model: env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
            },
            upload_max_file_size_mb: parse_or("UPLOAD_MAX_FILE_SIZE_MB", DEFAULT_UPLOAD_MAX_FILE_SIZE_MB),
            export_row_limit: parse_or("EXPORT_ROW_LIMIT", DEFAULT_EXPORT_ROW_LIMIT),
            export_timeout_seconds: parse_or("EXPORT_TIMEOUT_SECONDS", DEFAULT_EXPORT_TIMEOUT_SECONDS),
        })
    }
}

pub fn get_database_url() -> Result<String, Error> {
    require("DATABASE_URL")
}

fn require(name: &str) -> Result<String, Error> {
    env::var(name).map_err(|_| Error::Config(format!("{name} must be set")))
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
