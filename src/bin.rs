use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

use datalift::analyzer::oracle::AnthropicOracle;
use datalift::analyzer::{self, Analyzer, AnalysisMode, AnalyzerOptions, ConflictPolicy, Recommendation};
use datalift::cache::ParseCache;
use datalift::config::Config;
use datalift::database;
use datalift::errors::Error;
use datalift::executor::{FilePayload, ImportExecutor, ImportObserver, ImportPhase, LaunchMode};
use datalift::lineage;
use datalift::mapping::MappingConfig;
use datalift::query::QueryEngine;
use datalift::store::{HttpObjectStore, MultipartUploader, ObjectStore};
use datalift::tasks::{TaskManager, TaskPayload};
use datalift::utils::ImportBars;

/// The datalift import pipeline
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Import a local file into a table using a mapping config
    Import {
        /// The file to import (csv, xlsx, xls, json, xml)
        path: PathBuf,
        /// Path to the mapping config JSON
        #[arg(long)]
        config: PathBuf,
    },

    /// Fetch a file from the object store and import it synchronously
    ImportRemote {
        /// The object key in the configured bucket
        key: String,
        #[arg(long)]
        config: PathBuf,
    },

    /// Queue an object-store import as a background task
    ImportAsync {
        key: String,
        #[arg(long)]
        config: PathBuf,
    },

    /// Analyze a file with the LLM agent and print the recommendation
    Analyze {
        path: PathBuf,
        /// manual, auto_high or auto_always
        #[arg(long, default_value = "manual")]
        mode: String,
        /// ask_user, llm_decide or prefer_flexible
        #[arg(long, default_value = "ask_user")]
        on_conflict: String,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Resume an interactive analysis thread
        #[arg(long)]
        thread: Option<Uuid>,
    },

    /// Execute a previously produced recommendation against a file
    ExecuteRecommendation {
        path: PathBuf,
        /// Path to the recommendation JSON
        #[arg(long)]
        recommendation: PathBuf,
    },

    /// Upload a file to the object store through a multipart session
    Upload { path: PathBuf },

    /// Abort an in-flight multipart upload session
    AbortUpload { upload_id: Uuid },

    /// Translate a question to SQL, validate it, run it, and print the rows
    Query {
        question: String,
        /// Treat the argument as SQL instead of a natural-language question
        #[arg(long)]
        sql: bool,
    },

    /// Run a validated query and export the result as CSV
    Export {
        sql: String,
        #[arg(long)]
        output: PathBuf,
    },

    /// Undo an import, removing exactly the rows it produced
    Undo { import_id: Uuid },

    /// Inspect tables: list them all, or show one table's schema and stats
    Tables { name: Option<String> },

    /// List import attempts for a table
    Imports { table: String },

    /// Background task operations
    #[command(subcommand)]
    Tasks(TaskCommand),
}

#[derive(clap::Subcommand)]
pub enum TaskCommand {
    /// Run the background import worker
    Run,
    /// Show a task's status and progress
    Status { task_id: Uuid },
    /// Cancel a queued or running task
    Cancel { task_id: Uuid },
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_level(false)
        .init();

    if let Err(err) = run() {
        let envelope = serde_json::to_string_pretty(&err.envelope())
            .unwrap_or_else(|_| err.to_string());
        eprintln!("{envelope}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let pool = database::get_pool()?;
    let mut init_conn = pool.get()?;
    database::ensure_system_tables(&mut init_conn)?;
    let cache = ParseCache::default();

    match cli.command {
        Commands::Import { path, config } => {
            let mapping = read_mapping(&config)?;
            let payload = read_payload(&path)?;
            let summary = run_import(&pool, &cache, &payload, &mapping)?;
            print_json(&json!({ "success": true, "summary": summary }));
        }

        Commands::ImportRemote { key, config } => {
            let settings = Config::from_env()?;
            let store = HttpObjectStore::new(&settings.storage);
            let mapping = read_mapping(&config)?;
            let payload = FilePayload::from_named_bytes(&key, store.get(&key)?)?;
            let summary = run_import(&pool, &cache, &payload, &mapping)?;
            print_json(&json!({ "success": true, "summary": summary }));
        }

        Commands::ImportAsync { key, config } => {
            let mapping = read_mapping(&config)?;
            let manager = TaskManager::new(pool.clone());
            let task_id = manager.submit(&TaskPayload {
                key: key.clone(),
                file_name: key,
                config: mapping,
            })?;
            print_json(&json!({ "success": true, "task_id": task_id }));
        }

        Commands::Analyze {
            path,
            mode,
            on_conflict,
            max_iterations,
            thread,
        } => {
            let settings = Config::from_env()?;
            let oracle = AnthropicOracle::new(&settings.llm);
            let analyzer = Analyzer::new(pool.clone(), &oracle);

            let options = AnalyzerOptions {
                mode: parse_mode(&mode)?,
                conflict_policy: parse_conflict(&on_conflict)?,
                max_iterations: max_iterations.unwrap_or(analyzer::DEFAULT_MAX_ITERATIONS),
                thread_id: thread,
                ..AnalyzerOptions::default()
            };

            let payload = read_payload(&path)?;
            let outcome = analyzer.analyze(&payload, &options)?;

            if outcome.execute_now {
                let summary = analyzer::execute_recommendation(
                    &pool,
                    &cache,
                    &payload,
                    &outcome.recommendation,
                    LaunchMode::Sync,
                    &CliObserver::new("Importing"),
                )?;
                print_json(&json!({ "success": true, "outcome": outcome, "summary": summary }));
            }
            else {
                print_json(&json!({ "success": true, "outcome": outcome }));
            }
        }

        Commands::ExecuteRecommendation { path, recommendation } => {
            let text = std::fs::read_to_string(&recommendation)?;
            let recommendation: Recommendation = serde_json::from_str(&text)?;
            let payload = read_payload(&path)?;

            let observer = CliObserver::new("Importing");
            let summary = analyzer::execute_recommendation(
                &pool,
                &cache,
                &payload,
                &recommendation,
                LaunchMode::Sync,
                &observer,
            )?;
            observer.bars.finish();
            print_json(&json!({ "success": true, "summary": summary }));
        }

        Commands::Upload { path } => {
            let settings = Config::from_env()?;
            let bytes = std::fs::read(&path)?;

            let limit = settings.upload_max_file_size_mb as usize * 1024 * 1024;
            if bytes.len() > limit {
                return Err(datalift::errors::ImportError::PayloadTooLarge {
                    limit_mb: settings.upload_max_file_size_mb,
                }
                .into());
            }

            let store = HttpObjectStore::new(&settings.storage);
            let uploader = MultipartUploader::new(&store);
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload.bin").to_string();

            let mut conn = pool.get()?;
            let session = uploader.start_session(&mut conn, &name, bytes.len())?;
            for (part_number, etag) in uploader.upload_parts(&name, &bytes)? {
                uploader.record_part(&mut conn, session.upload_id, part_number, &etag)?;
            }
            let session = uploader.complete_session(&mut conn, session.upload_id)?;

            print_json(&json!({ "success": true, "upload_id": session.upload_id, "key": name }));
        }

        Commands::AbortUpload { upload_id } => {
            let settings = Config::from_env()?;
            let store = HttpObjectStore::new(&settings.storage);
            let uploader = MultipartUploader::new(&store);
            let mut conn = pool.get()?;
            uploader.abort_session(&mut conn, upload_id)?;
            print_json(&json!({ "success": true }));
        }

        Commands::Query { question, sql } => {
            let settings = Config::from_env()?;
            let oracle = AnthropicOracle::new(&settings.llm);
            let engine = QueryEngine::new(pool.clone(), &oracle);

            let statement = if sql { question } else { engine.generate_sql(&question)? };
            let result = engine.run(&statement, settings.export_row_limit)?;
            print_json(&json!({ "success": true, "sql": statement, "rows": result.rows }));
        }

        Commands::Export { sql, output } => {
            let settings = Config::from_env()?;
            let oracle = AnthropicOracle::new(&settings.llm);
            let engine = QueryEngine::new(pool.clone(), &oracle);

            let file = std::fs::File::create(&output)?;
            let rows = engine.export_csv(&sql, settings.export_row_limit, settings.export_timeout_seconds, file)?;
            print_json(&json!({ "success": true, "rows": rows, "output": output }));
        }

        Commands::Undo { import_id } => {
            let mut conn = pool.get()?;
            let removed = lineage::undo_import(&mut conn, import_id)?;
            print_json(&json!({ "success": true, "rows_removed": removed }));
        }

        Commands::Tables { name } => {
            let mut conn = pool.get()?;
            match name {
                Some(name) => {
                    let stats = lineage::table_stats(&mut conn, &name)?;
                    let schema = database::LiveSchema::load(&mut conn)?;
                    print_json(&json!({
                        "success": true,
                        "stats": stats,
                        "columns": schema.columns(&name),
                    }));
                }
                None => {
                    let tables = lineage::list_tables(&mut conn)?;
                    print_json(&json!({ "success": true, "tables": tables }));
                }
            }
        }

        Commands::Imports { table } => {
            let mut conn = pool.get()?;
            let imports = lineage::list_imports(&mut conn, &table)?;
            print_json(&json!({ "success": true, "imports": imports }));
        }

        Commands::Tasks(command) => {
            let manager = TaskManager::new(pool.clone());
            match command {
                TaskCommand::Run => {
                    let settings = Config::from_env()?;
                    let store = HttpObjectStore::new(&settings.storage);
                    let shutdown = AtomicBool::new(false);
                    manager.run_worker(&cache, &store, Duration::from_secs(2), &shutdown)?;
                }
                TaskCommand::Status { task_id } => {
                    let job = manager.status(task_id)?;
                    print_json(&json!({ "success": true, "task": job }));
                }
                TaskCommand::Cancel { task_id } => {
                    manager.cancel(task_id)?;
                    print_json(&json!({ "success": true }));
                }
            }
        }
    }

    Ok(())
}

fn run_import(
    pool: &database::PgPool,
    cache: &ParseCache,
    payload: &FilePayload,
    mapping: &MappingConfig,
) -> Result<datalift::executor::ImportSummary, Error> {
    let observer = CliObserver::new(&format!("Importing into {}", mapping.table_name));
    let executor = ImportExecutor::new(pool.clone(), cache);
    let summary = executor.run(payload, mapping, LaunchMode::Sync, &observer);
    observer.bars.finish();
    summary
}

fn read_mapping(path: &PathBuf) -> Result<MappingConfig, Error> {
    let text = std::fs::read_to_string(path)?;
    MappingConfig::from_json(&text)
}

fn read_payload(path: &PathBuf) -> Result<FilePayload, Error> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let bytes = std::fs::read(path)?;
    FilePayload::from_named_bytes(&name, bytes)
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

fn parse_mode(value: &str) -> Result<AnalysisMode, Error> {
    match value {
        "manual" => Ok(AnalysisMode::Manual),
        "auto_high" => Ok(AnalysisMode::AutoHigh),
        "auto_always" => Ok(AnalysisMode::AutoAlways),
        other => Err(Error::Config(format!("unknown analysis mode: {other}"))),
    }
}

fn parse_conflict(value: &str) -> Result<ConflictPolicy, Error> {
    match value {
        "ask_user" => Ok(ConflictPolicy::AskUser),
        "llm_decide" => Ok(ConflictPolicy::LlmDecide),
        "prefer_flexible" => Ok(ConflictPolicy::PreferFlexible),
        other => Err(Error::Config(format!("unknown conflict policy: {other}"))),
    }
}

/// Drives the progress bars from the executor's callbacks.
struct CliObserver {
    bars: ImportBars,
}

impl CliObserver {
    fn new(message: &str) -> CliObserver {
        CliObserver {
            bars: ImportBars::new(message),
        }
    }
}

impl ImportObserver for CliObserver {
    fn phase_complete(&self, phase: ImportPhase) {
        let message = match phase {
            ImportPhase::Map => "mapping complete",
            ImportPhase::Dedup => "duplicate check complete",
            ImportPhase::Insert => "insert complete",
        };
        self.bars.phase.set_message(message.to_string());
    }

    fn rows_inserted(&self, count: usize) {
        self.bars.inserted.inc(count as u64);
    }

    fn rows_skipped(&self, count: usize) {
        self.bars.skipped.inc(count as u64);
    }
}
