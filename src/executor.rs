use chrono::Utc;
use diesel::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ParseCache;
use crate::database::{quote_ident, PgPool};
use crate::dedup::{check_file_level, DedupEngine, UniquenessKey};
use crate::errors::{Error, ImportError};
use crate::fingerprint::file_fingerprint;
use crate::lineage;
use crate::mapping::{MappedRow, Mapper, MappingConfig, RowError};
use crate::models::{ImportHistory, ImportStatus, MappingError, UploadedFile};
use crate::readers::{self, FileKind, Row};
use crate::transform;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const SYNC_ROW_LIMIT: usize = 50_000;
const INSERT_BATCH: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Map,
    Dedup,
    Insert,
}

/// Chunking policy. Small files run as a single chunk with no parallelism;
/// anything past the sync row limit must arrive through the task queue.
pub fn plan_chunks(total_rows: usize, mode: LaunchMode) -> Result<(usize, usize), Error> {
    if total_rows <= DEFAULT_CHUNK_SIZE {
        return Ok((total_rows.max(1), 1));
    }
    if total_rows > SYNC_ROW_LIMIT && mode == LaunchMode::Sync {
        return Err(ImportError::Timeout { rows: total_rows }.into());
    }

    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(4);
    Ok((DEFAULT_CHUNK_SIZE, workers))
}

/// Hooks the driver calls as work progresses. The task manager persists
/// progress at phase boundaries; the CLI drives progress bars; tests observe
/// nothing.
pub trait ImportObserver: Sync {
    fn phase_complete(&self, _phase: ImportPhase) {}
    fn rows_inserted(&self, _count: usize) {}
    fn rows_skipped(&self, _count: usize) {}
    fn should_cancel(&self) -> bool {
        false
    }
}

pub struct NullObserver;
impl ImportObserver for NullObserver {}

/// A file handed to the executor, either from a direct upload or fetched
/// from the object store.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub name: String,
    pub kind: FileKind,
    pub bytes: Vec<u8>,
}

impl FilePayload {
    pub fn from_named_bytes(name: &str, bytes: Vec<u8>) -> Result<FilePayload, Error> {
        Ok(FilePayload {
            name: name.to_string(),
            kind: FileKind::from_name(name)?,
            bytes,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummary {
    pub import_id: Uuid,
    pub table_name: String,
    pub rows_processed: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub rows_errored: usize,
    pub status: ImportStatus,
}

/// The three-phase import driver: parallel map, parallel dedup against a
/// shared key set, then strictly sequential chunk inserts so row ordering and
/// transaction behavior stay predictable.
pub struct ImportExecutor<'a> {
    pool: PgPool,
    cache: &'a ParseCache,
}

struct MappedChunk {
    index: usize,
    rows: Vec<MappedRow>,
    errors: Vec<RowError>,
}

struct DedupedChunk {
    index: usize,
    unique: Vec<MappedRow>,
    skipped: usize,
    errors: Vec<RowError>,
}

impl<'a> ImportExecutor<'a> {
    pub fn new(pool: PgPool, cache: &'a ParseCache) -> ImportExecutor<'a> {
        ImportExecutor { pool, cache }
    }

    #[tracing::instrument(skip_all, fields(file = %payload.name, table = %config.table_name))]
    pub fn run(
        &self,
        payload: &FilePayload,
        config: &MappingConfig,
        mode: LaunchMode,
        observer: &dyn ImportObserver,
    ) -> Result<ImportSummary, Error> {
        config.validate()?;

        let fingerprint = file_fingerprint(&payload.bytes);
        let mut conn = self.pool.get()?;

        check_file_level(&mut conn, &fingerprint, &config.table_name, &config.duplicate_check)?;

        let parsed = match self.cache.get(&fingerprint) {
            Some(parsed) => {
                info!(fingerprint, "parse cache hit");
                parsed
            }
            None => {
                let parsed = readers::parse(&payload.bytes, payload.kind)?;
                self.cache.insert(&fingerprint, parsed)
            }
        };

        self.register_upload(&mut conn, payload, &fingerprint)?;

        let rows = transform::apply_all(parsed.rows.clone(), &config.rules.row_transformations)?;
        let total = rows.len();
        let (chunk_size, workers) = plan_chunks(total, mode)?;

        let import_id = self.create_history(&mut conn, &fingerprint, config)?;
        lineage::create_table(&mut conn, config)?;

        let dedup = match UniquenessKey::from_config(config) {
            Some(key) => {
                let existing = key.load_existing(&mut conn, &config.table_name)?;
                Some(DedupEngine::new(key, existing))
            }
            None => None,
        };
        let force_import = config.duplicate_check.force_import;

        info!(total, chunk_size, workers, "starting import phases");
        self.set_status(&mut conn, import_id, ImportStatus::Processing)?;

        let result = self.run_phases(
            import_id,
            config,
            rows,
            chunk_size,
            workers,
            dedup.as_ref(),
            force_import,
            observer,
        );

        match result {
            Ok((inserted, skipped, errored)) => {
                let summary = ImportSummary {
                    import_id,
                    table_name: config.table_name.clone(),
                    rows_processed: total,
                    rows_inserted: inserted,
                    rows_skipped: skipped,
                    rows_errored: errored,
                    status: ImportStatus::Completed,
                };
                self.finish_history(&mut conn, &summary, None)?;
                Ok(summary)
            }
            Err(err) => {
                let summary = ImportSummary {
                    import_id,
                    table_name: config.table_name.clone(),
                    rows_processed: total,
                    rows_inserted: 0,
                    rows_skipped: 0,
                    rows_errored: 0,
                    status: ImportStatus::Failed,
                };
                // committed chunks stay behind; they share the import_id so a
                // cascade undo can remove them later
                if let Err(update_err) = self.finish_history(&mut conn, &summary, Some(err.to_string())) {
                    warn!(error = %update_err, "failed to mark import as failed");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phases(
        &self,
        import_id: Uuid,
        config: &MappingConfig,
        rows: Vec<Row>,
        chunk_size: usize,
        workers: usize,
        dedup: Option<&DedupEngine>,
        force_import: bool,
        observer: &dyn ImportObserver,
    ) -> Result<(usize, usize, usize), Error> {
        let chunks: Vec<Vec<Row>> = rows.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|err| Error::Config(format!("failed to build worker pool: {err}")))?;

        // phase 0: map every chunk in parallel, order restored by index
        let mapper = Mapper::new(config);
        let mut mapped: Vec<MappedChunk> = pool.install(|| {
            chunks
                .par_iter()
                .enumerate()
                .map(|(index, chunk)| {
                    let mut rows = Vec::with_capacity(chunk.len());
                    let mut errors = Vec::new();
                    for row in chunk {
                        let mut row = row.clone();
                        transform::strip_helper_columns(&mut row);
                        match mapper.map_row(&row) {
                            Ok(mapped_row) => rows.push(mapped_row),
                            Err(err) => errors.push(err),
                        }
                    }
                    MappedChunk { index, rows, errors }
                })
                .collect()
        });
        mapped.sort_by_key(|c| c.index);
        observer.phase_complete(ImportPhase::Map);

        if observer.should_cancel() {
            return Err(ImportError::Cancelled.into());
        }

        // phase 1: re-scan in parallel against the shared key sets
        let mut deduped: Vec<DedupedChunk> = pool.install(|| {
            mapped
                .into_par_iter()
                .map(|chunk| {
                    let mut unique = Vec::with_capacity(chunk.rows.len());
                    let mut skipped = 0;
                    for row in chunk.rows {
                        let keep = match dedup {
                            Some(engine) => engine.is_unique(&row) || force_import,
                            None => true,
                        };
                        if keep {
                            unique.push(row);
                        }
                        else {
                            skipped += 1;
                        }
                    }
                    DedupedChunk {
                        index: chunk.index,
                        unique,
                        skipped,
                        errors: chunk.errors,
                    }
                })
                .collect()
        });
        deduped.sort_by_key(|c| c.index);
        observer.phase_complete(ImportPhase::Dedup);

        // phase 2: sequential inserts in chunk order, one transaction per
        // chunk, to keep row ordering and avoid write deadlocks
        let mut conn = self.pool.get()?;
        let mut inserted = 0;
        let mut skipped = 0;
        let mut errored = 0;

        for chunk in deduped {
            if observer.should_cancel() {
                return Err(ImportError::Cancelled.into());
            }

            conn.transaction::<_, Error, _>(|conn| {
                insert_chunk(conn, import_id, config, &chunk.unique)?;
                record_row_errors(conn, import_id, &chunk.errors)?;
                Ok(())
            })?;

            inserted += chunk.unique.len();
            skipped += chunk.skipped;
            errored += chunk.errors.len();
            observer.rows_inserted(chunk.unique.len());
            observer.rows_skipped(chunk.skipped);
        }
        observer.phase_complete(ImportPhase::Insert);

        Ok((inserted, skipped, errored))
    }

    fn register_upload(&self, conn: &mut PgConnection, payload: &FilePayload, file_hash: &str) -> Result<(), Error> {
        use crate::schema::uploaded_files;

        diesel::insert_into(uploaded_files::table)
            .values(UploadedFile {
                id: Uuid::new_v4(),
                file_name: payload.name.clone(),
                size_bytes: payload.bytes.len() as i64,
                fingerprint: file_hash.to_string(),
                upload_id: None,
                created_at: Utc::now(),
            })
            .execute(conn)?;
        Ok(())
    }

    fn create_history(
        &self,
        conn: &mut PgConnection,
        file_hash: &str,
        config: &MappingConfig,
    ) -> Result<Uuid, Error> {
        use crate::schema::import_history;

        let record = ImportHistory {
            import_id: Uuid::new_v4(),
            fingerprint: file_hash.to_string(),
            table_name: config.table_name.clone(),
            status: ImportStatus::Pending.as_str().to_string(),
            strategy: None,
            mapping: serde_json::to_value(config).ok(),
            rows_processed: 0,
            rows_inserted: 0,
            rows_skipped: 0,
            rows_errored: 0,
            error_message: None,
            created_at: Utc::now(),
            finished_at: None,
        };

        diesel::insert_into(import_history::table).values(&record).execute(conn)?;
        Ok(record.import_id)
    }

    fn set_status(&self, conn: &mut PgConnection, target: Uuid, new_status: ImportStatus) -> Result<(), Error> {
        use crate::schema::import_history::dsl::*;

        diesel::update(import_history.filter(import_id.eq(target)))
            .set(status.eq(new_status.as_str()))
            .execute(conn)?;
        Ok(())
    }

    fn finish_history(
        &self,
        conn: &mut PgConnection,
        summary: &ImportSummary,
        error: Option<String>,
    ) -> Result<(), Error> {
        use crate::schema::import_history::dsl::*;

        diesel::update(import_history.filter(import_id.eq(summary.import_id)))
            .set((
                status.eq(summary.status.as_str()),
                rows_processed.eq(summary.rows_processed as i32),
                rows_inserted.eq(summary.rows_inserted as i32),
                rows_skipped.eq(summary.rows_skipped as i32),
                rows_errored.eq(summary.rows_errored as i32),
                error_message.eq(error),
                finished_at.eq(Some(Utc::now())),
            ))
            .execute(conn)?;
        Ok(())
    }
}

/// Build and run the INSERT statements for one chunk. Every row carries the
/// import id, the insert timestamp, its source row number, and any
/// corrections, right alongside the user data.
fn insert_chunk(
    conn: &mut PgConnection,
    import_id: Uuid,
    config: &MappingConfig,
    rows: &[MappedRow],
) -> Result<(), Error> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut column_list: Vec<String> = config.db_schema.iter().map(|c| quote_ident(&c.name)).collect();
    column_list.extend([
        "_import_id".to_string(),
        "_imported_at".to_string(),
        "_source_row_number".to_string(),
        "_corrections_applied".to_string(),
    ]);
    let columns = column_list.join(", ");

    for batch in rows.chunks(INSERT_BATCH) {
        let mut tuples = Vec::with_capacity(batch.len());
        for row in batch {
            let mut literals: Vec<String> = row.values.iter().map(|v| v.to_sql_literal()).collect();
            literals.push(format!("{}::uuid", crate::database::quote_literal(&import_id.to_string())));
            literals.push("now()".to_string());
            literals.push((row.source_row_number as i64).to_string());
            literals.push(match row.corrections_json() {
                Some(corrections) => format!("{}::jsonb", crate::database::quote_literal(&corrections.to_string())),
                None => "NULL".to_string(),
            });
            tuples.push(format!("({})", literals.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(&config.table_name),
            columns,
            tuples.join(", "),
        );
        diesel::sql_query(sql).execute(conn)?;
    }

    Ok(())
}

fn record_row_errors(conn: &mut PgConnection, target_import: Uuid, errors: &[RowError]) -> Result<(), Error> {
    use crate::schema::mapping_errors;

    if errors.is_empty() {
        return Ok(());
    }

    let records: Vec<MappingError> = errors
        .iter()
        .map(|err| MappingError {
            id: Uuid::new_v4(),
            import_id: target_import,
            source_row_number: err.source_row_number as i32,
            reason: err.reason.clone(),
            created_at: Utc::now(),
        })
        .collect();

    diesel::insert_into(mapping_errors::table).values(&records).execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_imports_run_as_a_single_chunk() {
        assert_eq!(plan_chunks(0, LaunchMode::Sync).unwrap(), (1, 1));
        assert_eq!(plan_chunks(500, LaunchMode::Sync).unwrap(), (500, 1));
        assert_eq!(plan_chunks(10_000, LaunchMode::Sync).unwrap(), (10_000, 1));
    }

    #[test]
    fn mid_size_imports_chunk_at_default_size() {
        let (chunk_size, workers) = plan_chunks(10_001, LaunchMode::Sync).unwrap();
        assert_eq!(chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(workers >= 1 && workers <= 4);

        let (chunk_size, _) = plan_chunks(50_000, LaunchMode::Sync).unwrap();
        assert_eq!(chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn oversize_sync_imports_are_refused() {
        let err = plan_chunks(50_001, LaunchMode::Sync).unwrap_err();
        assert!(matches!(err, Error::Import(ImportError::Timeout { rows: 50_001 })));

        assert!(plan_chunks(50_001, LaunchMode::Async).is_ok());
    }
}
