use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::ParseCache;
use crate::database::PgPool;
use crate::errors::Error;
use crate::executor::{FilePayload, ImportExecutor, ImportObserver, ImportPhase, LaunchMode};
use crate::mapping::MappingConfig;
use crate::models::ImportJob;
use crate::store::ObjectStore;

/// What an async import needs to run later: where the file lives and how to
/// map it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub key: String,
    pub file_name: String,
    pub config: MappingConfig,
}

pub struct TaskManager {
    pool: PgPool,
}

impl TaskManager {
    pub fn new(pool: PgPool) -> TaskManager {
        TaskManager { pool }
    }

    /// Create the durable job record. A background worker picks it up.
    pub fn submit(&self, payload: &TaskPayload) -> Result<Uuid, Error> {
        use crate::schema::import_jobs;

        let job = ImportJob {
            task_id: Uuid::new_v4(),
            status: "pending".to_string(),
            progress: 0,
            message: None,
            result: None,
            import_id: None,
            payload: serde_json::to_value(payload)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut conn = self.pool.get()?;
        diesel::insert_into(import_jobs::table).values(&job).execute(&mut conn)?;
        info!(task_id = %job.task_id, "queued import task");
        Ok(job.task_id)
    }

    pub fn status(&self, task: Uuid) -> Result<ImportJob, Error> {
        use crate::schema::import_jobs::dsl::*;

        let mut conn = self.pool.get()?;
        let job = import_jobs
            .filter(task_id.eq(task))
            .select(ImportJob::as_select())
            .first(&mut conn)?;
        Ok(job)
    }

    /// Admin cancellation: the running worker notices the terminal status
    /// between chunks and aborts the current chunk's transaction.
    pub fn cancel(&self, task: Uuid) -> Result<(), Error> {
        use crate::schema::import_jobs::dsl::*;

        let mut conn = self.pool.get()?;
        diesel::update(import_jobs.filter(task_id.eq(task)))
            .set((status.eq("failed"), message.eq("cancelled by admin"), updated_at.eq(Utc::now())))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Workers are stateless: any job left processing by a dead worker goes
    /// back to pending on startup.
    pub fn recover_stale(&self) -> Result<usize, Error> {
        use crate::schema::import_jobs::dsl::*;

        let mut conn = self.pool.get()?;
        let recovered = diesel::update(import_jobs.filter(status.eq("processing")))
            .set((status.eq("pending"), updated_at.eq(Utc::now())))
            .execute(&mut conn)?;

        if recovered > 0 {
            warn!(recovered, "requeued in-flight jobs from a previous run");
        }
        Ok(recovered)
    }

    /// Claim the oldest pending job, if any. SKIP LOCKED keeps concurrent
    /// workers from fighting over the same row.
    fn claim_next(&self) -> Result<Option<ImportJob>, Error> {
        use crate::schema::import_jobs::dsl::*;

        let mut conn = self.pool.get()?;
        conn.transaction::<_, Error, _>(|conn| {
            let candidate = import_jobs
                .filter(status.eq("pending"))
                .order(created_at.asc())
                .limit(1)
                .select(ImportJob::as_select())
                .for_update()
                .skip_locked()
                .first::<ImportJob>(conn)
                .optional()?;

            let Some(job) = candidate else {
                return Ok(None);
            };

            diesel::update(import_jobs.filter(task_id.eq(job.task_id)))
                .set((status.eq("processing"), updated_at.eq(Utc::now())))
                .execute(conn)?;
            Ok(Some(job))
        })
    }

    fn update_progress(&self, task: Uuid, percent: i32, note: &str) {
        use crate::schema::import_jobs::dsl::*;

        let db_result = self.pool.get().map_err(Error::from).and_then(|mut conn| {
            diesel::update(import_jobs.filter(task_id.eq(task)))
                .set((progress.eq(percent), message.eq(note), updated_at.eq(Utc::now())))
                .execute(&mut conn)
                .map_err(Error::from)
        });
        if let Err(err) = db_result {
            warn!(task_id = %task, error = %err, "failed to write task progress");
        }
    }

    fn is_cancelled(&self, task: Uuid) -> bool {
        use crate::schema::import_jobs::dsl::*;

        self.pool
            .get()
            .ok()
            .and_then(|mut conn| {
                import_jobs
                    .filter(task_id.eq(task))
                    .select(status)
                    .first::<String>(&mut conn)
                    .ok()
            })
            .is_some_and(|s| s == "failed")
    }

    /// The background worker loop: claim, execute, repeat until shutdown.
    pub fn run_worker(
        &self,
        cache: &ParseCache,
        store: &dyn ObjectStore,
        poll_interval: Duration,
        shutdown: &AtomicBool,
    ) -> Result<(), Error> {
        self.recover_stale()?;

        while !shutdown.load(Ordering::Relaxed) {
            match self.claim_next()? {
                Some(job) => {
                    if let Err(err) = self.execute_job(&job, cache, store) {
                        error!(task_id = %job.task_id, error = %err, "import task failed");
                        self.mark_failed(job.task_id, &err);
                    }
                }
                None => std::thread::sleep(poll_interval),
            }
        }
        Ok(())
    }

    fn execute_job(&self, job: &ImportJob, cache: &ParseCache, store: &dyn ObjectStore) -> Result<(), Error> {
        use crate::schema::import_jobs::dsl::*;

        let task_payload: TaskPayload = serde_json::from_value(job.payload.clone())?;
        info!(task_id = %job.task_id, key = task_payload.key, "starting import task");

        let bytes = store.get(&task_payload.key)?;
        let file = FilePayload::from_named_bytes(&task_payload.file_name, bytes)?;

        let observer = TaskObserver {
            manager: self,
            task: job.task_id,
        };

        let executor = ImportExecutor::new(self.pool.clone(), cache);
        let summary = executor.run(&file, &task_payload.config, LaunchMode::Async, &observer)?;

        let mut conn = self.pool.get()?;
        diesel::update(import_jobs.filter(task_id.eq(job.task_id)))
            .set((
                status.eq("completed"),
                progress.eq(100),
                message.eq("import complete"),
                result.eq(Some(serde_json::to_value(&summary)?)),
                import_id.eq(Some(summary.import_id)),
                updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_failed(&self, task: Uuid, err: &Error) {
        use crate::schema::import_jobs::dsl::*;

        let envelope = json!(err.envelope());
        let update = self.pool.get().map_err(Error::from).and_then(|mut conn| {
            diesel::update(import_jobs.filter(task_id.eq(task)))
                .set((
                    status.eq("failed"),
                    message.eq(err.to_string()),
                    result.eq(Some(envelope)),
                    updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)
                .map_err(Error::from)
        });
        if let Err(update_err) = update {
            error!(task_id = %task, error = %update_err, "failed to record task failure");
        }
    }
}

/// Bridges the executor's phase callbacks to the job row: progress at phase
/// boundaries, cancellation by polling the job's status between chunks.
struct TaskObserver<'a> {
    manager: &'a TaskManager,
    task: Uuid,
}

impl ImportObserver for TaskObserver<'_> {
    fn phase_complete(&self, phase: ImportPhase) {
        let (percent, note) = match phase {
            ImportPhase::Map => (33, "mapping complete"),
            ImportPhase::Dedup => (66, "duplicate check complete"),
            ImportPhase::Insert => (100, "insert complete"),
        };
        self.manager.update_progress(self.task, percent, note);
    }

    fn should_cancel(&self) -> bool {
        self.manager.is_cancelled(self.task)
    }
}
