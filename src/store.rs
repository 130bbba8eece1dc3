use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use rayon::prelude::*;
use serde_json::{json, Value};
use tracing::{info, warn};
use ureq::Agent;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::errors::Error;
use crate::models::UploadSession;

const MIN_PART_BYTES: usize = 5 * 1024 * 1024;
const MAX_PART_BYTES: usize = 100 * 1024 * 1024;
const MAX_PARTS: usize = 10_000;
const PART_CONCURRENCY: usize = 4;
const PART_RETRIES: usize = 3;

/// The object store boundary: presigned-URL style GET and PUT, nothing more.
/// Tests run against the in-memory implementation.
pub trait ObjectStore: Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, Error>;
    fn put_part(&self, key: &str, part_number: usize, bytes: &[u8]) -> Result<String, Error>;
}

/// An S3-compatible store addressed as `{endpoint}/{bucket}/{key}`.
pub struct HttpObjectStore {
    agent: Agent,
    endpoint: String,
    bucket: String,
    access_key_id: String,
    secret_access_key: String,
}

impl HttpObjectStore {
    pub fn new(config: &StorageConfig) -> HttpObjectStore {
        HttpObjectStore {
            agent: Agent::new_with_defaults(),
            endpoint: config.endpoint_url.trim_end_matches('/').to_string(),
            bucket: config.bucket_name.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

impl ObjectStore for HttpObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        with_retries(|| {
            let mut response = self
                .agent
                .get(&self.url(key))
                .header("x-storage-access-key", &self.access_key_id)
                .header("x-storage-secret-key", &self.secret_access_key)
                .call()?;

            let mut bytes = Vec::new();
            response.body_mut().as_reader().read_to_end(&mut bytes)?;
            Ok(bytes)
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, Error> {
        with_retries(|| {
            let response = self
                .agent
                .put(&self.url(key))
                .header("x-storage-access-key", &self.access_key_id)
                .header("x-storage-secret-key", &self.secret_access_key)
                .header("content-type", "application/octet-stream")
                .send(bytes)?;

            Ok(etag_of(response.headers()))
        })
    }

    fn put_part(&self, key: &str, part_number: usize, bytes: &[u8]) -> Result<String, Error> {
        with_retries(|| {
            let url = format!("{}?partNumber={part_number}", self.url(key));
            let response = self
                .agent
                .put(&url)
                .header("x-storage-access-key", &self.access_key_id)
                .header("x-storage-secret-key", &self.secret_access_key)
                .header("content-type", "application/octet-stream")
                .send(bytes)?;

            Ok(etag_of(response.headers()))
        })
    }
}

fn etag_of(headers: &ureq::http::HeaderMap) -> String {
    headers
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

fn with_retries<T>(mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < PART_RETRIES => {
                attempt += 1;
                warn!(attempt, error = %err, "object store request failed, retrying");
                std::thread::sleep(Duration::from_millis(500 * attempt as u64));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Auto-size multipart chunks: the smallest standard size between 5 MB and
/// 100 MB that keeps the part count within the store's limit.
pub fn part_size_for(total_bytes: usize) -> usize {
    const LADDER: &[usize] = &[
        MIN_PART_BYTES,
        8 * 1024 * 1024,
        16 * 1024 * 1024,
        32 * 1024 * 1024,
        64 * 1024 * 1024,
        MAX_PART_BYTES,
    ];

    for size in LADDER {
        if total_bytes.div_ceil(*size) <= MAX_PARTS {
            return *size;
        }
    }
    MAX_PART_BYTES
}

/// Client-side multipart upload coordination: session bookkeeping in the
/// database, part uploads fanned out over a small worker pool.
pub struct MultipartUploader<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> MultipartUploader<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> MultipartUploader<'a> {
        MultipartUploader { store }
    }

    pub fn start_session(
        &self,
        conn: &mut PgConnection,
        file_name: &str,
        declared_size: usize,
    ) -> Result<UploadSession, Error> {
        use crate::schema::upload_sessions;

        let part_size = part_size_for(declared_size);
        let expected_parts = declared_size.div_ceil(part_size).max(1);

        let session = UploadSession {
            upload_id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            declared_size: declared_size as i64,
            expected_parts: expected_parts as i32,
            parts: json!({}),
            status: "active".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        diesel::insert_into(upload_sessions::table).values(&session).execute(conn)?;
        info!(upload_id = %session.upload_id, expected_parts, "started multipart upload");
        Ok(session)
    }

    /// Upload every part of `bytes`, at most four in flight, each retried up
    /// to three times by the store. Returns part number -> ETag.
    pub fn upload_parts(&self, key: &str, bytes: &[u8]) -> Result<Vec<(usize, String)>, Error> {
        let part_size = part_size_for(bytes.len());
        let parts: Vec<(usize, &[u8])> = bytes.chunks(part_size).enumerate().map(|(i, c)| (i + 1, c)).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(PART_CONCURRENCY)
            .build()
            .map_err(|err| Error::Config(format!("failed to build upload pool: {err}")))?;

        let mut etags = pool.install(|| {
            parts
                .par_iter()
                .map(|(number, chunk)| Ok((*number, self.store.put_part(key, *number, chunk)?)))
                .collect::<Result<Vec<(usize, String)>, Error>>()
        })?;

        etags.sort_by_key(|(number, _)| *number);
        Ok(etags)
    }

    pub fn record_part(
        &self,
        conn: &mut PgConnection,
        upload: Uuid,
        part_number: usize,
        etag: &str,
    ) -> Result<(), Error> {
        use crate::schema::upload_sessions::dsl::*;

        let session: UploadSession = upload_sessions
            .filter(upload_id.eq(upload))
            .select(UploadSession::as_select())
            .first(conn)?;

        let mut recorded: HashMap<String, Value> = serde_json::from_value(session.parts).unwrap_or_default();
        recorded.insert(part_number.to_string(), Value::String(etag.to_string()));

        diesel::update(upload_sessions.filter(upload_id.eq(upload)))
            .set((parts.eq(serde_json::to_value(recorded)?), updated_at.eq(Utc::now())))
            .execute(conn)?;
        Ok(())
    }

    /// Completion requires every expected part's ETag to be present.
    pub fn complete_session(&self, conn: &mut PgConnection, upload: Uuid) -> Result<UploadSession, Error> {
        use crate::schema::upload_sessions::dsl::*;

        let session: UploadSession = upload_sessions
            .filter(upload_id.eq(upload))
            .select(UploadSession::as_select())
            .first(conn)?;

        let recorded: HashMap<String, Value> = serde_json::from_value(session.parts.clone()).unwrap_or_default();
        let missing: Vec<i32> = (1..=session.expected_parts)
            .filter(|n| !recorded.contains_key(&n.to_string()))
            .collect();

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "multipart upload {upload} is missing parts: {missing:?}"
            )));
        }

        diesel::update(upload_sessions.filter(upload_id.eq(upload)))
            .set((status.eq("completed"), updated_at.eq(Utc::now())))
            .execute(conn)?;

        let mut session = session;
        session.status = "completed".to_string();
        Ok(session)
    }

    pub fn abort_session(&self, conn: &mut PgConnection, upload: Uuid) -> Result<(), Error> {
        use crate::schema::upload_sessions::dsl::*;

        diesel::update(upload_sessions.filter(upload_id.eq(upload)))
            .set((status.eq("aborted"), updated_at.eq(Utc::now())))
            .execute(conn)?;
        Ok(())
    }

    /// Abandoned sessions (still active past the cutoff) are swept to
    /// aborted so their objects can be garbage collected.
    pub fn sweep_abandoned(&self, conn: &mut PgConnection, older_than: Duration) -> Result<usize, Error> {
        use crate::schema::upload_sessions::dsl::*;

        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::hours(24));
        let swept = diesel::update(
            upload_sessions
                .filter(status.eq("active"))
                .filter(updated_at.lt(cutoff)),
        )
        .set((status.eq("aborted"), updated_at.eq(Utc::now())))
        .execute(conn)?;

        Ok(swept)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no such object: {key}")))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, Error> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes.to_vec());
        Ok(format!("etag-{}", bytes.len()))
    }

    fn put_part(&self, key: &str, part_number: usize, bytes: &[u8]) -> Result<String, Error> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(format!("{key}.part{part_number}"), bytes.to_vec());
        Ok(format!("etag-{part_number}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_size_scales_with_file_size() {
        // anything under 50 GB fits in the minimum part size
        assert_eq!(part_size_for(10 * 1024 * 1024), MIN_PART_BYTES);
        assert_eq!(part_size_for(MAX_PARTS * MIN_PART_BYTES), MIN_PART_BYTES);
        // one byte more forces the next rung
        assert_eq!(part_size_for(MAX_PARTS * MIN_PART_BYTES + 1), 8 * 1024 * 1024);
    }

    #[test]
    fn upload_parts_returns_etags_in_order() {
        let store = MemoryStore::default();
        let uploader = MultipartUploader::new(&store);

        // force multiple parts by simulating a small part size through data
        let bytes = vec![0u8; MIN_PART_BYTES + 1];
        let etags = uploader.upload_parts("data.csv", &bytes).unwrap();

        assert_eq!(etags.len(), 2);
        assert_eq!(etags[0].0, 1);
        assert_eq!(etags[1].0, 2);
        assert!(store.get("data.csv.part1").is_ok());
        assert!(store.get("data.csv.part2").is_ok());
    }
}
