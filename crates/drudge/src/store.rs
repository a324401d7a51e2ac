//! Job store contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use crate::job::{Attempt, JobId, JobRecord, JobStatus};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Equality filters, sort direction and limit for store queries.
///
/// An empty query matches every record. Multiple `status` calls accumulate
/// into an any-of filter (used by abandoned-job recovery).
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub client: Option<String>,
    pub queue: Option<String>,
    pub kind: Option<String>,
    pub statuses: Vec<JobStatus>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Sort by creation time, oldest first. This is the default.
    pub fn asc(mut self) -> Self {
        self.descending = false;
        self
    }

    /// Sort by creation time, newest first.
    pub fn desc(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &JobRecord) -> bool {
        self.client.as_ref().map_or(true, |c| &job.client == c)
            && self.queue.as_ref().map_or(true, |q| &job.queue == q)
            && self.kind.as_ref().map_or(true, |k| &job.kind == k)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
    }
}

/// Bulk status transition applied by `update_many`.
#[derive(Debug, Clone)]
pub struct StatusPatch {
    pub status: JobStatus,
    /// When set, a synthetic failed attempt carrying this error is appended
    /// to every patched record (abandoned-job recovery leaves evidence).
    pub attempt_error: Option<String>,
}

/// One row of the grouped live-count aggregation.
#[derive(Debug, Clone)]
pub struct StatusCount {
    pub queue: String,
    pub status: JobStatus,
    pub count: u64,
}

/// Durable job store abstraction.
///
/// The store is the only shared mutable resource in the system; it must
/// provide atomic single-record read-modify-write semantics. All methods are
/// callable from multiple threads.
pub trait JobStore: Send + Sync {
    /// Fetch a record by id.
    fn find(&self, id: &JobId) -> Result<JobRecord, StoreError>;

    /// Upsert a record, refreshing `updated_at`.
    fn save(&self, job: &mut JobRecord) -> Result<(), StoreError>;

    /// Filtered, sorted, limited listing.
    fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError>;

    /// Count records matching the filter (limit is ignored).
    fn count(&self, query: &JobQuery) -> Result<u64, StoreError>;

    /// Bulk status transition; returns the number of modified records.
    fn update_many(&self, query: &JobQuery, patch: &StatusPatch) -> Result<u64, StoreError>;

    /// Live counts grouped by (queue, status), for stats aggregation.
    fn counts_by_queue_status(&self) -> Result<Vec<StatusCount>, StoreError>;
}

/// In-memory job store for tests/dev and embedded deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for InMemoryJobStore {
    fn find(&self, id: &JobId) -> Result<JobRecord, StoreError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    fn save(&self, job: &mut JobRecord) -> Result<(), StoreError> {
        job.updated_at = Utc::now();
        self.write().insert(job.id, job.clone());
        Ok(())
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.read();
        let mut result: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();

        result.sort_by_key(|j| j.created_at);
        if query.descending {
            result.reverse();
        }
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn count(&self, query: &JobQuery) -> Result<u64, StoreError> {
        let jobs = self.read();
        Ok(jobs.values().filter(|j| query.matches(j)).count() as u64)
    }

    fn update_many(&self, query: &JobQuery, patch: &StatusPatch) -> Result<u64, StoreError> {
        let mut jobs = self.write();
        let now = Utc::now();
        let mut modified = 0;

        for job in jobs.values_mut().filter(|j| query.matches(j)) {
            job.status = patch.status;
            job.updated_at = now;
            if let Some(error) = &patch.attempt_error {
                job.attempts.push(Attempt {
                    started_at: now,
                    duration: 0.0,
                    status: JobStatus::Failed,
                    error: Some(error.clone()),
                    stacktrace: Vec::new(),
                });
            }
            modified += 1;
        }
        Ok(modified)
    }

    fn counts_by_queue_status(&self) -> Result<Vec<StatusCount>, StoreError> {
        let jobs = self.read();
        let mut grouped: HashMap<(String, JobStatus), u64> = HashMap::new();
        for job in jobs.values() {
            *grouped.entry((job.queue.clone(), job.status)).or_default() += 1;
        }

        Ok(grouped
            .into_iter()
            .map(|((queue, status), count)| StatusCount { queue, status, count })
            .collect())
    }
}
