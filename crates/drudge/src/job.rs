//! Job records and attempt bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
///
/// Also used for individual attempts; a record's status always mirrors the
/// status of its most recent attempt (or a queue-level status before any
/// attempt starts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, waiting for a producer to claim it
    Pending,
    /// Claimed by a producer, waiting for a runner
    Queued,
    /// Currently being executed
    Running,
    /// Most recent attempt failed
    Failed,
    /// Most recent attempt completed successfully
    Finished,
    /// Terminal: unregistered kind, abandoned at restart, or operator cancel
    Cancelled,
    /// Terminal: hard-deleted by an operator
    Archived,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Finished => "finished",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed execution record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub started_at: DateTime<Utc>,
    /// Elapsed seconds, set on completion.
    pub duration: f64,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Context frames from the error chain, most recent wrapping first.
    /// Bounded to 10 entries; the root cause is omitted since it already
    /// fills `error`.
    pub stacktrace: Vec<String>,
}

impl Attempt {
    /// Begin an attempt: `running` as of now.
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            duration: 0.0,
            status: JobStatus::Running,
            error: None,
            stacktrace: Vec::new(),
        }
    }

    /// Complete the attempt, recording duration and, on error, the root-cause
    /// message plus up to 10 wrapping context frames.
    pub fn finish(&mut self, err: Option<&anyhow::Error>) {
        self.status = JobStatus::Finished;
        self.duration = (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;

        if let Some(err) = err {
            self.status = JobStatus::Failed;
            self.error = Some(err.root_cause().to_string());

            let chain: Vec<String> = err.chain().map(|c| c.to_string()).collect();
            let frames = chain.len().saturating_sub(1);
            self.stacktrace = chain.into_iter().take(frames.min(10)).collect();
        }
    }
}

/// A durably recorded job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Owning process instance; scopes abandoned-job recovery.
    pub client: String,
    /// Registry key for the worker that executes this job.
    pub kind: String,
    /// Serialized payload, decoded lazily by the matching worker.
    pub args: String,
    pub queue: String,

    pub status: JobStatus,
    /// Insertion order is chronological.
    pub attempts: Vec<Attempt>,
}

impl JobRecord {
    pub fn new(
        client: impl Into<String>,
        kind: impl Into<String>,
        args: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            created_at: now,
            updated_at: now,
            client: client.into(),
            kind: kind.into(),
            args: args.into(),
            queue: queue.into(),
            status: JobStatus::Pending,
            attempts: Vec::new(),
        }
    }

    /// Append an attempt and mirror its status; returns the attempt's index.
    pub fn add_attempt(&mut self, attempt: Attempt) -> usize {
        self.status = attempt.status;
        self.attempts.push(attempt);
        self.attempts.len() - 1
    }

    /// Replace attempt `i` and mirror its status.
    pub fn update_attempt(&mut self, i: usize, attempt: Attempt) {
        self.status = attempt.status;
        self.attempts[i] = attempt;
    }
}
