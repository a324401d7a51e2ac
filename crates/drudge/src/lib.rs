//! Durable background-job scheduling.
//!
//! ## Design
//!
//! - Workers declare typed payloads; callers enqueue them for later execution
//! - Jobs are persisted to a [`JobStore`] before anything runs, so queued and
//!   running work survives process restarts
//! - Per-queue producer/consumer pipelines over bounded channels give
//!   backpressure without cross-queue coupling
//! - Runner pools execute with attempt tracking, timeouts, and panic
//!   containment; abandoned jobs are reconciled at the next startup
//! - Lifecycle events fan out over an in-process notification bus; cron
//!   schedules and periodic stats ride the same machinery
//!
//! ## Components
//!
//! - [`JobEngine`]: construction, registration, enqueue, start/stop
//! - [`Worker`] / [`JobPayload`]: the typed execution interface
//! - [`JobStore`]: durable persistence boundary ([`InMemoryJobStore`] for
//!   tests and embedded use)
//! - [`NotificationBus`] events and [`Stats`] snapshots for observers

pub mod clock;
pub mod engine;
pub mod error;
pub mod job;
pub mod notify;
mod producer;
pub mod queue;
mod registry;
mod runner;
pub mod signal;
pub mod stats;
pub mod store;
pub mod worker;


pub use clock::EntryId;
pub use engine::{EngineConfig, JobEngine};
pub use error::{Error, Result};
pub use job::{Attempt, JobId, JobRecord, JobStatus};
pub use notify::{Notification, NotificationBus};
pub use queue::Queue;
pub use signal::{ShutdownGuard, ShutdownSignal};
pub use stats::Stats;
pub use store::{InMemoryJobStore, JobQuery, JobStore, StatusCount, StatusPatch, StoreError};
pub use worker::{Job, JobPayload, WorkContext, Worker};
