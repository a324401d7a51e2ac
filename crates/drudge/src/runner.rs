//! Runner: executes jobs pulled from a queue with full lifecycle bookkeeping.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, after, bounded, select};
use tracing::{debug, error};

use crate::error::Error;
use crate::job::{Attempt, JobId, JobRecord, JobStatus};
use crate::notify::NotificationBus;
use crate::registry::Registry;
use crate::signal::ShutdownSignal;
use crate::store::JobStore;
use crate::worker::{ErasedJob, WorkContext};

/// One worker thread in a queue's pool.
///
/// Pulls job ids, loads and executes the bound worker, and records exactly
/// one attempt per execution. Individual job failures are recorded and
/// reported but never stop the pull loop.
pub(crate) struct Runner {
    pub(crate) id: usize,
    store: Arc<dyn JobStore>,
    bus: Arc<NotificationBus>,
    registry: Arc<Registry>,
    rx: Receiver<JobId>,
    default_timeout: Duration,
    signal: ShutdownSignal,
}

impl Runner {
    pub(crate) fn new(
        id: usize,
        store: Arc<dyn JobStore>,
        bus: Arc<NotificationBus>,
        registry: Arc<Registry>,
        rx: Receiver<JobId>,
        default_timeout: Duration,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            id,
            store,
            bus,
            registry,
            rx,
            default_timeout,
            signal,
        }
    }

    pub(crate) fn spawn(self, queue_name: &str) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("drudge-runner-{}-{}", queue_name, self.id))
            .spawn(move || self.run())
    }

    fn run(&self) {
        loop {
            select! {
                recv(self.rx) -> msg => match msg {
                    Ok(job_id) => {
                        if let Err(e) = self.run_job(job_id) {
                            let mut msg = format!("{e:#}");
                            if msg.len() > 100 {
                                let mut cut = 97;
                                while !msg.is_char_boundary(cut) {
                                    cut -= 1;
                                }
                                msg.truncate(cut);
                                msg.push_str("...");
                            }
                            error!(runner = self.id, error = %msg, "job failed");
                        }
                    }
                    Err(_) => break,
                },
                recv(self.signal.receiver()) -> _ => break,
            }
        }
        debug!(runner = self.id, "runner stopped");
    }

    fn run_job(&self, job_id: JobId) -> anyhow::Result<()> {
        self.bus.notify("job:load", &job_id.to_string(), "-");

        let (job, mut record) = self.load_job(&job_id).context("loading job")?;

        // Bookkeeping panics are contained here so the pull loop survives;
        // they still count as a failure of this job.
        let result = match catch_unwind(AssertUnwindSafe(|| self.run_attempt(&mut record, job))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::Error::new(Error::Panic(format!(
                "outside of job work: {}",
                panic_message(&*payload)
            )))),
        };

        let event = if result.is_err() { "job:fail" } else { "job:success" };
        self.bus.notify(event, &job_id.to_string(), &record.kind);

        result
    }

    /// Load the record, resolve its worker, and decode the payload.
    ///
    /// An unregistered kind is terminal: the job is cancelled in the store
    /// and never attempted. A payload that fails to decode leaves the job in
    /// its current persisted status for operator intervention.
    fn load_job(&self, job_id: &JobId) -> anyhow::Result<(Box<dyn ErasedJob>, JobRecord)> {
        let mut record = self.store.find(job_id)?;

        let registration = match self.registry.resolve(&record.kind) {
            Some(registration) => registration,
            None => {
                record.status = JobStatus::Cancelled;
                if let Err(e) = self.store.save(&mut record) {
                    error!(job_id = %record.id, error = %e, "cancelling unregistered job");
                }
                return Err(Error::WorkerNotFound(record.kind.clone()).into());
            }
        };

        let mut job = registration.factory.create(&record);
        job.unmarshal().context("unmarshaling job")?;

        Ok((job, record))
    }

    fn run_attempt(
        &self,
        record: &mut JobRecord,
        job: Box<dyn ErasedJob>,
    ) -> anyhow::Result<()> {
        let mut attempt = Attempt::start();
        let i = record.add_attempt(attempt.clone());
        // Persisted before work begins: a crash mid-execution leaves a
        // visible running attempt for restart-time recovery.
        self.store.save(record).context("updating job")?;

        self.bus.notify("job:start", &record.id.to_string(), &record.kind);
        let result = self.run_work(job).context("running job");
        attempt.finish(result.as_ref().err());
        self.bus.notify("job:finish", &record.id.to_string(), &record.kind);

        record.update_attempt(i, attempt);
        self.store.save(record).context("updating job")?;

        result
    }

    /// Race the work call against the effective timeout and shutdown.
    ///
    /// The work runs on its own thread; whichever of {completion, timer,
    /// shutdown} fires first decides the outcome. A losing work thread is
    /// not interrupted, only disowned — workers observe cancellation through
    /// their context.
    fn run_work(&self, job: Box<dyn ErasedJob>) -> anyhow::Result<()> {
        let mut timeout = self.default_timeout;
        if job.timeout() > Duration::ZERO {
            timeout = job.timeout();
        }

        let ctx = WorkContext::new(self.signal.clone());
        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("drudge-work".to_string())
            .spawn(move || {
                let result = match catch_unwind(AssertUnwindSafe(|| job.work(&ctx))) {
                    Ok(result) => result,
                    Err(payload) => {
                        Err(anyhow::Error::new(Error::Panic(panic_message(&*payload))))
                    }
                };
                let _ = tx.send(result);
            })
            .context("spawning work thread")?;

        select! {
            recv(rx) -> result => result.unwrap_or_else(|_| Err(Error::Panic("work thread exited".into()).into())),
            recv(after(timeout)) -> _ => Err(Error::Timeout.into()),
            recv(self.signal.receiver()) -> _ => Err(Error::Cancelled.into()),
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
