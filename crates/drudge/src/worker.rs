//! Typed workers and the type-erasure boundary.
//!
//! A [`Worker`] is written against its concrete payload type; the engine only
//! ever sees [`ErasedJob`] trait objects produced by a per-kind
//! [`WorkerFactory`]. Deserialization happens lazily at job-load time, so a
//! bad payload fails the load, never the registration.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::job::JobRecord;
use crate::signal::ShutdownSignal;

/// A job payload: the serialized arguments for one job kind.
///
/// `KIND` keys the worker registry and is persisted on every record; changing
/// it orphans already-persisted jobs of the old kind.
pub trait JobPayload: Serialize + DeserializeOwned + Send + 'static {
    const KIND: &'static str;
}

/// Execution context handed to workers.
///
/// Cancellation is cooperative: a worker that ignores the context simply has
/// its result discarded after the engine stops waiting for it.
#[derive(Debug, Clone)]
pub struct WorkContext {
    signal: ShutdownSignal,
}

impl WorkContext {
    pub(crate) fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    /// True once process shutdown has begun; long-running workers should
    /// check this periodically and return early.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_triggered()
    }
}

/// A typed job as seen by its worker: the persisted record plus the decoded
/// payload.
#[derive(Debug)]
pub struct Job<P: JobPayload> {
    pub data: JobRecord,
    pub args: P,
}

/// The interface every worker implements for its payload type.
pub trait Worker: Send + Sync + 'static {
    type Payload: JobPayload;

    /// Per-job timeout. Zero defers to the engine's default.
    fn timeout(&self, _job: &Job<Self::Payload>) -> Duration {
        Duration::ZERO
    }

    /// Execute the job. Errors (and their context chains) are recorded on the
    /// attempt.
    fn work(&self, ctx: &WorkContext, job: &Job<Self::Payload>) -> anyhow::Result<()>;
}

/// A loaded, executable job with its payload type erased.
pub(crate) trait ErasedJob: Send {
    /// Decode the payload from the record's serialized args.
    fn unmarshal(&mut self) -> Result<(), Error>;

    /// The worker-declared timeout for this job (zero = engine default).
    /// Meaningful only after a successful `unmarshal`.
    fn timeout(&self) -> Duration;

    fn work(&self, ctx: &WorkContext) -> anyhow::Result<()>;
}

/// Constructs an [`ErasedJob`] from a raw record.
pub(crate) trait WorkerFactory: Send + Sync {
    fn create(&self, data: &JobRecord) -> Box<dyn ErasedJob>;
}

/// The per-kind factory binding a concrete worker to the erased interface.
pub(crate) struct TypedFactory<W: Worker> {
    worker: Arc<W>,
}

impl<W: Worker> TypedFactory<W> {
    pub(crate) fn new(worker: W) -> Self {
        Self {
            worker: Arc::new(worker),
        }
    }
}

impl<W: Worker> WorkerFactory for TypedFactory<W> {
    fn create(&self, data: &JobRecord) -> Box<dyn ErasedJob> {
        Box::new(WrappedJob {
            worker: Arc::clone(&self.worker),
            data: data.clone(),
            job: None,
        })
    }
}

struct WrappedJob<W: Worker> {
    worker: Arc<W>,
    data: JobRecord,
    job: Option<Job<W::Payload>>,
}

impl<W: Worker> ErasedJob for WrappedJob<W> {
    fn unmarshal(&mut self) -> Result<(), Error> {
        let args: W::Payload = serde_json::from_str(&self.data.args)?;
        self.job = Some(Job {
            data: self.data.clone(),
            args,
        });
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.job
            .as_ref()
            .map(|j| self.worker.timeout(j))
            .unwrap_or(Duration::ZERO)
    }

    fn work(&self, ctx: &WorkContext) -> anyhow::Result<()> {
        match &self.job {
            Some(job) => self.worker.work(ctx, job),
            None => Err(anyhow::anyhow!("job payload not unmarshaled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        msg: String,
    }

    impl JobPayload for Echo {
        const KIND: &'static str = "echo";
    }

    struct EchoWorker;

    impl Worker for EchoWorker {
        type Payload = Echo;

        fn work(&self, _ctx: &WorkContext, job: &Job<Echo>) -> anyhow::Result<()> {
            anyhow::ensure!(!job.args.msg.is_empty(), "empty message");
            Ok(())
        }
    }

    fn ctx() -> WorkContext {
        let (guard, signal) = crate::signal::shutdown_channel();
        std::mem::forget(guard);
        WorkContext::new(signal)
    }

    #[test]
    fn factory_roundtrip() {
        let factory = TypedFactory::new(EchoWorker);
        let record = JobRecord::new("c", Echo::KIND, r#"{"msg":"hi"}"#, "default");

        let mut job = factory.create(&record);
        job.unmarshal().unwrap();
        assert_eq!(job.timeout(), Duration::ZERO);
        assert!(job.work(&ctx()).is_ok());
    }

    #[test]
    fn unmarshal_failure_is_isolated_to_load() {
        let factory = TypedFactory::new(EchoWorker);
        let record = JobRecord::new("c", Echo::KIND, "not json", "default");

        let mut job = factory.create(&record);
        assert!(matches!(job.unmarshal(), Err(Error::Unmarshal(_))));
    }

    #[test]
    fn work_before_unmarshal_errors() {
        let factory = TypedFactory::new(EchoWorker);
        let record = JobRecord::new("c", Echo::KIND, r#"{"msg":"hi"}"#, "default");

        let job = factory.create(&record);
        assert!(job.work(&ctx()).is_err());
    }
}
