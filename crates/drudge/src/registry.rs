//! Worker registry: kind → (factory, queue).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::worker::{JobPayload, TypedFactory, Worker, WorkerFactory};

pub(crate) struct Registration {
    pub(crate) factory: Box<dyn WorkerFactory>,
    pub(crate) queue: String,
}

/// Write-once map of job kinds to their workers and queues.
///
/// Built before the engine starts and immutable afterwards.
#[derive(Default)]
pub(crate) struct Registry {
    workers: HashMap<String, Registration>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<W: Worker>(&mut self, worker: W, queue: &str) -> Result<()> {
        let kind = W::Payload::KIND;
        if self.workers.contains_key(kind) {
            return Err(Error::DuplicateKind(kind.to_string()));
        }

        self.workers.insert(
            kind.to_string(),
            Registration {
                factory: Box::new(TypedFactory::new(worker)),
                queue: queue.to_string(),
            },
        );
        Ok(())
    }

    pub(crate) fn resolve(&self, kind: &str) -> Option<&Registration> {
        self.workers.get(kind)
    }

    /// The queue a kind routes to, when registered.
    pub(crate) fn queue_for(&self, kind: &str) -> Option<&str> {
        self.workers.get(kind).map(|r| r.queue.as_str())
    }

    pub(crate) fn registrations(&self) -> impl Iterator<Item = (&String, &Registration)> {
        self.workers.iter()
    }
}
