//! Per-queue producer: refills the queue channel from the job store.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, select, tick};
use tracing::{debug, error};

use crate::job::{JobId, JobStatus};
use crate::notify::NotificationBus;
use crate::queue::Queue;
use crate::signal::ShutdownSignal;
use crate::store::{JobQuery, JobStore};

/// Moves eligible jobs from durable storage into the queue's channel.
///
/// Wakes immediately when a creation notification for this queue arrives,
/// and otherwise polls on the queue's interval. The pending→queued store
/// transition is the commit point: only a job this producer successfully
/// transitioned is pushed onto the channel.
pub(crate) struct Producer {
    store: Arc<dyn JobStore>,
    bus: Arc<NotificationBus>,
    queue: Queue,
    client: String,
    tx: Sender<JobId>,
    wake_rx: Receiver<()>,
}

impl Producer {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<NotificationBus>,
        queue: Queue,
        client: String,
        wake_rx: Receiver<()>,
    ) -> Self {
        let tx = queue.sender();
        Self {
            store,
            bus,
            queue,
            client,
            tx,
            wake_rx,
        }
    }

    pub(crate) fn spawn(self, signal: ShutdownSignal) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("drudge-producer-{}", self.queue.name))
            .spawn(move || self.run(signal))
    }

    fn run(&self, signal: ShutdownSignal) {
        let ticker = tick(self.queue.interval);
        debug!(queue = %self.queue.name, "producer started");

        loop {
            select! {
                recv(self.wake_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.fetch_pass();
                }
                recv(ticker) -> _ => self.fetch_pass(),
                recv(signal.receiver()) -> _ => break,
            }
        }

        debug!(queue = %self.queue.name, "producer stopped");
    }

    fn fetch_pass(&self) {
        if self.queue.full() {
            return;
        }

        let query = JobQuery::new()
            .client(&self.client)
            .queue(&self.queue.name)
            .status(JobStatus::Pending)
            .asc()
            .limit(self.queue.remaining());

        let list = match self.store.query(&query) {
            Ok(list) => list,
            Err(e) => {
                error!(queue = %self.queue.name, error = %e, "querying pending jobs");
                return;
            }
        };

        for mut job in list {
            job.status = JobStatus::Queued;
            if let Err(e) = self.store.save(&mut job) {
                // Still pending in the store; the next pass retries it.
                error!(job_id = %job.id, error = %e, "updating job to queued");
                continue;
            }

            self.bus.notify("job:queued", &job.id.to_string(), &job.kind);
            if self.tx.send(job.id).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;
    use crate::store::InMemoryJobStore;
    use std::time::Duration;

    fn seed_pending(store: &InMemoryJobStore, client: &str, queue: &str) -> JobId {
        let mut job = JobRecord::new(client, "test", "{}", queue);
        store.save(&mut job).unwrap();
        job.id
    }

    fn producer_for(store: Arc<InMemoryJobStore>, queue: &Queue) -> Producer {
        let bus = Arc::new(NotificationBus::new(16));
        let (_wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Producer::new(store, bus, queue.clone(), "me".to_string(), wake_rx)
    }

    #[test]
    fn fetch_pass_claims_oldest_first_up_to_remaining() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Queue::new("default", 1, 2, Duration::from_secs(1));

        let first = seed_pending(&store, "me", "default");
        let second = seed_pending(&store, "me", "default");
        let third = seed_pending(&store, "me", "default");
        seed_pending(&store, "someone-else", "default");
        seed_pending(&store, "me", "other");

        let producer = producer_for(Arc::clone(&store), &queue);
        producer.fetch_pass();

        // Buffer of 2: only the two oldest were claimed.
        let rx = queue.receiver();
        assert_eq!(rx.try_recv().unwrap(), first);
        assert_eq!(rx.try_recv().unwrap(), second);
        assert!(rx.try_recv().is_err());

        assert_eq!(store.find(&first).unwrap().status, JobStatus::Queued);
        assert_eq!(store.find(&second).unwrap().status, JobStatus::Queued);
        assert_eq!(store.find(&third).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn full_queue_skips_the_pass() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Queue::new("default", 1, 1, Duration::from_secs(1));
        queue.sender().send(JobId::new()).unwrap();

        let id = seed_pending(&store, "me", "default");
        let producer = producer_for(Arc::clone(&store), &queue);
        producer.fetch_pass();

        assert_eq!(store.find(&id).unwrap().status, JobStatus::Pending);
    }
}
