//! The job engine: configuration, registration, enqueue paths, and the
//! start/stop lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::{debug, error, info, warn};

use crate::clock::{CronClock, EntryId};
use crate::error::{Error, Result};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::notify::{Notification, NotificationBus};
use crate::producer::Producer;
use crate::queue::Queue;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::signal::{ShutdownGuard, shutdown_channel};
use crate::stats::{Stats, StatsAggregator};
use crate::store::{JobQuery, JobStore, StatusPatch};
use crate::worker::{JobPayload, Worker};

/// Reserved stats bucket name; not usable as a queue name.
const TOTALS_QUEUE: &str = "totals";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier of this process instance; scopes abandoned-job recovery to
    /// this process's own orphans.
    pub client: String,
    /// Default runner threads per queue.
    pub concurrency: usize,
    /// Default queue channel capacity.
    pub buffer_size: usize,
    /// Default producer polling interval.
    pub poll_interval: Duration,
    /// Timeout for jobs whose worker declares none.
    pub default_timeout: Duration,
    /// How long `stop` waits for loops to observe cancellation.
    pub stop_grace: Duration,
    /// Log every notification at debug level.
    pub debug: bool,
    /// At startup, cancel this client's leftover running/queued jobs.
    pub recover_abandoned: bool,
    /// At startup, reset this client's cancelled jobs to pending.
    pub resume_cancelled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: "drudge".to_string(),
            concurrency: 4,
            buffer_size: 100,
            poll_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(15 * 60),
            stop_grace: Duration::from_secs(5),
            debug: false,
            recover_abandoned: true,
            resume_cancelled: false,
        }
    }
}

impl EngineConfig {
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_recovery(mut self, recover_abandoned: bool, resume_cancelled: bool) -> Self {
        self.recover_abandoned = recover_abandoned;
        self.resume_cancelled = resume_cancelled;
        self
    }
}

/// A durable background-job engine.
///
/// Construct, register workers and queues, then `start`. Jobs enqueued from
/// any thread are persisted first and fed to runner pools through per-queue
/// bounded channels. Dropping the engine stops it.
pub struct JobEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    queues: HashMap<String, Queue>,
    bus: Arc<NotificationBus>,
    clock: Arc<CronClock>,
    stats: Arc<StatsAggregator>,
    shutdown: Option<ShutdownGuard>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl JobEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>) -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            "default".to_string(),
            Queue::new(
                "default",
                config.concurrency,
                config.buffer_size,
                config.poll_interval,
            ),
        );
        // Schedule-queue latency should be minimal; always poll at 1s.
        queues.insert(
            "schedule".to_string(),
            Queue::new(
                "schedule",
                config.concurrency,
                config.buffer_size,
                Duration::from_secs(1),
            ),
        );

        let bus = Arc::new(NotificationBus::new(
            config.buffer_size.saturating_mul(config.buffer_size),
        ));
        let clock = Arc::new(CronClock::new());
        let stats = Arc::new(StatsAggregator::new(Arc::clone(&store), Arc::clone(&clock)));

        Self {
            config,
            store,
            registry: Arc::new(Registry::new()),
            queues,
            bus,
            clock,
            stats,
            shutdown: None,
            handles: Vec::new(),
            started: false,
        }
    }

    /// Add a queue. Zero values fall back to the engine defaults.
    pub fn queue(
        &mut self,
        name: &str,
        concurrency: usize,
        buffer_size: usize,
        interval: Duration,
    ) -> Result<()> {
        if self.started {
            return Err(Error::validation("cannot add queues after start"));
        }
        if name == TOTALS_QUEUE {
            return Err(Error::validation("queue name 'totals' is reserved"));
        }

        let concurrency = if concurrency == 0 {
            self.config.concurrency
        } else {
            concurrency
        };
        let buffer_size = if buffer_size == 0 {
            self.config.buffer_size
        } else {
            buffer_size
        };
        let interval = if interval.is_zero() {
            self.config.poll_interval
        } else {
            interval
        };

        self.queues.insert(
            name.to_string(),
            Queue::new(name, concurrency, buffer_size, interval),
        );
        Ok(())
    }

    /// Register a worker on the `default` queue.
    pub fn register<W: Worker>(&mut self, worker: W) -> Result<()> {
        self.register_with_queue(worker, "default")
    }

    /// Register a worker on a specific queue. Fails on a duplicate kind or
    /// after the engine has started.
    pub fn register_with_queue<W: Worker>(&mut self, worker: W, queue: &str) -> Result<()> {
        let registry = Arc::get_mut(&mut self.registry)
            .ok_or_else(|| Error::validation("cannot register workers after start"))?;
        registry.register(worker, queue)
    }

    /// Persist a job for its kind's registered queue and wake that queue's
    /// producer.
    pub fn enqueue<P: JobPayload>(&self, payload: &P) -> Result<JobId> {
        let queue = self
            .registry
            .queue_for(P::KIND)
            .unwrap_or("default")
            .to_string();
        let args = serde_json::to_string(payload)
            .map_err(|e| Error::Validation(format!("serializing job args: {e}")))?;

        persist_new_job(
            &self.store,
            &self.bus,
            &self.config.client,
            &queue,
            P::KIND,
            &args,
        )
    }

    /// Reset a job to `pending` so it is picked up again. Does not touch the
    /// attempt history.
    pub fn requeue(&self, id: &JobId) -> Result<()> {
        let mut job = self.store.find(id)?;
        job.status = JobStatus::Pending;
        self.store.save(&mut job)?;

        self.bus.notify("job:queued", &job.id.to_string(), &job.kind);
        Ok(())
    }

    /// Fire `payload` into the `schedule` queue per a six-field cron spec.
    pub fn schedule<P: JobPayload>(&self, spec: &str, payload: &P) -> Result<EntryId> {
        let args = serde_json::to_string(payload)
            .map_err(|e| Error::Validation(format!("serializing job args: {e}")))?;
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let client = self.config.client.clone();

        self.clock.add_func(spec, move || {
            bus.notify("job:scheduled", "-", P::KIND);
            if let Err(e) = persist_new_job(&store, &bus, &client, "schedule", P::KIND, &args) {
                error!(kind = P::KIND, error = %e, "enqueuing scheduled job");
            }
        })
    }

    /// Run an ad-hoc function on a cron spec. Only failures are persisted,
    /// as `failed` records on the `schedule_func` queue.
    pub fn schedule_func(
        &self,
        spec: &str,
        name: &str,
        f: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<EntryId> {
        let store = Arc::clone(&self.store);
        let client = self.config.client.clone();
        let name = name.to_string();

        self.clock.add_func(spec, move || {
            let Err(e) = f() else { return };
            error!(name = %name, error = %format!("{e:#}"), "scheduled function failed");

            let mut record = JobRecord::new(&client, &name, "{}", "schedule_func");
            record.status = JobStatus::Failed;
            if let Err(e) = store.save(&mut record) {
                error!(name = %name, error = %e, "saving failed schedule record");
            }
        })
    }

    /// Remove a scheduled entry.
    pub fn remove(&self, id: EntryId) {
        self.clock.remove(id);
    }

    /// Subscribe to lifecycle notifications. Must happen before `start` for
    /// the dispatch loop to be launched.
    pub fn subscribe(&self, f: impl Fn(&Notification) + Send + Sync + 'static) {
        self.bus.subscribe(f);
    }

    /// Subscribe to periodic stats snapshots.
    pub fn subscribe_stats(&self, f: impl Fn(&Stats) + Send + Sync + 'static) {
        self.stats.subscribe(f);
    }

    /// Reconcile crash state, then fan out runners, producers, the cron
    /// clock, and the notification dispatcher.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::validation("engine already started"));
        }

        for (kind, registration) in self.registry.registrations() {
            if !self.queues.contains_key(&registration.queue) {
                return Err(Error::Validation(format!(
                    "kind {kind} routes to unknown queue {}",
                    registration.queue
                )));
            }
        }

        self.recover()?;

        if self.config.debug {
            self.bus.subscribe(|n| {
                debug!(event = %n.event, job = %n.job_id, kind = %n.kind, "notification");
            });
        }

        let (guard, signal) = shutdown_channel();
        let queues: Vec<Queue> = self.queues.values().cloned().collect();

        for queue in queues {
            for w in 0..queue.concurrency {
                let runner = Runner::new(
                    w,
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.registry),
                    queue.receiver(),
                    self.config.default_timeout,
                    signal.clone(),
                );
                self.handles.push(
                    runner
                        .spawn(&queue.name)
                        .expect("failed to spawn runner thread"),
                );
            }

            // Wake the producer as soon as a job for its queue is created;
            // a capacity-1 channel coalesces bursts into one pass.
            let (wake_tx, wake_rx) = bounded(1);
            let registry = Arc::clone(&self.registry);
            let queue_name = queue.name.clone();
            self.bus.subscribe(move |n| {
                if n.event == "job:created"
                    && registry.queue_for(&n.kind).unwrap_or("default") == queue_name
                {
                    let _ = wake_tx.try_send(());
                }
            });

            let producer = Producer::new(
                Arc::clone(&self.store),
                Arc::clone(&self.bus),
                queue,
                self.config.client.clone(),
                wake_rx,
            );
            self.handles.push(
                producer
                    .spawn(signal.clone())
                    .expect("failed to spawn producer thread"),
            );
        }

        self.handles.push(
            self.clock
                .start(signal.clone())
                .expect("failed to spawn clock thread"),
        );

        if self.bus.has_subscribers() {
            self.handles.push(
                self.bus
                    .start(signal)
                    .expect("failed to spawn notification thread"),
            );
        }

        self.shutdown = Some(guard);
        self.started = true;
        info!(client = %self.config.client, queues = self.queues.len(), "engine started");
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        if self.config.recover_abandoned {
            let abandoned = JobQuery::new()
                .client(&self.config.client)
                .status(JobStatus::Running)
                .status(JobStatus::Queued);
            let cancelled = self.store.update_many(
                &abandoned,
                &StatusPatch {
                    status: JobStatus::Cancelled,
                    attempt_error: Some("process restarted".to_string()),
                },
            )?;
            if cancelled > 0 {
                info!(count = cancelled, "cancelled abandoned jobs");
            }
        }

        if self.config.resume_cancelled {
            let resumed = self.store.update_many(
                &JobQuery::new()
                    .client(&self.config.client)
                    .status(JobStatus::Cancelled),
                &StatusPatch {
                    status: JobStatus::Pending,
                    attempt_error: None,
                },
            )?;
            if resumed > 0 {
                info!(count = resumed, "resumed cancelled jobs");
            }
        }

        Ok(())
    }

    /// Trigger shutdown and wait up to the configured grace period for
    /// every loop to observe it. Runner threads are joined, never killed; a
    /// worker ignoring its context keeps its detached work thread.
    pub fn stop(&mut self) {
        let Some(guard) = self.shutdown.take() else {
            return;
        };
        guard.trigger();

        let handles = std::mem::take(&mut self.handles);
        let (done_tx, done_rx) = bounded(1);
        let drainer = std::thread::Builder::new()
            .name("drudge-drain".to_string())
            .spawn(move || {
                for handle in handles {
                    let _ = handle.join();
                }
                let _ = done_tx.send(());
            });

        match drainer {
            Ok(_) => {
                if done_rx.recv_timeout(self.config.stop_grace).is_err() {
                    warn!("grace period elapsed before all loops stopped");
                }
            }
            Err(e) => error!(error = %e, "spawning drain thread"),
        }

        self.started = false;
        info!(client = %self.config.client, "engine stopped");
    }
}

impl Drop for JobEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn persist_new_job(
    store: &Arc<dyn JobStore>,
    bus: &NotificationBus,
    client: &str,
    queue: &str,
    kind: &str,
    args: &str,
) -> Result<JobId> {
    let mut record = JobRecord::new(client, kind, args, queue);
    store.save(&mut record)?;

    bus.notify("job:created", &record.id.to_string(), &record.kind);
    Ok(record.id)
}
