//! Periodic per-queue/per-status count aggregation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::clock::{CronClock, EntryId};
use crate::store::JobStore;

/// Snapshot of live job counts: queue → status → count.
///
/// The `totals` key sums across queues; queue names may not collide with it.
pub type Stats = HashMap<String, HashMap<String, u64>>;

type StatsSubscriber = Box<dyn Fn(&Stats) + Send + Sync>;

/// Aggregates grouped counts from the store on a one-second schedule and
/// pushes snapshots to subscribers.
///
/// The schedule entry is installed on first subscription and removed again
/// once all subscribers are gone or the aggregation query fails.
pub(crate) struct StatsAggregator {
    store: Arc<dyn JobStore>,
    clock: Arc<CronClock>,
    subs: Mutex<Vec<StatsSubscriber>>,
    entry: Mutex<Option<EntryId>>,
}

impl StatsAggregator {
    pub(crate) fn new(store: Arc<dyn JobStore>, clock: Arc<CronClock>) -> Self {
        Self {
            store,
            clock,
            subs: Mutex::new(Vec::new()),
            entry: Mutex::new(None),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, f: impl Fn(&Stats) + Send + Sync + 'static) {
        self.lock_subs().push(Box::new(f));

        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        if entry.is_none() {
            let aggregator = Arc::clone(self);
            match self.clock.add_func("* * * * * *", move || aggregator.aggregate()) {
                Ok(id) => *entry = Some(id),
                Err(e) => error!(error = %e, "scheduling stats aggregation"),
            }
        }
    }

    fn aggregate(&self) {
        if self.lock_subs().is_empty() {
            self.disable();
            return;
        }

        let rows = match self.store.counts_by_queue_status() {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "querying stats");
                self.disable();
                return;
            }
        };

        let mut stats = Stats::new();
        for row in rows {
            *stats
                .entry(row.queue.clone())
                .or_default()
                .entry(row.status.as_str().to_string())
                .or_default() += row.count;
            *stats
                .entry("totals".to_string())
                .or_default()
                .entry(row.status.as_str().to_string())
                .or_default() += row.count;
        }

        for sub in self.lock_subs().iter() {
            sub(&stats);
        }
    }

    fn disable(&self) {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = entry.take() {
            self.clock.remove(id);
        }
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, Vec<StatsSubscriber>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRecord, JobStatus};
    use crate::store::InMemoryJobStore;

    fn seed(store: &InMemoryJobStore, queue: &str, status: JobStatus, n: usize) {
        for _ in 0..n {
            let mut job = JobRecord::new("me", "test", "{}", queue);
            job.status = status;
            store.save(&mut job).unwrap();
        }
    }

    #[test]
    fn snapshot_groups_by_queue_and_sums_totals() {
        let store = Arc::new(InMemoryJobStore::new());
        seed(&store, "default", JobStatus::Finished, 3);
        seed(&store, "default", JobStatus::Failed, 2);
        seed(&store, "other", JobStatus::Finished, 1);

        let aggregator = Arc::new(StatsAggregator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::new(CronClock::new()),
        ));

        let seen: Arc<Mutex<Vec<Stats>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        aggregator.subscribe(move |stats| sink.lock().unwrap().push(stats.clone()));

        aggregator.aggregate();

        let snapshots = seen.lock().unwrap();
        let stats = snapshots.last().expect("one snapshot");
        assert_eq!(stats["default"]["finished"], 3);
        assert_eq!(stats["default"]["failed"], 2);
        assert_eq!(stats["other"]["finished"], 1);
        assert_eq!(stats["totals"]["finished"], 4);
        assert_eq!(stats["totals"]["failed"], 2);
    }

    #[test]
    fn aggregation_self_disables_without_subscribers() {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = Arc::new(CronClock::new());
        let aggregator = Arc::new(StatsAggregator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&clock),
        ));

        aggregator.subscribe(|_| {});
        assert!(aggregator.entry.lock().unwrap().is_some());

        aggregator.lock_subs().clear();
        aggregator.aggregate();
        assert!(aggregator.entry.lock().unwrap().is_none());
    }
}
