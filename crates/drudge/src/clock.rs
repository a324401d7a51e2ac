//! Cron clock: fires registered callbacks on six-field (seconds-resolution)
//! cron schedules.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::error;

use crate::error::{Error, Result};
use crate::signal::ShutdownSignal;

/// Handle to a scheduled entry, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

type Callback = std::sync::Arc<dyn Fn() + Send + Sync>;

struct Entry {
    schedule: cron::Schedule,
    callback: Callback,
    next: Option<DateTime<Utc>>,
}

/// Evaluates cron schedules on a dedicated thread and fires due callbacks.
///
/// Each fire runs on its own short-lived thread so one slow callback cannot
/// delay the others.
pub struct CronClock {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    // Nudges the clock thread to recompute its sleep when entries change.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl CronClock {
    pub(crate) fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            wake_tx,
            wake_rx,
        }
    }

    /// Register `callback` to fire per `spec` (six-field cron, seconds first).
    pub fn add_func(
        &self,
        spec: &str,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<EntryId> {
        let schedule =
            cron::Schedule::from_str(spec).map_err(|e| Error::InvalidSchedule(e.to_string()))?;
        let next = schedule.upcoming(Utc).next();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.lock_entries().insert(
            id,
            Entry {
                schedule,
                callback: std::sync::Arc::new(callback),
                next,
            },
        );
        let _ = self.wake_tx.try_send(());
        Ok(EntryId(id))
    }

    /// Remove a scheduled entry. Unknown ids are ignored.
    pub fn remove(&self, id: EntryId) {
        self.lock_entries().remove(&id.0);
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn start(
        self: &std::sync::Arc<Self>,
        signal: ShutdownSignal,
    ) -> std::io::Result<JoinHandle<()>> {
        let clock = std::sync::Arc::clone(self);
        std::thread::Builder::new()
            .name("drudge-clock".to_string())
            .spawn(move || clock.run(signal))
    }

    fn run(&self, signal: ShutdownSignal) {
        loop {
            let sleep = self.until_next().unwrap_or(Duration::from_secs(60));
            select! {
                recv(signal.receiver()) -> _ => break,
                recv(self.wake_rx) -> msg => { if msg.is_err() { break; } }
                default(sleep) => self.fire_due(),
            }
        }
    }

    fn until_next(&self) -> Option<Duration> {
        let entries = self.lock_entries();
        let soonest = entries.values().filter_map(|e| e.next).min()?;
        Some((soonest - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    fn fire_due(&self) {
        let now = Utc::now();
        let mut due: Vec<Callback> = Vec::new();

        {
            let mut entries = self.lock_entries();
            for entry in entries.values_mut() {
                if entry.next.is_some_and(|next| next <= now) {
                    due.push(std::sync::Arc::clone(&entry.callback));
                    entry.next = entry.schedule.after(&now).next();
                }
            }
        }

        for callback in due {
            let spawned = std::thread::Builder::new()
                .name("drudge-cron".to_string())
                .spawn(move || callback());
            if let Err(e) = spawned {
                error!(error = %e, "spawning cron callback");
            }
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn invalid_spec_is_rejected() {
        let clock = CronClock::new();
        assert!(matches!(
            clock.add_func("not a cron spec", || {}),
            Err(Error::InvalidSchedule(_))
        ));
    }

    #[test]
    fn every_second_entry_fires() {
        let clock = Arc::new(CronClock::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        clock
            .add_func("* * * * * *", move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let (guard, signal) = crate::signal::shutdown_channel();
        let handle = clock.start(signal).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);

        guard.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn removed_entry_stops_firing() {
        let clock = Arc::new(CronClock::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        let id = clock
            .add_func("* * * * * *", move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        clock.remove(id);

        let (guard, signal) = crate::signal::shutdown_channel();
        let handle = clock.start(signal).unwrap();
        std::thread::sleep(Duration::from_millis(1500));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        guard.trigger();
        handle.join().unwrap();
    }
}
