//! In-process lifecycle notification bus.
//!
//! Single bounded channel fed by `notify`, drained by one dispatch thread
//! that fans out to subscriber closures. The bus is inert until the dispatch
//! thread runs: with nobody listening, notifications are dropped instead of
//! accumulating.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::debug;

use crate::signal::ShutdownSignal;

/// A job lifecycle event. Ephemeral, fire-and-forget, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: String,
    pub job_id: String,
    pub kind: String,
}

type Subscriber = Box<dyn Fn(&Notification) + Send + Sync>;

pub struct NotificationBus {
    tx: Sender<Notification>,
    rx: Receiver<Notification>,
    subs: Mutex<Vec<Subscriber>>,
    listening: AtomicBool,
}

impl NotificationBus {
    pub(crate) fn new(buffer_size: usize) -> Self {
        let (tx, rx) = bounded(buffer_size);
        Self {
            tx,
            rx,
            subs: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
        }
    }

    /// Register a subscriber. Subscribers run on the dispatch thread and
    /// should return quickly.
    pub fn subscribe(&self, f: impl Fn(&Notification) + Send + Sync + 'static) {
        self.subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(f));
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subs.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Best-effort push. Dropped while no dispatch thread is listening; a
    /// full buffer is a diagnostic, not an error, and never blocks the
    /// execution path.
    pub(crate) fn notify(&self, event: &str, job_id: &str, kind: &str) {
        if !self.listening.load(Ordering::Acquire) {
            return;
        }

        if self.tx.is_full() {
            debug!(capacity = self.tx.capacity().unwrap_or(0), "notification buffer full");
        }

        let _ = self.tx.try_send(Notification {
            event: event.to_string(),
            job_id: job_id.to_string(),
            kind: kind.to_string(),
        });
    }

    /// Spawn the dispatch thread. Exits on shutdown.
    pub(crate) fn start(
        self: &std::sync::Arc<Self>,
        signal: ShutdownSignal,
    ) -> std::io::Result<JoinHandle<()>> {
        let bus = std::sync::Arc::clone(self);
        std::thread::Builder::new()
            .name("drudge-notify".to_string())
            .spawn(move || bus.dispatch(signal))
    }

    fn dispatch(&self, signal: ShutdownSignal) {
        self.listening.store(true, Ordering::Release);

        loop {
            select! {
                recv(self.rx) -> msg => match msg {
                    Ok(n) => self.fan_out(&n),
                    Err(_) => break,
                },
                recv(signal.receiver()) -> _ => break,
            }
        }

        self.listening.store(false, Ordering::Release);
    }

    fn fan_out(&self, n: &Notification) {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        for sub in subs.iter() {
            sub(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn inert_until_dispatch_starts() {
        let bus = NotificationBus::new(2);
        // Nothing listening: pushes are dropped, not buffered.
        bus.notify("job:created", "1", "test");
        bus.notify("job:created", "2", "test");
        bus.notify("job:created", "3", "test");
        assert_eq!(bus.rx.len(), 0);
    }

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let bus = Arc::new(NotificationBus::new(16));
        let seen_a: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_b: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen_a);
        bus.subscribe(move |n| a.lock().unwrap().push(n.event.clone()));
        let b = Arc::clone(&seen_b);
        bus.subscribe(move |n| b.lock().unwrap().push(n.job_id.clone()));

        let (guard, signal) = crate::signal::shutdown_channel();
        let handle = bus.start(signal).unwrap();

        // Wait for the dispatch thread to mark itself listening.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !bus.listening.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        bus.notify("job:queued", "42", "test");

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while seen_a.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(seen_a.lock().unwrap().as_slice(), ["job:queued"]);
        assert_eq!(seen_b.lock().unwrap().as_slice(), ["42"]);

        guard.trigger();
        handle.join().unwrap();
        assert!(!bus.listening.load(Ordering::Acquire));
    }
}
