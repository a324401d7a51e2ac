//! Named, bounded execution lanes.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::job::JobId;

/// A queue: a bounded in-memory channel of job ids plus its concurrency and
/// polling configuration.
///
/// Queue configuration is process-local; the durable store is the shared
/// coordination point between collaborating processes, not this channel.
#[derive(Debug, Clone)]
pub struct Queue {
    pub name: String,
    /// Number of runner threads draining this queue.
    pub concurrency: usize,
    /// Channel capacity; bounds in-flight memory per queue.
    pub buffer_size: usize,
    /// Producer polling interval.
    pub interval: Duration,
    tx: Sender<JobId>,
    rx: Receiver<JobId>,
}

impl Queue {
    pub(crate) fn new(
        name: impl Into<String>,
        concurrency: usize,
        buffer_size: usize,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = bounded(buffer_size);
        Self {
            name: name.into(),
            concurrency,
            buffer_size,
            interval,
            tx,
            rx,
        }
    }

    /// True when the channel is at capacity; the producer must stop pulling.
    pub fn full(&self) -> bool {
        self.tx.is_full()
    }

    /// Capacity minus current length: the most job ids one fetch pass may pull.
    pub fn remaining(&self) -> usize {
        self.buffer_size - self.tx.len()
    }

    pub(crate) fn sender(&self) -> Sender<JobId> {
        self.tx.clone()
    }

    pub(crate) fn receiver(&self) -> Receiver<JobId> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_invariant() {
        let queue = Queue::new("default", 2, 5, Duration::from_secs(1));
        assert!(!queue.full());
        assert_eq!(queue.remaining(), 5);

        for _ in 0..5 {
            assert_eq!(queue.remaining() + queue.tx.len(), queue.buffer_size);
            queue.sender().send(JobId::new()).unwrap();
        }

        assert!(queue.full());
        assert_eq!(queue.remaining(), 0);
        assert_eq!(queue.remaining() + queue.tx.len(), queue.buffer_size);

        queue.receiver().recv().unwrap();
        assert!(!queue.full());
        assert_eq!(queue.remaining(), 1);
    }

    #[test]
    fn fifo_delivery() {
        let queue = Queue::new("default", 1, 10, Duration::from_secs(1));
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            queue.sender().send(*id).unwrap();
        }

        let rx = queue.receiver();
        for id in &ids {
            assert_eq!(rx.recv().unwrap(), *id);
        }
    }
}
