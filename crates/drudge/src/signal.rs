//! Process-wide shutdown signalling.
//!
//! One [`ShutdownGuard`] is held by the engine; every loop holds a cloned
//! [`ShutdownSignal`]. Nothing is ever sent on the underlying channel: when
//! the guard drops, every `recv` unblocks with a disconnect, which all loops
//! treat as the stop signal. This gives one-to-many cancellation with no
//! shared flags.

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

/// Triggers shutdown when dropped (or via [`ShutdownGuard::trigger`]).
#[derive(Debug)]
pub struct ShutdownGuard {
    _tx: Sender<()>,
}

impl ShutdownGuard {
    /// Explicitly trigger shutdown; equivalent to dropping the guard.
    pub fn trigger(self) {}
}

/// Cloneable handle observed by every spawned loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// The raw receiver, for use in `select!` arms. Completes only when
    /// shutdown has been triggered.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Non-blocking check, for workers polling cooperatively mid-`work`.
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// Create a linked guard/signal pair.
pub fn shutdown_channel() -> (ShutdownGuard, ShutdownSignal) {
    let (tx, rx) = bounded(0);
    (ShutdownGuard { _tx: tx }, ShutdownSignal { rx })
}
