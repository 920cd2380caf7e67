use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Bounded one-slot wake signal.
///
/// Used to interrupt the scheduler's 3 s bounded waits when new work arrives
/// or shutdown is requested. Coalescing is fine: a single pending token wakes
/// the next wait regardless of how many notifies landed in between.
#[derive(Clone)]
pub(crate) struct WakeSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WakeSignal {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Never blocks; a full slot means a wake is already pending.
    pub(crate) fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    /// Returns true if woken by a notify, false on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Clears any stale token so the next wait reflects fresh notifies only.
    pub(crate) fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}
