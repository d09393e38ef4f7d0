//! Pool of idle pod indices, consulted only when pods are recycled.

use tokio::sync::{Mutex, mpsc};

pub(crate) struct FreeList {
    idle_tx: mpsc::Sender<usize>,
    idle_rx: Mutex<mpsc::Receiver<usize>>,
}

impl FreeList {
    pub(crate) fn new(capacity: usize) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        Self {
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
        }
    }

    /// Take an idle pod, if any.
    pub(crate) fn try_pop(&self) -> Option<usize> {
        self.idle_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Return a pod to the pool.
    pub(crate) fn release(&self, index: usize) {
        // Capacity equals the pod count, so a return cannot overflow.
        let _ = self.idle_tx.try_send(index);
    }
}
