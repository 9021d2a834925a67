use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Gate allowing at most one sync cycle at a time across every trigger.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set in one step; `None` while another permit is alive.
    pub fn try_acquire(&self) -> Option<SyncPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncPermit {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Proof of holding the gate. Dropping it releases the gate.
#[derive(Debug)]
pub struct SyncPermit {
    running: Arc<AtomicBool>,
}

impl SyncPermit {
    pub fn release(self) {}
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
