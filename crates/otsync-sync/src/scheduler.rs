use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Timer expiry delivered to the control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub generation: u64,
    pub fired_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// The timer that produced this tick was cancelled or replaced.
    Stale,
    /// Auto-update was switched off after the timer was armed.
    Disabled,
    /// Start a cycle; the next timer is already armed.
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Disabled,
    Idle,
    Running,
}

#[derive(Debug)]
struct PendingTimer {
    handle: JoinHandle<()>,
    due: Instant,
}

/// Owns the single auto-update timer. Lives on the control task; timers
/// report back through `tick_tx`.
#[derive(Debug)]
pub struct Scheduler {
    tick_tx: mpsc::UnboundedSender<Tick>,
    enabled: bool,
    interval: Duration,
    generation: u64,
    pending: Option<PendingTimer>,
}

impl Scheduler {
    pub fn new(tick_tx: mpsc::UnboundedSender<Tick>) -> Self {
        Self {
            tick_tx,
            enabled: false,
            interval: Duration::from_secs(300),
            generation: 0,
            pending: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_due(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.due)
    }

    pub fn phase(&self, running: bool) -> SchedulerPhase {
        match (running, self.enabled) {
            (true, _) => SchedulerPhase::Running,
            (false, true) => SchedulerPhase::Idle,
            (false, false) => SchedulerPhase::Disabled,
        }
    }

    /// Drop whatever timer is pending, then arm a fresh one `interval` from
    /// now when enabled.
    pub fn configure(&mut self, enabled: bool, interval: Duration) {
        self.cancel();
        self.enabled = enabled;
        self.interval = interval.max(Duration::from_secs(1));
        if enabled {
            self.arm(Instant::now() + self.interval);
        }
        debug!(enabled, interval_secs = self.interval.as_secs(), "scheduler configured");
    }

    pub fn on_tick(&mut self, tick: Tick) -> TickDecision {
        if tick.generation != self.generation || self.pending.is_none() {
            return TickDecision::Stale;
        }
        self.pending = None;
        if !self.enabled {
            return TickDecision::Disabled;
        }
        self.arm(tick.fired_at + self.interval);
        TickDecision::Run
    }

    pub fn shutdown(&mut self) {
        self.cancel();
        self.enabled = false;
    }

    fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
        // Ticks already queued from the old timer become stale.
        self.generation += 1;
    }

    fn arm(&mut self, due: Instant) {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tick_tx.clone();
        let handle = tokio::spawn(async move {
            sleep_until(due).await;
            let _ = tx.send(Tick {
                generation,
                fired_at: Instant::now(),
            });
        });
        self.pending = Some(PendingTimer { handle, due });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
    }
}
