//! Once-use retention: each worker runs one real task, then goes away.
//!
//! The rules, enforced per worker by a [`RetentionMonitor`]:
//!
//! * Accepting a non-trivial task marks the worker consumed; it stops
//!   accepting further tasks from that moment, before the task even
//!   finishes.
//! * Termination is requested only once every in-progress task has
//!   finished, and it is requested exactly once.
//! * A worker that never receives a task is reaped after an idle timeout.
//!
//! Trivial tasks (see [`TaskProfile::is_trivial`]) do not consume the
//! worker's single use.

use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;

/// Traits of an accepted task that decide whether it consumes the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProfile {
    /// Bookkeeping work too small to count as using the worker.
    pub flyweight: bool,
    /// The task declares it will resume on this same worker.
    pub continuable: bool,
    /// The scheduler keeps the slot claimed for an imminent successor.
    pub slot_remains_open: bool,
}

impl TaskProfile {
    /// Whether accepting this task leaves the worker reusable.
    pub fn is_trivial(self) -> bool {
        self.flyweight || self.continuable || self.slot_remains_open
    }

    /// An ordinary task: accepting it consumes the worker.
    pub fn consuming() -> Self {
        Self::default()
    }
}

/// Retention policy: one real task, plus an idle timeout for workers that
/// never get one.
///
/// Equality and hashing cover configuration only; live counters sit on the
/// per-worker [`RetentionMonitor`], never on the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OnceRetention {
    /// Minutes a task-less worker survives before being reaped.
    pub idle_minutes: u32,
}

impl OnceRetention {
    pub fn new(idle_minutes: u32) -> Self {
        Self { idle_minutes }
    }
}

impl Default for OnceRetention {
    fn default() -> Self {
        Self { idle_minutes: 10 }
    }
}

/// Request to tear a worker down, emitted by its monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRequest {
    pub worker: String,
    pub reason: &'static str,
}

#[derive(Debug)]
struct RetentionState {
    idle_since: Instant,
    in_progress: u32,
    terminate_once_done: bool,
    termination_sent: bool,
}

/// Per-worker retention bookkeeping.
///
/// All transitions happen under one mutex; the termination request is sent
/// after the lock is released so a slow channel never blocks task
/// accounting.
#[derive(Debug)]
pub struct RetentionMonitor {
    worker: String,
    retention: OnceRetention,
    state: Mutex<RetentionState>,
    terminate_tx: mpsc::UnboundedSender<TerminationRequest>,
}

impl RetentionMonitor {
    pub fn new(
        worker: impl Into<String>,
        retention: OnceRetention,
        terminate_tx: mpsc::UnboundedSender<TerminationRequest>,
    ) -> Self {
        Self {
            worker: worker.into(),
            retention,
            state: Mutex::new(RetentionState {
                idle_since: Instant::now(),
                in_progress: 0,
                terminate_once_done: false,
                termination_sent: false,
            }),
            terminate_tx,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RetentionState> {
        self.state.lock().expect("retention mutex poisoned")
    }

    /// Whether the scheduler may hand this worker another task. False as
    /// soon as a consuming task is accepted, before teardown completes.
    pub fn is_accepting_tasks(&self) -> bool {
        let s = self.state();
        !s.terminate_once_done && !s.termination_sent
    }

    /// Whether nothing is currently running on the worker.
    pub fn is_idle(&self) -> bool {
        self.state().in_progress == 0
    }

    /// Record a task starting on the worker. A non-trivial task consumes
    /// the worker's single use on acceptance.
    pub fn task_accepted(&self, profile: TaskProfile) {
        let mut s = self.state();
        s.in_progress += 1;
        if !profile.is_trivial() {
            s.terminate_once_done = true;
        }
    }

    /// Record a task finishing cleanly.
    pub fn task_completed(&self) {
        self.finish_task();
    }

    /// Record a task finishing with problems. Same accounting as a clean
    /// completion; the worker is torn down either way.
    pub fn task_completed_with_problems(&self) {
        self.finish_task();
    }

    fn finish_task(&self) {
        let mut send = false;
        {
            let mut s = self.state();
            match s.in_progress.checked_sub(1) {
                Some(n) => s.in_progress = n,
                None => {
                    // Completion without a matching accept is a caller bug;
                    // clamp so the counter cannot wedge the worker open.
                    tracing::error!(worker = %self.worker, "task completion without matching accept");
                }
            }
            if s.in_progress == 0 {
                s.idle_since = Instant::now();
                if s.terminate_once_done && !s.termination_sent {
                    s.termination_sent = true;
                    send = true;
                }
            }
        }
        if send {
            self.send_termination("single use consumed");
        }
    }

    /// Periodic idle check. Returns the number of minutes after which the
    /// caller should check again; when the idle limit has passed, requests
    /// termination (once) and asks to be re-checked in a minute.
    pub fn check_idle(&self) -> u32 {
        self.check_idle_at(Instant::now())
    }

    fn check_idle_at(&self, now: Instant) -> u32 {
        let mut send = false;
        let minutes = {
            let mut s = self.state();
            if s.in_progress > 0 {
                s.idle_since = now;
                self.retention.idle_minutes.max(1)
            } else {
                let idle_ms = now.duration_since(s.idle_since).as_millis() as u64;
                let limit_ms = u64::from(self.retention.idle_minutes) * 60_000;
                if idle_ms >= limit_ms {
                    if !s.termination_sent {
                        s.termination_sent = true;
                        send = true;
                    }
                    1
                } else {
                    // Ceiling in minutes, never zero while under the limit.
                    (((limit_ms - idle_ms) + 59_999) / 60_000) as u32
                }
            }
        };
        if send {
            self.send_termination("idle timeout");
        }
        minutes
    }

    fn send_termination(&self, reason: &'static str) {
        tracing::info!(worker = %self.worker, reason, "requesting worker termination");
        if self
            .terminate_tx
            .send(TerminationRequest {
                worker: self.worker.clone(),
                reason,
            })
            .is_err()
        {
            tracing::warn!(worker = %self.worker, "termination channel closed; worker will be swept");
        }
    }
}
