//! # Periodic Timers
//!
//! Timers live on the proxy task, which derives its poll timeout from the
//! nearest deadline and hands due jobs to the batch worker lane. A timer
//! with `squelch` set never has two invocations in flight at once: while the
//! previous job is still running, due ticks are skipped rather than queued.
//!
//! Late timers never burst to catch up. A deadline that passed several
//! intervals ago fires once and is then rescheduled a full interval from
//! now.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle for a registered timer, used to cancel it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub type TimerJob = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    job: TimerJob,
    interval: Duration,
    next_fire: Instant,
    squelch: bool,
    /// Shared with the dispatched job wrapper; true while an invocation of
    /// this timer is queued or running.
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the job wrapper finishes, unwinds, or is
/// dropped unexecuted at shutdown.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub(crate) struct TimerWheel {
    entries: HashMap<u64, TimerEntry>,
}

impl TimerWheel {
    pub fn add(&mut self, id: TimerId, job: TimerJob, interval: Duration, squelch: bool) {
        self.entries.insert(
            id.0,
            TimerEntry {
                job,
                interval,
                next_fire: Instant::now() + interval,
                squelch,
                running: Arc::new(AtomicBool::new(false)),
            },
        );
    }

    /// Idempotent; unknown ids are ignored.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id.0);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.next_fire).min()
    }

    /// Collect jobs for every timer whose deadline has passed, advancing
    /// each by one interval from now. Squelched timers whose previous run is
    /// still in flight yield nothing this round.
    pub fn take_due(&mut self, now: Instant) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut due: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.next_fire > now {
                continue;
            }
            entry.next_fire = now + entry.interval;
            if entry.squelch {
                if entry.running.swap(true, Ordering::AcqRel) {
                    continue;
                }
                let guard = RunningGuard(entry.running.clone());
                let job = entry.job.clone();
                due.push(Box::new(move || {
                    let _running = guard;
                    job();
                }));
            } else {
                let job = entry.job.clone();
                due.push(Box::new(move || job()));
            }
        }
        due
    }
}
