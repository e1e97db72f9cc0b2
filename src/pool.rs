//! # Worker Pool
//!
//! Handlers and callbacks never run on the proxy task; they run on one of
//! three lanes of dedicated OS threads so they are free to block:
//!
//! - **general**: command handlers (the default lane)
//! - **batch**: timer jobs and commands registered for batch work
//! - **reply**: request reply callbacks
//!
//! Lane sizes are hard caps; excess jobs queue FIFO rather than spawning. A
//! lane configured with zero threads falls back to the general lane, so a
//! single general worker is always enough for forward progress. A panicking
//! job is logged and its worker keeps serving.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::registry::Lane;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct LaneState {
    /// (queue, stopping)
    queue: Mutex<(VecDeque<Job>, bool)>,
    available: Condvar,
}

impl LaneState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new((VecDeque::new(), false)),
            available: Condvar::new(),
        })
    }
}

pub(crate) struct WorkerPool {
    lanes: [Arc<LaneState>; 3],
    lane_threads: [usize; 3],
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

fn lane_index(lane: Lane) -> usize {
    match lane {
        Lane::General => 0,
        Lane::Batch => 1,
        Lane::Reply => 2,
    }
}

impl WorkerPool {
    /// Spawn the worker threads. At least one general worker always exists.
    pub fn start(general: usize, batch: usize, reply: usize) -> Self {
        let lane_threads = [general.max(1), batch, reply];
        let lanes = [LaneState::new(), LaneState::new(), LaneState::new()];
        let names = ["general", "batch", "reply"];

        let mut handles = Vec::new();
        for (idx, &count) in lane_threads.iter().enumerate() {
            for n in 0..count {
                let lane = lanes[idx].clone();
                let handle = thread::Builder::new()
                    .name(format!("meshmq-{}-{}", names[idx], n))
                    .spawn(move || worker_loop(&lane))
                    .expect("failed to spawn worker thread");
                handles.push(handle);
            }
        }

        Self {
            lanes,
            lane_threads,
            handles: Mutex::new(handles),
        }
    }

    /// Queue a job on a lane, falling back to the general lane when the
    /// requested lane has no threads.
    pub fn dispatch(&self, lane: Lane, job: Job) {
        let mut idx = lane_index(lane);
        if self.lane_threads[idx] == 0 {
            idx = lane_index(Lane::General);
        }
        let lane = &self.lanes[idx];
        let mut guard = lane.queue.lock().expect("lane mutex poisoned");
        if guard.1 {
            debug!("pool stopping, dropping job");
            return;
        }
        guard.0.push_back(job);
        lane.available.notify_one();
    }

    /// Let every lane drain its queue, then join all workers. Idempotent.
    pub fn shutdown(&self) {
        for lane in &self.lanes {
            let mut guard = lane.queue.lock().expect("lane mutex poisoned");
            guard.1 = true;
            lane.available.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock().expect("handles mutex poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(lane: &LaneState) {
    loop {
        let job = {
            let mut guard = lane.queue.lock().expect("lane mutex poisoned");
            loop {
                if let Some(job) = guard.0.pop_front() {
                    break Some(job);
                }
                if guard.1 {
                    break None;
                }
                guard = lane.available.wait(guard).expect("lane mutex poisoned");
            }
        };
        match job {
            Some(job) => run_job(job),
            None => return,
        }
    }
}

fn run_job(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        let what = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        error!(panic = %what, "handler panicked; worker continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn dispatch_runs_jobs() {
        let pool = WorkerPool::start(2, 1, 1);
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.dispatch(Lane::General, Box::new(move || tx.send(i).unwrap()));
        }
        let mut seen = 0;
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            seen += 1;
        }
        assert_eq!(seen, 10);
        pool.shutdown();
    }

    #[test]
    fn empty_lane_falls_back_to_general() {
        let pool = WorkerPool::start(1, 0, 0);
        let (tx, rx) = mpsc::channel();
        for lane in [Lane::Batch, Lane::Reply] {
            let tx = tx.clone();
            pool.dispatch(lane, Box::new(move || tx.send(lane_index(lane)).unwrap()));
        }
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = WorkerPool::start(1, 0, 0);
        pool.dispatch(Lane::General, Box::new(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        pool.dispatch(Lane::General, Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.shutdown();
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let pool = WorkerPool::start(1, 0, 0);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.dispatch(Lane::General, Box::new(move || tx.send(i).unwrap()));
        }
        for expected in 0..20 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let pool = WorkerPool::start(1, 0, 0);
        let count = Arc::new(AtomicUsize::new(0));
        let (block_tx, block_rx) = mpsc::channel::<()>();
        // Hold the worker so later jobs are still queued when shutdown runs.
        pool.dispatch(
            Lane::General,
            Box::new(move || {
                let _ = block_rx.recv_timeout(Duration::from_secs(5));
            }),
        );
        for _ in 0..5 {
            let count = count.clone();
            pool.dispatch(
                Lane::General,
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        block_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::start(1, 0, 0);
        pool.shutdown();
        pool.shutdown();
    }
}
