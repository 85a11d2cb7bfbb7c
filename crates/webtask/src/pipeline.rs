//! Serial job queues
//!
//! A [`SerialQueue`] runs boxed jobs strictly in the order they were
//! enqueued, never more than one at a time. A queue created with
//! [`SerialQueue::held`] accepts jobs but does not run anything until
//! [`SerialQueue::release`] is called; this is the gate each task's response
//! pipeline waits behind until its transfer resolves.
//!
//! A queue can also hold a keeper value (see [`SerialQueue::retain`]) that it
//! drops once it is released and idle, so work queued for an owner nobody
//! else references still runs.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::executor::Executor;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Value kept alive by a queue until it has nothing left to run
pub type Keeper = Box<dyn Any + Send>;

struct QueueState {
    jobs: VecDeque<Job>,
    released: bool,
    running: bool,
    enqueued: u64,
    executed: u64,
    keeper: Option<Keeper>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.released && !self.running && self.jobs.is_empty()
    }
}

pub struct SerialQueue {
    label: String,
    executor: Executor,
    state: Mutex<QueueState>,
    progress: Condvar,
}

impl SerialQueue {
    /// Create a queue that holds jobs until released
    pub fn held(label: impl Into<String>, executor: Executor) -> Arc<Self> {
        Arc::new(Self::with_state(label.into(), executor, false))
    }

    /// Create a queue that runs jobs as soon as they arrive
    pub fn released(label: impl Into<String>, executor: Executor) -> Arc<Self> {
        Arc::new(Self::with_state(label.into(), executor, true))
    }

    fn with_state(label: String, executor: Executor, released: bool) -> Self {
        Self {
            label,
            executor,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                released,
                running: false,
                enqueued: 0,
                executed: 0,
                keeper: None,
            }),
            progress: Condvar::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append a job. Returns its ticket: the queue has run this job once
    /// `executed() >= ticket`.
    pub fn enqueue(self: &Arc<Self>, job: Job) -> u64 {
        let (ticket, start_worker) = {
            let mut state = self.state.lock();
            state.jobs.push_back(job);
            state.enqueued += 1;
            let start_worker = state.released && !state.running;
            if start_worker {
                state.running = true;
            }
            (state.enqueued, start_worker)
        };
        if start_worker {
            self.start_worker();
        }
        ticket
    }

    /// Open the gate. Only the first call has any effect.
    pub fn release(self: &Arc<Self>) -> bool {
        let (start_worker, _dropped) = {
            let mut state = self.state.lock();
            if state.released {
                return false;
            }
            state.released = true;
            let start_worker = !state.running && !state.jobs.is_empty();
            if start_worker {
                state.running = true;
            }
            // Waiters on an empty queue are satisfied by the release itself
            self.progress.notify_all();
            let dropped = if state.is_idle() { state.keeper.take() } else { None };
            (start_worker, dropped)
        };
        tracing::trace!(queue = %self.label, "Queue released");
        if start_worker {
            self.start_worker();
        }
        true
    }

    /// Keep `keeper` alive until the queue is released and has run every
    /// job. Replaces any keeper already held. Dropped at once if the queue is
    /// already idle.
    pub fn retain(&self, keeper: Keeper) {
        let _dropped = {
            let mut state = self.state.lock();
            if state.is_idle() {
                Some(keeper)
            } else {
                state.keeper.replace(keeper)
            }
        };
    }

    pub fn is_retaining(&self) -> bool {
        self.state.lock().keeper.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn enqueued(&self) -> u64 {
        self.state.lock().enqueued
    }

    pub fn executed(&self) -> u64 {
        self.state.lock().executed
    }

    /// Released and every enqueued job has run
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.released && state.executed >= state.enqueued
    }

    /// Block until every job enqueued so far has run. `None` waits without
    /// bound. Returns false if the timeout elapsed first.
    pub fn drain(&self, timeout: Option<Duration>) -> bool {
        let ticket = self.enqueued();
        self.wait_for(ticket, timeout)
    }

    /// Block until the job with `ticket` (and everything before it) has run
    pub fn wait_for(&self, ticket: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        while !(state.released && state.executed >= ticket) {
            match deadline {
                None => self.progress.wait(&mut state),
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        return state.released && state.executed >= ticket;
                    }
                }
            }
        }
        true
    }

    fn start_worker(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        self.executor.spawn_blocking(move || queue.run());
    }

    fn run(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                match state.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        self.progress.notify_all();
                        let keeper = state.keeper.take();
                        drop(state);
                        // May release the last reference to the queue's owner
                        drop(keeper);
                        return;
                    }
                }
            };

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!(queue = %self.label, "Queued job panicked");
            }

            let mut state = self.state.lock();
            state.executed += 1;
            self.progress.notify_all();
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .field("released", &state.released)
            .field("enqueued", &state.enqueued)
            .field("executed", &state.executed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor() -> Executor {
        Executor::owned("webtask-pipeline-test").unwrap()
    }

    #[test]
    fn test_held_queue_runs_nothing_until_released() {
        let queue = SerialQueue::held("test", executor());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            queue.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(!queue.drain(Some(Duration::from_millis(50))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(queue.release());
        assert!(!queue.release());
        assert!(queue.drain(Some(Duration::from_secs(5))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_jobs_run_in_order_across_release() {
        let queue = SerialQueue::held("order", executor());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            queue.enqueue(Box::new(move || seen.lock().push(i)));
        }
        queue.release();
        for i in 5..10 {
            let seen = Arc::clone(&seen);
            queue.enqueue(Box::new(move || {
                std::thread::sleep(Duration::from_millis(1));
                seen.lock().push(i)
            }));
        }

        assert!(queue.drain(Some(Duration::from_secs(5))));
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_jobs_never_overlap() {
        let queue = SerialQueue::released("serial", executor());
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            queue.enqueue(Box::new(move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(1));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        assert!(queue.drain(Some(Duration::from_secs(5))));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_queue_drains_on_release() {
        let queue = SerialQueue::held("empty", executor());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.drain(None))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_panicking_job_does_not_wedge_queue() {
        let queue = SerialQueue::released("panic", executor());
        let ran = Arc::new(AtomicUsize::new(0));
        queue.enqueue(Box::new(|| panic!("handler blew up")));
        let after = Arc::clone(&ran);
        queue.enqueue(Box::new(move || {
            after.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(queue.drain(Some(Duration::from_secs(5))));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.executed(), 2);
    }

    #[test]
    fn test_keeper_is_dropped_once_queue_drains() {
        let queue = SerialQueue::held("keeper", executor());
        let owner = Arc::new(());
        queue.retain(Box::new(Arc::clone(&owner)));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = Arc::clone(&gate);
            queue.enqueue(Box::new(move || {
                let (open, cvar) = &*gate;
                let mut open = open.lock();
                while !*open {
                    cvar.wait(&mut open);
                }
            }));
        }

        assert_eq!(Arc::strong_count(&owner), 2);
        queue.release();
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.is_retaining());
        assert_eq!(Arc::strong_count(&owner), 2);

        *gate.0.lock() = true;
        gate.1.notify_all();
        assert!(queue.drain(Some(Duration::from_secs(5))));
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_retaining() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!queue.is_retaining());
        assert_eq!(Arc::strong_count(&owner), 1);
    }

    #[test]
    fn test_keeper_on_idle_queue_is_dropped_at_once() {
        let queue = SerialQueue::released("idle", executor());
        let owner = Arc::new(());
        queue.retain(Box::new(Arc::clone(&owner)));
        assert!(!queue.is_retaining());
        assert_eq!(Arc::strong_count(&owner), 1);

        let held = SerialQueue::held("held", executor());
        held.retain(Box::new(Arc::clone(&owner)));
        assert!(held.is_retaining());
        held.release();
        assert_eq!(Arc::strong_count(&owner), 1);
    }
}
