//! Job queue for a worker's execution environment
//!
//! Boa hands every promise reaction, timer and generic job to the context's
//! `JobExecutor`. The worker loop keeps them in host-owned queues so the
//! environment decides when the engine runs:
//! - Promise jobs (microtasks) are drained first
//! - Timers (setTimeout/setInterval) fire once their deadline passes
//! - Generic jobs run one per turn
//! - Async jobs are dropped on arrival
//!
//! Errors escaping a job are never rethrown. They are handed to the
//! environment's [`ExceptionHook`], which records the first one so the next
//! caller of `evaluate`/`dispatch_event` can surface it.

use boa_engine::{
    Context, JsError, JsResult,
    job::{Job, JobExecutor, PromiseJob, TimeoutJob},
};
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

use super::describe_error;

/// Out-of-band observer for errors thrown by jobs.
///
/// Cloning shares the same slot. Once detached, further errors are dropped.
#[derive(Clone, Default)]
pub struct ExceptionHook {
    slot: Rc<RefCell<Option<String>>>,
    detached: Rc<Cell<bool>>,
}

impl ExceptionHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Keeps the earliest unsurfaced one.
    pub fn record(&self, message: String) {
        if self.detached.get() {
            return;
        }
        let mut slot = self.slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn take(&self) -> Option<String> {
        self.slot.borrow_mut().take()
    }

    pub fn detach(&self) {
        self.detached.set(true);
        self.slot.borrow_mut().take();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }
}

/// A timer entry in the priority queue
struct TimerEntry {
    /// When this timer should fire
    deadline: Instant,
    /// The job to execute when the timer fires
    job: TimeoutJob,
    /// Unique ID for ordering timers with same deadline
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Job queue owned by one execution environment.
pub struct WorkerEventLoop {
    /// Queue of promise jobs (microtasks) - processed first
    microtasks: RefCell<VecDeque<PromiseJob>>,
    /// Priority queue of timers (min-heap by deadline)
    timers: RefCell<BinaryHeap<TimerEntry>>,
    /// Generic jobs queue
    generic_jobs: RefCell<VecDeque<Job>>,
    /// Counter for unique timer IDs
    timer_counter: Cell<u64>,
    hook: ExceptionHook,
}

impl WorkerEventLoop {
    pub fn new(hook: ExceptionHook) -> Self {
        Self {
            microtasks: RefCell::new(VecDeque::with_capacity(64)),
            timers: RefCell::new(BinaryHeap::with_capacity(32)),
            generic_jobs: RefCell::new(VecDeque::with_capacity(16)),
            timer_counter: Cell::new(0),
            hook,
        }
    }

    /// Check if there's any work that can still run without host input
    pub fn has_pending_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.timers.borrow().is_empty()
            || !self.generic_jobs.borrow().is_empty()
    }

    pub fn has_ready_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.generic_jobs.borrow().is_empty()
            || self.time_until_next_timer() == Some(Duration::ZERO)
    }

    fn next_timer_id(&self) -> u64 {
        let id = self.timer_counter.get() + 1;
        self.timer_counter.set(id);
        id
    }

    /// Get time until next timer fires (for efficient sleeping)
    pub fn time_until_next_timer(&self) -> Option<Duration> {
        self.timers
            .borrow()
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    fn observe(&self, result: JsResult<impl Sized>, context: &mut Context) {
        if let Err(err) = result {
            self.report(err, context);
        }
    }

    fn report(&self, err: JsError, context: &mut Context) {
        let message = describe_error(&err, context);
        self.hook.record(message);
    }

    /// Run every queued microtask, including those queued while draining.
    pub fn run_microtasks(&self, context: &mut Context) {
        loop {
            let next = self.microtasks.borrow_mut().pop_front();
            let Some(job) = next else { break };
            let result = job.call(context);
            self.observe(result, context);
        }
    }

    /// Fire every timer whose deadline has passed, draining microtasks after
    /// each callback.
    fn run_due_timers(&self, context: &mut Context) {
        let now = Instant::now();
        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            if entry.job.is_cancelled() {
                continue;
            }
            let result = entry.job.call(context);
            self.observe(result, context);
            self.run_microtasks(context);
        }
    }

    /// Run one turn: microtasks, due timers, then one generic job.
    /// Returns true if there is still ready work.
    pub fn run_ready(&self, context: &mut Context) -> bool {
        self.run_microtasks(context);
        self.run_due_timers(context);

        let generic_job = self.generic_jobs.borrow_mut().pop_front();
        if let Some(job) = generic_job {
            match job {
                Job::PromiseJob(pj) => {
                    let result = pj.call(context);
                    self.observe(result, context);
                }
                Job::TimeoutJob(tj) => {
                    let result = tj.call(context);
                    self.observe(result, context);
                }
                Job::GenericJob(gj) => {
                    let result = gj.call(context);
                    self.observe(result, context);
                }
                _ => {}
            }
            self.run_microtasks(context);
        }

        self.has_ready_work()
    }

    /// Drop everything still queued. Used on environment teardown.
    pub fn clear(&self) {
        self.microtasks.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        self.generic_jobs.borrow_mut().clear();
    }
}

impl JobExecutor for WorkerEventLoop {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        if self.hook.is_detached() {
            return;
        }
        match job {
            Job::PromiseJob(promise_job) => {
                self.microtasks.borrow_mut().push_back(promise_job);
            }
            Job::TimeoutJob(timeout_job) => {
                let timeout_ms = timeout_job.timeout().as_millis() as u64;
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                let id = self.next_timer_id();
                self.timers.borrow_mut().push(TimerEntry {
                    deadline,
                    job: timeout_job,
                    id,
                });
            }
            Job::AsyncJob(_) => {
                // Nothing in the worker surface polls futures.
                tracing::debug!("Dropping async job enqueued in a worker environment");
            }
            other => {
                self.generic_jobs.borrow_mut().push_back(other);
            }
        }
    }

    fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
        while self.run_ready(context) {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::{JsValue, job::NativeAsyncJob};

    #[test]
    fn test_event_loop_creation() {
        let event_loop = WorkerEventLoop::new(ExceptionHook::new());
        assert!(!event_loop.has_pending_work());
        assert!(event_loop.time_until_next_timer().is_none());
    }

    #[test]
    fn test_async_jobs_are_dropped() {
        let event_loop = Rc::new(WorkerEventLoop::new(ExceptionHook::new()));
        let mut context = Context::default();
        let captured = Rc::new(());
        let held = captured.clone();
        let job = NativeAsyncJob::new(async move |_context: &RefCell<&mut Context>| {
            let _held = held;
            Ok(JsValue::undefined())
        });

        event_loop.clone().enqueue_job(Job::AsyncJob(job), &mut context);
        assert_eq!(Rc::strong_count(&captured), 1);
        assert!(!event_loop.has_pending_work());
    }

    #[test]
    fn test_hook_keeps_first_error() {
        let hook = ExceptionHook::new();
        hook.record("first".to_string());
        hook.record("second".to_string());
        assert!(hook.is_pending());
        assert_eq!(hook.take().as_deref(), Some("first"));
        assert!(!hook.is_pending());
    }

    #[test]
    fn test_detached_hook_ignores_errors() {
        let hook = ExceptionHook::new();
        let observer = hook.clone();
        hook.detach();
        observer.record("late".to_string());
        assert!(!hook.is_pending());
    }
}
