//! Host event loop
//!
//! Single-threaded cooperative loop layered on a tokio `LocalSet`. Posted
//! tasks run in FIFO order, delayed tasks run once their deadline passes, and
//! immediates run on the next turn after both. Native I/O runs as local
//! futures spawned through [`HostLoop::spawn`]; the loop stays alive while
//! any of them is in flight.
//!
//! Each turn runs, in order:
//! 1. tasks posted with [`HostLoop::post`] (snapshot of the queue)
//! 2. delayed tasks whose deadline has passed
//! 3. immediates queued before the turn started

use crate::error::RuntimeError;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Unit of work run on the loop thread.
pub type Task = Box<dyn FnOnce()>;

/// Receiver for errors nobody else handled.
pub type UnhandledHandler = Rc<dyn Fn(&RuntimeError)>;

struct LoopInner {
    /// Next task id (shared by all queues)
    next_id: Cell<u64>,
    /// Pending task bodies; a queued id without a body was cancelled
    tasks: RefCell<HashMap<u64, Task>>,
    /// FIFO of posted tasks
    ready: RefCell<VecDeque<u64>>,
    /// FIFO of immediates
    immediates: RefCell<VecDeque<u64>>,
    /// Min-heap of (deadline, id); ties break by post order
    timers: RefCell<BinaryHeap<Reverse<(Instant, u64)>>>,
    /// Spawned futures still running
    in_flight: Cell<usize>,
    /// Wakes `run` when new work arrives
    wakeup: Notify,
    unhandled: RefCell<Option<UnhandledHandler>>,
}

/// Handle to the host loop. Cheap to clone; all clones share one loop.
#[derive(Clone)]
pub struct HostLoop {
    inner: Rc<LoopInner>,
}

/// Cancellation token for a posted task.
#[derive(Clone, Debug)]
pub struct Cancellable {
    id: u64,
    owner: Weak<LoopInner>,
}

impl Cancellable {
    /// Drop the task if it has not run yet. Returns `true` if it was removed.
    pub fn cancel(&self) -> bool {
        match self.owner.upgrade() {
            Some(inner) => inner.tasks.borrow_mut().remove(&self.id).is_some(),
            None => false,
        }
    }

    /// Whether the task is still waiting to run.
    pub fn is_pending(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|inner| inner.tasks.borrow().contains_key(&self.id))
    }
}

/// Decrements the in-flight count when a spawned future finishes or is aborted.
struct InFlight(Rc<LoopInner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.set(self.0.in_flight.get().saturating_sub(1));
        self.0.wakeup.notify_one();
    }
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLoop {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LoopInner {
                next_id: Cell::new(1),
                tasks: RefCell::new(HashMap::new()),
                ready: RefCell::new(VecDeque::new()),
                immediates: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                in_flight: Cell::new(0),
                wakeup: Notify::new(),
                unhandled: RefCell::new(None),
            }),
        }
    }

    fn register(&self, task: Task) -> Cancellable {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.tasks.borrow_mut().insert(id, task);
        self.inner.wakeup.notify_one();
        Cancellable {
            id,
            owner: Rc::downgrade(&self.inner),
        }
    }

    /// Run `task` on the loop after everything posted before it.
    pub fn post(&self, task: impl FnOnce() + 'static) -> Cancellable {
        let handle = self.register(Box::new(task));
        self.inner.ready.borrow_mut().push_back(handle.id);
        handle
    }

    /// Run `task` once `delay` has elapsed.
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + 'static) -> Cancellable {
        let handle = self.register(Box::new(task));
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or_else(|| far_future(now));
        self.inner.timers.borrow_mut().push(Reverse((deadline, handle.id)));
        handle
    }

    /// Run `task` on the next turn of the loop.
    pub fn post_immediate(&self, task: impl FnOnce() + 'static) -> Cancellable {
        let handle = self.register(Box::new(task));
        self.inner.immediates.borrow_mut().push_back(handle.id);
        handle
    }

    /// Run a cooperative future on the loop thread.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.in_flight.set(self.inner.in_flight.get() + 1);
        let guard = InFlight(self.inner.clone());
        tokio::task::spawn_local(async move {
            let _guard = guard;
            future.await;
        })
    }

    /// Install the receiver for unhandled errors (guest callback exceptions,
    /// `error` events with no listener).
    pub fn set_unhandled_handler(&self, handler: impl Fn(&RuntimeError) + 'static) {
        *self.inner.unhandled.borrow_mut() = Some(Rc::new(handler));
    }

    /// Report an error that has no other place to go.
    pub fn report_unhandled(&self, err: &RuntimeError) {
        let handler = self.inner.unhandled.borrow().clone();
        match handler {
            Some(handler) => handler(err),
            None => tracing::error!("Unhandled error: {}", err),
        }
    }

    /// Number of tasks posted but not yet run or cancelled.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Number of spawned futures still running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.get()
    }

    /// No task is waiting and no spawned future is running.
    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0 && self.in_flight() == 0
    }

    fn take_task(&self, id: u64) -> Option<Task> {
        self.inner.tasks.borrow_mut().remove(&id)
    }

    fn run_ready(&self) -> usize {
        let count = self.inner.ready.borrow().len();
        let mut ran = 0;
        for _ in 0..count {
            let Some(id) = self.inner.ready.borrow_mut().pop_front() else {
                break;
            };
            if let Some(task) = self.take_task(id) {
                task();
                ran += 1;
            }
        }
        ran
    }

    fn run_due_timers(&self) -> usize {
        let now = Instant::now();
        // Collect first: a timer re-armed with zero delay waits for the next turn.
        let mut due = Vec::new();
        {
            let mut timers = self.inner.timers.borrow_mut();
            while let Some(Reverse((deadline, _))) = timers.peek() {
                if *deadline > now {
                    break;
                }
                if let Some(Reverse((_, id))) = timers.pop() {
                    due.push(id);
                }
            }
        }
        let mut ran = 0;
        for id in due {
            if let Some(task) = self.take_task(id) {
                task();
                ran += 1;
            }
        }
        ran
    }

    fn run_immediates(&self) -> usize {
        let batch: Vec<u64> = self.inner.immediates.borrow_mut().drain(..).collect();
        let mut ran = 0;
        for id in batch {
            if let Some(task) = self.take_task(id) {
                task();
                ran += 1;
            }
        }
        ran
    }

    fn has_queued_work(&self) -> bool {
        let tasks = self.inner.tasks.borrow();
        self.inner.ready.borrow().iter().any(|id| tasks.contains_key(id))
            || self.inner.immediates.borrow().iter().any(|id| tasks.contains_key(id))
    }

    /// Earliest live timer deadline, discarding cancelled entries.
    fn next_deadline(&self) -> Option<Instant> {
        let tasks = self.inner.tasks.borrow();
        let mut timers = self.inner.timers.borrow_mut();
        while let Some(Reverse((deadline, id))) = timers.peek() {
            if tasks.contains_key(id) {
                return Some(*deadline);
            }
            timers.pop();
        }
        None
    }

    /// Drive the loop until there is nothing left to do.
    ///
    /// Must be awaited inside a `LocalSet` so spawned futures make progress.
    pub async fn run(&self) {
        loop {
            let ran = self.run_ready() + self.run_due_timers() + self.run_immediates();
            tracing::trace!(ran, pending = self.pending_tasks(), in_flight = self.in_flight(), "loop turn");

            if self.is_idle() {
                break;
            }

            if ran > 0 || self.has_queued_work() {
                // Let spawned futures observe what this turn produced.
                tokio::task::yield_now().await;
                continue;
            }

            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.inner.wakeup.notified() => {}
                    }
                }
                None => self.inner.wakeup.notified().await,
            }
        }
    }
}

/// A deadline that never arrives in practice; used when `now + delay`
/// does not fit into an `Instant`.
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| {
            let sink = sink.clone();
            Box::new(move || sink.borrow_mut().push(name)) as Box<dyn FnOnce()>
        };
        (log, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_order() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let (log, make) = recorder();
                host.post_immediate(make("immediate"));
                host.post_delayed(Duration::from_millis(0), make("timer"));
                host.post(make("first"));
                host.post(make("second"));
                host.run().await;
                assert_eq!(*log.borrow(), vec!["first", "second", "timer", "immediate"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_by_deadline() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let (log, make) = recorder();
                host.post_delayed(Duration::from_millis(30), make("late"));
                host.post_delayed(Duration::from_millis(10), make("early"));
                host.post_delayed(Duration::from_millis(10), make("early-second"));
                host.run().await;
                assert_eq!(*log.borrow(), vec!["early", "early-second", "late"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let (log, make) = recorder();
                let handle = host.post_delayed(Duration::from_secs(5), make("never"));
                assert!(handle.is_pending());
                assert!(handle.cancel());
                assert!(!handle.cancel());
                host.run().await;
                assert!(log.borrow().is_empty());
                assert!(host.is_idle());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_delay_saturates() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let (log, make) = recorder();
                let handle = host.post_delayed(Duration::MAX, make("never"));
                assert!(handle.is_pending());
                host.post(make("now"));
                assert!(handle.cancel());
                host.run().await;
                assert_eq!(*log.borrow(), vec!["now"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_future_keeps_loop_alive() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let (log, make) = recorder();
                let poster = host.clone();
                host.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    poster.post(make("from-future"));
                });
                host.run().await;
                assert_eq!(*log.borrow(), vec!["from-future"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_unhandled_handler() {
        let host = HostLoop::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        host.set_unhandled_handler(move |err| sink.borrow_mut().push(err.to_string()));
        host.report_unhandled(&RuntimeError::internal("boom"));
        assert_eq!(*seen.borrow(), vec!["Internal error: boom".to_string()]);
    }
}
