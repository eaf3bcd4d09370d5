//! Job scheduler
//!
//! Maps the guest timer API onto the host loop:
//! `setTimeout`, `setImmediate`, `setInterval`, their `clear*` counterparts and
//! `queueMicrotask`. Every timer kind has its own id space and registry.
//! The scheduler is also the engine's job executor, so deferred engine jobs
//! share the loop's FIFO ordering with everything else.

use crate::args::ArgParser;
use crate::error::{GuestResult, RuntimeError};
use crate::guest::{Guest, GuestValue, ValueKind};
use crate::host_loop::{Cancellable, HostLoop};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Timer family; ids are only unique within one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Timeout,
    Immediate,
    Interval,
}

/// Live timer handles for one kind.
#[derive(Debug)]
struct TimerRegistry {
    next_id: Cell<u64>,
    handles: RefCell<HashMap<u64, Cancellable>>,
}

impl TimerRegistry {
    fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            handles: RefCell::new(HashMap::new()),
        }
    }

    fn allocate(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn insert(&self, id: u64, handle: Cancellable) {
        self.handles.borrow_mut().insert(id, handle);
    }

    fn remove(&self, id: u64) -> Option<Cancellable> {
        self.handles.borrow_mut().remove(&id)
    }

    fn contains(&self, id: u64) -> bool {
        self.handles.borrow().contains_key(&id)
    }

    fn len(&self) -> usize {
        self.handles.borrow().len()
    }
}

/// Timer and job scheduling on top of a [`HostLoop`].
pub struct JobScheduler<G: Guest> {
    guest: Weak<G>,
    host: HostLoop,
    timeouts: Rc<TimerRegistry>,
    immediates: Rc<TimerRegistry>,
    intervals: Rc<TimerRegistry>,
}

impl<G: Guest> JobScheduler<G> {
    pub fn new(guest: &Rc<G>, host: HostLoop) -> Self {
        Self {
            guest: Rc::downgrade(guest),
            host,
            timeouts: Rc::new(TimerRegistry::new()),
            immediates: Rc::new(TimerRegistry::new()),
            intervals: Rc::new(TimerRegistry::new()),
        }
    }

    fn registry(&self, kind: TimerKind) -> &Rc<TimerRegistry> {
        match kind {
            TimerKind::Timeout => &self.timeouts,
            TimerKind::Immediate => &self.immediates,
            TimerKind::Interval => &self.intervals,
        }
    }

    /// Run `callback` once after `delay`.
    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> u64 {
        let registry = &self.timeouts;
        let id = registry.allocate();
        let owner = Rc::downgrade(registry);
        let handle = self.host.post_delayed(delay, move || {
            if let Some(registry) = owner.upgrade() {
                registry.remove(id);
            }
            callback();
        });
        registry.insert(id, handle);
        tracing::debug!("Scheduled timeout {} in {:?}", id, delay);
        id
    }

    /// Run `callback` on the next turn of the loop.
    pub fn set_immediate(&self, callback: impl FnOnce() + 'static) -> u64 {
        let registry = &self.immediates;
        let id = registry.allocate();
        let owner = Rc::downgrade(registry);
        let handle = self.host.post_immediate(move || {
            if let Some(registry) = owner.upgrade() {
                registry.remove(id);
            }
            callback();
        });
        registry.insert(id, handle);
        id
    }

    /// Run `callback` every `delay` until cleared.
    pub fn set_interval(&self, delay: Duration, callback: impl Fn() + 'static) -> u64 {
        let id = self.intervals.allocate();
        arm_interval(&self.host, &self.intervals, id, delay, Rc::new(callback));
        tracing::debug!("Scheduled interval {} every {:?}", id, delay);
        id
    }

    /// Cancel a timer. Unknown or already-fired ids are ignored.
    pub fn clear(&self, kind: TimerKind, id: u64) {
        if let Some(handle) = self.registry(kind).remove(id) {
            handle.cancel();
            tracing::debug!("Cleared {:?} {}", kind, id);
        }
    }

    /// Timers of `kind` that are still registered.
    pub fn pending(&self, kind: TimerKind) -> usize {
        self.registry(kind).len()
    }

    pub fn is_active(&self, kind: TimerKind, id: u64) -> bool {
        self.registry(kind).contains(id)
    }

    /// Post a deferred job to the loop.
    pub fn queue_job(&self, job: impl FnOnce() + 'static) {
        self.host.post(job);
    }

    /// Call a guest callback, routing anything it throws to the unhandled sink.
    fn invoke(guest: &Weak<G>, host: &HostLoop, callback: &G::Value, args: &[G::Value]) {
        let Some(guest) = guest.upgrade() else {
            return;
        };
        if let Err(err) = guest.call(callback, &guest.undefined(), args) {
            let err = guest.describe(err);
            tracing::warn!("Timer callback error: {}", err);
            host.report_unhandled(&err);
        }
    }

    /// Schedule a guest callback. `callback` must be a function.
    pub fn schedule(
        &self,
        kind: TimerKind,
        delay: Duration,
        callback: G::Value,
        args: Vec<G::Value>,
    ) -> GuestResult<u64, G::Value> {
        if !callback.is_function() {
            return Err(RuntimeError::type_error("function", callback.kind().name()).into());
        }
        let guest = self.guest.clone();
        let host = self.host.clone();
        let id = match kind {
            TimerKind::Timeout => {
                self.set_timeout(delay, move || Self::invoke(&guest, &host, &callback, &args))
            }
            TimerKind::Immediate => {
                self.set_immediate(move || Self::invoke(&guest, &host, &callback, &args))
            }
            TimerKind::Interval => {
                self.set_interval(delay, move || Self::invoke(&guest, &host, &callback, &args))
            }
        };
        Ok(id)
    }

    /// Install the timer globals and register as the engine's job executor.
    pub fn install(self: &Rc<Self>, guest: &G) -> GuestResult<(), G::Value> {
        let global = guest.global();

        for (name, kind) in [("setTimeout", TimerKind::Timeout), ("setInterval", TimerKind::Interval)] {
            let scheduler = Rc::downgrade(self);
            guest.set_function(&global, name, move |guest, _this, args| {
                let scheduler = upgrade(&scheduler)?;
                let callback = callback_arg(args)?;
                let delay = delay_arg(guest, args.get(1));
                let extra = args.get(2..).map(<[_]>::to_vec).unwrap_or_default();
                let id = scheduler.schedule(kind, delay, callback, extra)?;
                Ok(guest.number(id as f64))
            })?;
        }

        let scheduler = Rc::downgrade(self);
        guest.set_function(&global, "setImmediate", move |guest, _this, args| {
            let scheduler = upgrade(&scheduler)?;
            let callback = callback_arg(args)?;
            let extra = args.get(1..).map(<[_]>::to_vec).unwrap_or_default();
            let id = scheduler.schedule(TimerKind::Immediate, Duration::ZERO, callback, extra)?;
            Ok(guest.number(id as f64))
        })?;

        for (name, kind) in [
            ("clearTimeout", TimerKind::Timeout),
            ("clearImmediate", TimerKind::Immediate),
            ("clearInterval", TimerKind::Interval),
        ] {
            let scheduler = Rc::downgrade(self);
            guest.set_function(&global, name, move |guest, _this, args| {
                let id = ArgParser::new(args)
                    .next(ValueKind::Number)
                    .and_then(|v| guest.as_number(v))
                    .filter(|n| n.is_finite() && *n >= 1.0);
                if let (Some(scheduler), Some(id)) = (scheduler.upgrade(), id) {
                    scheduler.clear(kind, id as u64);
                }
                Ok(guest.undefined())
            })?;
        }

        let scheduler = Rc::downgrade(self);
        guest.set_function(&global, "queueMicrotask", move |guest, _this, args| {
            let scheduler = upgrade(&scheduler)?;
            let callback = callback_arg(args)?;
            let owner = scheduler.guest.clone();
            let host = scheduler.host.clone();
            scheduler.queue_job(move || Self::invoke(&owner, &host, &callback, &[]));
            Ok(guest.undefined())
        })?;

        let host = self.host.clone();
        guest.set_job_executor(Rc::new(move |job| {
            host.post(job);
        }));
        Ok(())
    }
}

/// Re-arm an interval before its callback runs, so a callback that clears
/// its own interval cancels the tick just armed.
fn arm_interval(host: &HostLoop, registry: &Rc<TimerRegistry>, id: u64, delay: Duration, callback: Rc<dyn Fn()>) {
    let owner = Rc::downgrade(registry);
    let loop_handle = host.clone();
    let handle = host.post_delayed(delay, move || {
        let Some(registry) = owner.upgrade() else {
            return;
        };
        if !registry.contains(id) {
            return;
        }
        arm_interval(&loop_handle, &registry, id, delay, callback.clone());
        callback();
    });
    registry.insert(id, handle);
}

fn upgrade<G: Guest>(scheduler: &Weak<JobScheduler<G>>) -> GuestResult<Rc<JobScheduler<G>>, G::Value> {
    scheduler
        .upgrade()
        .ok_or_else(|| RuntimeError::internal("scheduler has been dropped").into())
}

fn callback_arg<V: GuestValue>(args: &[V]) -> GuestResult<V, V> {
    match args.first() {
        Some(callback) if callback.is_function() => Ok(callback.clone()),
        Some(other) => Err(RuntimeError::type_error("callback function", other.kind().name()).into()),
        None => Err(RuntimeError::type_error("callback function", "undefined").into()),
    }
}

/// Largest delay a timer accepts; anything above fires after 1 ms.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

/// Milliseconds from a guest value; negative, NaN and missing mean zero.
fn delay_arg<G: Guest>(guest: &G, value: Option<&G::Value>) -> Duration {
    let ms = value.and_then(|v| guest.as_number(v)).unwrap_or(0.0);
    delay_from_millis(ms)
}

fn delay_from_millis(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        Duration::ZERO
    } else if ms > MAX_DELAY_MS {
        tracing::warn!("Timer delay {} does not fit into a 32-bit signed integer, using 1 ms", ms);
        Duration::from_millis(1)
    } else {
        Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::ZERO)
    }
}
