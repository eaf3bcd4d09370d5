//! Event listener registry
//!
//! Maps event names to ordered listener lists. `once` listeners are removed
//! before they are invoked, and emission walks a snapshot so listeners that
//! add or remove listeners mid-emit do not disturb the current pass.

use crate::error::{GuestResult, RuntimeError};
use crate::guest::{Guest, GuestValue};
use crate::host_loop::HostLoop;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Default listener count above which a leak warning is logged
pub const DEFAULT_MAX_LISTENERS: usize = 10;

#[derive(Debug, Clone)]
struct Listener<L> {
    id: u64,
    once: bool,
    handler: L,
}

/// Ordered listeners keyed by event name.
#[derive(Debug)]
pub struct EventRegistry<L> {
    listeners: HashMap<String, Vec<Listener<L>>>,
    next_id: u64,
    max_listeners: usize,
}

impl<L> Default for EventRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> EventRegistry<L> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 1,
            max_listeners: DEFAULT_MAX_LISTENERS,
        }
    }

    fn add(&mut self, event: &str, handler: L, once: bool, prepend: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let max = self.max_listeners;
        let list = self.listeners.entry(event.to_string()).or_default();
        let listener = Listener { id, once, handler };
        if prepend {
            list.insert(0, listener);
        } else {
            list.push(listener);
        }
        if max > 0 && list.len() == max + 1 {
            tracing::warn!(
                "Possible EventEmitter memory leak detected. {} '{}' listeners added",
                list.len(),
                event
            );
        }
        id
    }

    /// Append a listener. Returns its id.
    pub fn on(&mut self, event: &str, handler: L) -> u64 {
        self.add(event, handler, false, false)
    }

    /// Append a listener that is removed after its first call.
    pub fn once(&mut self, event: &str, handler: L) -> u64 {
        self.add(event, handler, true, false)
    }

    /// Insert a listener at the front of the list.
    pub fn prepend(&mut self, event: &str, handler: L, once: bool) -> u64 {
        self.add(event, handler, once, true)
    }

    /// Remove a listener by id.
    pub fn off(&mut self, event: &str, id: u64) -> bool {
        self.remove_where(event, |l| l.id == id)
    }

    /// Remove the most recently added listener matching `pred`.
    pub fn off_matching(&mut self, event: &str, pred: impl Fn(&L) -> bool) -> bool {
        self.remove_where(event, |l| pred(&l.handler))
    }

    fn remove_where(&mut self, event: &str, pred: impl Fn(&Listener<L>) -> bool) -> bool {
        let Some(list) = self.listeners.get_mut(event) else {
            return false;
        };
        let removed = match list.iter().rposition(pred) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        };
        if list.is_empty() {
            self.listeners.remove(event);
        }
        removed
    }

    /// Remove all listeners for `event`, or for every event.
    pub fn remove_all(&mut self, event: Option<&str>) {
        match event {
            Some(event) => {
                self.listeners.remove(event);
            }
            None => self.listeners.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, Vec::len)
    }

    pub fn event_names(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    pub fn set_max_listeners(&mut self, max: usize) {
        self.max_listeners = max;
    }
}

impl<L: Clone> EventRegistry<L> {
    /// Snapshot the handlers for one emission, dropping `once` listeners.
    pub fn take_for_emit(&mut self, event: &str) -> Vec<L> {
        let Some(list) = self.listeners.get_mut(event) else {
            return Vec::new();
        };
        let snapshot = list.iter().map(|l| l.handler.clone()).collect();
        list.retain(|l| !l.once);
        if list.is_empty() {
            self.listeners.remove(event);
        }
        snapshot
    }
}

/// Host-implemented event emitter exposed to guest code.
///
/// Backs `on`/`once`/`off`/`emit` on objects created by the host (servers,
/// datagram sockets) with an [`EventRegistry`] of guest functions.
pub struct Emitter<G: Guest> {
    guest: Weak<G>,
    host: HostLoop,
    registry: RefCell<EventRegistry<G::Value>>,
}

impl<G: Guest> Emitter<G> {
    pub fn new(guest: &Rc<G>, host: HostLoop) -> Rc<Self> {
        Rc::new(Self {
            guest: Rc::downgrade(guest),
            host,
            registry: RefCell::new(EventRegistry::new()),
        })
    }

    pub fn on(&self, event: &str, listener: G::Value) -> u64 {
        self.registry.borrow_mut().on(event, listener)
    }

    pub fn once(&self, event: &str, listener: G::Value) -> u64 {
        self.registry.borrow_mut().once(event, listener)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry.borrow().listener_count(event)
    }

    /// Call every listener for `event` with `this` bound to `target`.
    ///
    /// Exceptions from listeners go to the unhandled sink. An `error` event
    /// with no listener is reported there too. Returns whether any listener ran.
    pub fn emit(&self, target: &G::Value, event: &str, args: &[G::Value]) -> bool {
        let Some(guest) = self.guest.upgrade() else {
            return false;
        };
        let listeners = self.registry.borrow_mut().take_for_emit(event);
        if listeners.is_empty() {
            if event == "error" {
                let err = match args.first() {
                    Some(value) => guest.describe(crate::error::GuestError::Thrown(value.clone())),
                    None => RuntimeError::Uncaught("Unhandled 'error' event".to_string()),
                };
                self.host.report_unhandled(&err);
            }
            return false;
        }
        for listener in &listeners {
            if let Err(err) = guest.call(listener, target, args) {
                let err = guest.describe(err);
                tracing::warn!("Listener for '{}' threw: {}", event, err);
                self.host.report_unhandled(&err);
            }
        }
        true
    }

    /// Emit from a loop task so the current guest call finishes first.
    pub fn emit_later(self: &Rc<Self>, target: &G::Value, event: &str, args: Vec<G::Value>) {
        let emitter = self.clone();
        let target = target.clone();
        let event = event.to_string();
        self.host.post(move || {
            emitter.emit(&target, &event, &args);
        });
    }

    /// Attach `on`, `once`, `prependListener`, `off`, `removeListener`,
    /// `removeAllListeners`, `listenerCount` and `emit` to `target`.
    pub fn install(self: &Rc<Self>, guest: &G, target: &G::Value) -> GuestResult<(), G::Value> {
        for (name, once, prepend) in [
            ("on", false, false),
            ("addListener", false, false),
            ("once", true, false),
            ("prependListener", false, true),
        ] {
            let emitter = Rc::downgrade(self);
            guest.set_function(target, name, move |guest, this, args| {
                let (event, listener) = event_and_listener(guest, args)?;
                if let Some(emitter) = emitter.upgrade() {
                    emitter.registry.borrow_mut().add(&event, listener, once, prepend);
                }
                Ok(this.clone())
            })?;
        }

        for name in ["off", "removeListener"] {
            let emitter = Rc::downgrade(self);
            guest.set_function(target, name, move |guest, this, args| {
                let (event, listener) = event_and_listener(guest, args)?;
                if let Some(emitter) = emitter.upgrade() {
                    emitter
                        .registry
                        .borrow_mut()
                        .off_matching(&event, |l| l.same(&listener));
                }
                Ok(this.clone())
            })?;
        }

        let emitter = Rc::downgrade(self);
        guest.set_function(target, "removeAllListeners", move |guest, this, args| {
            let event = args.first().and_then(|v| guest.as_string(v));
            if let Some(emitter) = emitter.upgrade() {
                emitter.registry.borrow_mut().remove_all(event.as_deref());
            }
            Ok(this.clone())
        })?;

        let emitter = Rc::downgrade(self);
        guest.set_function(target, "listenerCount", move |guest, _this, args| {
            let event = args.first().and_then(|v| guest.as_string(v)).unwrap_or_default();
            let count = emitter.upgrade().map_or(0, |e| e.listener_count(&event));
            Ok(guest.number(count as f64))
        })?;

        let emitter = Rc::downgrade(self);
        guest.set_function(target, "emit", move |guest, this, args| {
            let event = args.first().and_then(|v| guest.as_string(v)).ok_or_else(|| {
                RuntimeError::type_error("event name", args.first().map_or("undefined", |v| v.kind().name()))
            })?;
            let fired = emitter.upgrade().is_some_and(|e| e.emit(this, &event, &args[1..]));
            Ok(guest.boolean(fired))
        })?;

        Ok(())
    }
}

fn event_and_listener<G: Guest>(guest: &G, args: &[G::Value]) -> GuestResult<(String, G::Value), G::Value> {
    let event = args
        .first()
        .and_then(|v| guest.as_string(v))
        .ok_or_else(|| RuntimeError::type_error("event name", "undefined"))?;
    match args.get(1) {
        Some(listener) if listener.is_function() => Ok((event, listener.clone())),
        Some(other) => Err(RuntimeError::type_error("listener function", other.kind().name()).into()),
        None => Err(RuntimeError::type_error("listener function", "undefined").into()),
    }
}
