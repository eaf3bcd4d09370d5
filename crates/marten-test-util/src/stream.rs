//! Minimal `stream` module with a `Duplex` class.
//!
//! Enough of Node's stream semantics to drive the bridge: `push` delivers to
//! `data` listeners when flowing and buffers otherwise, `read` drains the
//! buffer, `write`/`end` call `_write`/`_final`, and `destroy` calls
//! `_destroy` then emits `error` (if any) and `close`.

use crate::{Object, TestGuest, Value};
use bytes::Bytes;
use marten_runtime::{EventRegistry, Guest, GuestResult, GuestValue, RuntimeError};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

const HIGH_WATER_MARK: usize = 16 * 1024;

#[derive(Default)]
struct DuplexState {
    events: RefCell<EventRegistry<Value>>,
    buffer: RefCell<VecDeque<Bytes>>,
    buffered: Cell<usize>,
    flowing: Cell<bool>,
    ended: Cell<bool>,
    end_emitted: Cell<bool>,
    destroyed: Cell<bool>,
}

fn emit(guest: &TestGuest, state: &DuplexState, this: &Value, event: &str, args: &[Value]) -> bool {
    let listeners = state.events.borrow_mut().take_for_emit(event);
    for listener in &listeners {
        if let Err(err) = guest.call(listener, this, args) {
            tracing::warn!("listener for '{}' threw: {:?}", event, err);
        }
    }
    !listeners.is_empty()
}

fn maybe_end(guest: &TestGuest, state: &DuplexState, this: &Value) {
    if state.ended.get() && state.buffer.borrow().is_empty() && !state.end_emitted.replace(true) {
        emit(guest, state, this, "end", &[]);
    }
}

fn flush(guest: &TestGuest, state: &DuplexState, this: &Value) {
    while state.flowing.get() {
        let next = state.buffer.borrow_mut().pop_front();
        let Some(chunk) = next else { break };
        state.buffered.set(state.buffered.get().saturating_sub(chunk.len()));
        emit(guest, state, this, "data", &[Value::Bytes(chunk)]);
    }
    if state.flowing.get() {
        maybe_end(guest, state, this);
    }
}

fn request_read(guest: &TestGuest, state: &DuplexState, this: &Value) {
    if state.ended.get() || state.destroyed.get() {
        return;
    }
    if guest.has_method(this, "_read") {
        let size = Value::Number(HIGH_WATER_MARK as f64);
        if let Err(err) = guest.call_method(this, "_read", &[size]) {
            tracing::warn!("_read threw: {:?}", err);
        }
    }
}

fn callback_of(args: &[Value]) -> Option<Value> {
    args.iter().find(|a| a.is_function()).cloned()
}

fn chunk_of(value: &Value) -> Option<Bytes> {
    match value {
        Value::Bytes(bytes) => Some(bytes.clone()),
        Value::Str(s) => Some(Bytes::from(s.to_string())),
        _ => None,
    }
}

/// A `done(err)` function for `_write`/`_final` that reports through `then`.
fn completion<F>(guest: &TestGuest, state: &Rc<DuplexState>, this: &Value, then: F) -> Value
where
    F: Fn(&TestGuest, &DuplexState, &Value, Option<Value>) + 'static,
{
    let state = state.clone();
    let target = this.clone();
    guest.func("done", move |guest, _this, args| {
        let err = args.first().filter(|e| !e.is_nullish()).cloned();
        if let Some(err) = &err {
            emit(guest, &state, &target, "error", std::slice::from_ref(err));
        }
        then(guest, &state, &target, err);
        Ok(Value::Undefined)
    })
}

fn install(guest: &TestGuest, this: &Value) -> GuestResult<(), Value> {
    let state = Rc::new(DuplexState::default());

    for (name, once) in [("on", false), ("addListener", false), ("once", true)] {
        let state = state.clone();
        guest.set_function(this, name, move |guest, this, args| {
            let event = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let Some(listener) = args.get(1).filter(|l| l.is_function()).cloned() else {
                return Err(RuntimeError::type_error("listener function", "non-function").into());
            };
            {
                let mut events = state.events.borrow_mut();
                if once {
                    events.once(&event, listener);
                } else {
                    events.on(&event, listener);
                }
            }
            if event == "data" && !state.flowing.replace(true) {
                flush(guest, &state, this);
                request_read(guest, &state, this);
            }
            Ok(this.clone())
        })?;
    }

    for name in ["off", "removeListener"] {
        let state = state.clone();
        guest.set_function(this, name, move |_guest, this, args| {
            let event = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            if let Some(listener) = args.get(1) {
                state.events.borrow_mut().off_matching(&event, |l| l.same(listener));
            }
            Ok(this.clone())
        })?;
    }

    let emitter = state.clone();
    guest.set_function(this, "emit", move |guest, this, args| {
        let event = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
        let rest = args.get(1..).unwrap_or_default();
        Ok(Value::Bool(emit(guest, &emitter, this, &event, rest)))
    })?;

    let pusher = state.clone();
    guest.set_function(this, "push", move |guest, this, args| {
        let state = &pusher;
        if state.destroyed.get() {
            return Ok(Value::Bool(false));
        }
        let chunk = match args.first() {
            None | Some(Value::Null) | Some(Value::Undefined) => {
                state.ended.set(true);
                if state.flowing.get() {
                    maybe_end(guest, state, this);
                } else {
                    emit(guest, state, this, "readable", &[]);
                }
                return Ok(Value::Bool(false));
            }
            Some(value) => chunk_of(value).ok_or_else(|| RuntimeError::type_error("chunk", "other"))?,
        };
        if state.flowing.get() && state.buffer.borrow().is_empty() {
            emit(guest, state, this, "data", &[Value::Bytes(chunk)]);
            return Ok(Value::Bool(state.flowing.get()));
        }
        state.buffered.set(state.buffered.get() + chunk.len());
        state.buffer.borrow_mut().push_back(chunk);
        emit(guest, state, this, "readable", &[]);
        Ok(Value::Bool(state.buffered.get() < HIGH_WATER_MARK))
    })?;

    let reader = state.clone();
    guest.set_function(this, "read", move |guest, this, _args| {
        let next = reader.buffer.borrow_mut().pop_front();
        match next {
            Some(chunk) => {
                reader.buffered.set(reader.buffered.get().saturating_sub(chunk.len()));
                Ok(Value::Bytes(chunk))
            }
            None => {
                if reader.ended.get() {
                    maybe_end(guest, &reader, this);
                } else {
                    request_read(guest, &reader, this);
                }
                Ok(Value::Null)
            }
        }
    })?;

    let resumer = state.clone();
    guest.set_function(this, "resume", move |guest, this, _args| {
        resumer.flowing.set(true);
        flush(guest, &resumer, this);
        request_read(guest, &resumer, this);
        Ok(this.clone())
    })?;

    let pauser = state.clone();
    guest.set_function(this, "pause", move |_guest, this, _args| {
        pauser.flowing.set(false);
        Ok(this.clone())
    })?;

    let writer = state.clone();
    guest.set_function(this, "write", move |guest, this, args| {
        let callback = callback_of(args);
        if writer.destroyed.get() {
            if let Some(callback) = callback {
                let err = guest.runtime_error(&RuntimeError::StreamDestroyed);
                guest.call(&callback, &Value::Undefined, &[err])?;
            }
            return Ok(Value::Bool(false));
        }
        let chunk = args.first().and_then(chunk_of).unwrap_or_default();
        let done = completion(guest, &writer, this, move |guest, _state, _this, err| {
            if let Some(callback) = &callback {
                let args: Vec<Value> = err.into_iter().collect();
                if let Err(err) = guest.call(callback, &Value::Undefined, &args) {
                    tracing::debug!("write callback failed: {}", guest.describe(err));
                }
            }
        });
        guest.call_method(this, "_write", &[Value::Bytes(chunk), Value::str("buffer"), done])?;
        Ok(Value::Bool(true))
    })?;

    let ender = state.clone();
    guest.set_function(this, "end", move |guest, this, args| {
        if let Some(chunk) = args.first().and_then(chunk_of) {
            guest.call_method(this, "write", &[Value::Bytes(chunk)])?;
        }
        let callback = callback_of(args);
        let done = completion(guest, &ender, this, move |guest, state, this, err| {
            if err.is_none() {
                emit(guest, state, this, "finish", &[]);
            }
            if let Some(callback) = &callback {
                if let Err(err) = guest.call(callback, &Value::Undefined, &[]) {
                    tracing::debug!("end callback failed: {}", guest.describe(err));
                }
            }
        });
        if guest.has_method(this, "_final") {
            guest.call_method(this, "_final", &[done])?;
        } else {
            guest.call(&done, &Value::Undefined, &[])?;
        }
        Ok(this.clone())
    })?;

    let destroyer = state.clone();
    guest.set_function(this, "destroy", move |guest, this, args| {
        if destroyer.destroyed.replace(true) {
            return Ok(this.clone());
        }
        guest.set(this, "destroyed", Value::Bool(true))?;
        let err = args.first().filter(|e| !e.is_nullish()).cloned();
        let state = destroyer.clone();
        let target = this.clone();
        let done = guest.func("destroyed", move |guest, _this, args| {
            if let Some(err) = args.first().filter(|e| !e.is_nullish()) {
                emit(guest, &state, &target, "error", std::slice::from_ref(err));
            }
            emit(guest, &state, &target, "close", &[]);
            Ok(Value::Undefined)
        });
        if guest.has_method(this, "_destroy") {
            guest.call_method(this, "_destroy", &[err.unwrap_or(Value::Null), done])?;
        } else {
            guest.call(&done, &Value::Undefined, &[err.unwrap_or(Value::Null)])?;
        }
        Ok(this.clone())
    })?;

    guest.set(this, "destroyed", Value::Bool(false))?;
    Ok(())
}

/// Exports of the `stream` module: `{ Duplex }`.
pub fn stream_module(guest: &TestGuest) -> Value {
    let duplex = guest.func("Duplex", |guest, this, _args| {
        install(guest, this)?;
        Ok(Value::Undefined)
    });
    let exports = Object::new();
    exports.set("Duplex", duplex.clone());
    exports.set("Readable", duplex);
    Value::Object(exports)
}
