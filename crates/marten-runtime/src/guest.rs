//! Boundary between the runtime and the embedded script engine.
//!
//! The engine itself (parsing, execution, value representation) lives outside
//! this crate. Everything the runtime needs from it is expressed by the
//! [`Guest`] trait: creating and inspecting values, property access, calling
//! functions, evaluating source text, and accepting a job executor for
//! deferred work such as promise continuations.

use crate::error::{GuestError, GuestResult, RuntimeError};
use bytes::Bytes;
use std::fmt;
use std::rc::Rc;

/// Coarse classification of a guest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Bytes,
    Object,
    Function,
}

impl ValueKind {
    /// Name used in type errors (`typeof`-style).
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Bytes => "Buffer",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opaque value owned by the guest engine.
pub trait GuestValue: Clone + fmt::Debug + 'static {
    fn kind(&self) -> ValueKind;

    /// Reference identity (same object or function).
    fn same(&self, other: &Self) -> bool;

    fn is_function(&self) -> bool {
        self.kind() == ValueKind::Function
    }

    fn is_nullish(&self) -> bool {
        matches!(self.kind(), ValueKind::Undefined | ValueKind::Null)
    }
}

/// Deferred unit of work handed from the engine to the host loop.
pub type Job = Box<dyn FnOnce()>;

/// Host-supplied executor the engine posts its jobs to.
pub type JobExecutor = Rc<dyn Fn(Job)>;

/// Host closure callable from guest code as `f.call(this, ...args)`.
pub type HostFunction<G> = Rc<
    dyn Fn(&G, &<G as Guest>::Value, &[<G as Guest>::Value]) -> GuestResult<<G as Guest>::Value, <G as Guest>::Value>,
>;

/// The script engine as seen by the runtime.
pub trait Guest: Sized + 'static {
    type Value: GuestValue;

    // Value construction

    fn undefined(&self) -> Self::Value;
    fn null(&self) -> Self::Value;
    fn boolean(&self, value: bool) -> Self::Value;
    fn number(&self, value: f64) -> Self::Value;
    fn string(&self, value: &str) -> Self::Value;
    /// A Buffer-like view over `data`.
    fn bytes(&self, data: Bytes) -> Self::Value;
    fn object(&self) -> Self::Value;
    fn array(&self, items: Vec<Self::Value>) -> Self::Value;
    /// An `Error` instance with the given message.
    fn error(&self, message: &str) -> Self::Value;
    fn function(&self, name: &str, f: HostFunction<Self>) -> Self::Value;
    fn from_json(&self, value: &serde_json::Value) -> Self::Value;

    // Inspection

    fn as_number(&self, value: &Self::Value) -> Option<f64>;
    fn as_string(&self, value: &Self::Value) -> Option<String>;
    fn truthy(&self, value: &Self::Value) -> bool;
    fn as_bytes(&self, value: &Self::Value) -> Option<Bytes>;
    /// Structured copy of an options object or primitive.
    fn to_json(&self, value: &Self::Value) -> Option<serde_json::Value>;

    // Object model

    fn global(&self) -> Self::Value;
    fn get(&self, object: &Self::Value, key: &str) -> GuestResult<Self::Value, Self::Value>;
    fn set(&self, object: &Self::Value, key: &str, value: Self::Value) -> GuestResult<(), Self::Value>;
    fn call(
        &self,
        function: &Self::Value,
        this: &Self::Value,
        args: &[Self::Value],
    ) -> GuestResult<Self::Value, Self::Value>;
    fn construct(&self, constructor: &Self::Value, args: &[Self::Value]) -> GuestResult<Self::Value, Self::Value>;

    /// Evaluate `source`, reporting `filename` in stack traces.
    fn evaluate(&self, source: &str, filename: &str) -> GuestResult<Self::Value, Self::Value>;

    /// Route deferred engine jobs through `executor` instead of running them inline.
    fn set_job_executor(&self, executor: JobExecutor);

    // Provided helpers

    /// Call `object[name](...args)`.
    fn call_method(
        &self,
        object: &Self::Value,
        name: &str,
        args: &[Self::Value],
    ) -> GuestResult<Self::Value, Self::Value> {
        let method = self.get(object, name)?;
        if !method.is_function() {
            return Err(RuntimeError::type_error(format!("function '{name}'"), method.kind().name()).into());
        }
        self.call(&method, object, args)
    }

    fn has_method(&self, object: &Self::Value, name: &str) -> bool {
        self.get(object, name).map(|v| v.is_function()).unwrap_or(false)
    }

    /// Install a host function as `object[name]`.
    fn set_function<F>(&self, object: &Self::Value, name: &str, f: F) -> GuestResult<(), Self::Value>
    where
        F: Fn(&Self, &Self::Value, &[Self::Value]) -> GuestResult<Self::Value, Self::Value> + 'static,
    {
        let function = self.function(name, Rc::new(f));
        self.set(object, name, function)
    }

    /// Set a property whose failure the caller cannot act on; failures are
    /// logged.
    fn set_or_log(&self, object: &Self::Value, key: &str, value: Self::Value) {
        if let Err(err) = self.set(object, key, value) {
            tracing::debug!("setting '{}' failed: {}", key, self.describe(err));
        }
    }

    /// Guest error value for a host failure, with a Node-style `code` when one applies.
    fn runtime_error(&self, err: &RuntimeError) -> Self::Value {
        let value = self.error(&err.to_string());
        if let Some(code) = err.code() {
            self.set_or_log(&value, "code", self.string(code));
        }
        value
    }

    /// Turn any boundary error into a value that can be thrown or passed to a callback.
    fn throwable(&self, err: GuestError<Self::Value>) -> Self::Value {
        match err {
            GuestError::Thrown(value) => value,
            GuestError::Runtime(err) => self.runtime_error(&err),
        }
    }

    /// Host-side description of a boundary error, for the unhandled-error sink.
    fn describe(&self, err: GuestError<Self::Value>) -> RuntimeError {
        match err {
            GuestError::Runtime(err) => err,
            GuestError::Thrown(value) => {
                let message = self
                    .get(&value, "message")
                    .ok()
                    .and_then(|m| self.as_string(&m))
                    .or_else(|| self.as_string(&value))
                    .unwrap_or_else(|| format!("{value:?}"));
                RuntimeError::Uncaught(message)
            }
        }
    }
}
