//! In-memory guest engine for exercising marten runtimes.
//!
//! [`TestGuest`] implements [`Guest`] without a script interpreter: module
//! bodies are Rust closures registered per filename, and values are
//! reference-counted property bags. Evaluating a file with no registered body
//! yields an empty module.

mod stream;
mod value;

pub use stream::stream_module;
pub use value::{Function, Object, Value};

use bytes::Bytes;
use marten_runtime::{
    Guest, GuestError, GuestResult, GuestValue, HostFunction, Job, JobExecutor, RuntimeError, ValueKind,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Module body standing in for script source.
pub type ScriptBody = Rc<dyn Fn(&TestGuest, &ModuleScope) -> GuestResult<(), Value>>;

/// The arguments a CommonJS wrapper receives.
pub struct ModuleScope {
    pub exports: Value,
    pub require: Value,
    pub module: Value,
    pub filename: String,
    pub dirname: String,
    pub process: Value,
}

impl ModuleScope {
    /// `require(name)` from inside the module.
    pub fn require(&self, guest: &TestGuest, name: &str) -> GuestResult<Value, Value> {
        guest.call(&self.require, &Value::Undefined, &[Value::str(name)])
    }

    /// `exports[key] = value`
    pub fn export(&self, guest: &TestGuest, key: &str, value: Value) -> GuestResult<(), Value> {
        guest.set(&self.exports, key, value)
    }

    /// `module.exports = value`
    pub fn replace_exports(&self, guest: &TestGuest, value: Value) -> GuestResult<(), Value> {
        guest.set(&self.module, "exports", value)
    }
}

#[derive(Default)]
pub struct TestGuest {
    global: Object,
    scripts: RefCell<HashMap<String, ScriptBody>>,
    evaluated: RefCell<Vec<(String, String)>>,
    executor: RefCell<Option<JobExecutor>>,
}

impl TestGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body run when `filename` is evaluated.
    pub fn script<F>(&self, filename: &str, body: F)
    where
        F: Fn(&TestGuest, &ModuleScope) -> GuestResult<(), Value> + 'static,
    {
        self.scripts.borrow_mut().insert(filename.to_string(), Rc::new(body));
    }

    /// How many times `filename` has been evaluated.
    pub fn evaluations(&self, filename: &str) -> usize {
        self.evaluated.borrow().iter().filter(|(f, _)| f == filename).count()
    }

    /// Source text of the last evaluation of `filename`.
    pub fn last_source(&self, filename: &str) -> Option<String> {
        self.evaluated
            .borrow()
            .iter()
            .rev()
            .find(|(f, _)| f == filename)
            .map(|(_, source)| source.clone())
    }

    /// Hand a deferred job to the installed executor, or run it now.
    pub fn enqueue_job(&self, job: Job) {
        let executor = self.executor.borrow().clone();
        match executor {
            Some(executor) => executor(job),
            None => job(),
        }
    }

    /// A function value backed by `f`.
    pub fn func<F>(&self, name: &str, f: F) -> Value
    where
        F: Fn(&TestGuest, &Value, &[Value]) -> GuestResult<Value, Value> + 'static,
    {
        self.function(name, Rc::new(f))
    }

    /// A thrown `Error` with `message`.
    pub fn throw(&self, message: &str) -> GuestError<Value> {
        GuestError::Thrown(self.error(message))
    }

    /// `global[name]`
    pub fn global_get(&self, name: &str) -> Value {
        self.global.get(name)
    }

    /// Call `global[name](...args)`.
    pub fn call_global(&self, name: &str, args: &[Value]) -> GuestResult<Value, Value> {
        let function = self.global.get(name);
        self.call(&function, &Value::Undefined, args)
    }
}

fn not_an_object(value: &Value) -> GuestError<Value> {
    RuntimeError::type_error("object", value.kind().name()).into()
}

impl Guest for TestGuest {
    type Value = Value;

    fn undefined(&self) -> Value {
        Value::Undefined
    }

    fn null(&self) -> Value {
        Value::Null
    }

    fn boolean(&self, value: bool) -> Value {
        Value::Bool(value)
    }

    fn number(&self, value: f64) -> Value {
        Value::Number(value)
    }

    fn string(&self, value: &str) -> Value {
        Value::str(value)
    }

    fn bytes(&self, data: Bytes) -> Value {
        Value::Bytes(data)
    }

    fn object(&self) -> Value {
        Value::Object(Object::new())
    }

    fn array(&self, items: Vec<Value>) -> Value {
        Value::Object(Object::array(items))
    }

    fn error(&self, message: &str) -> Value {
        let error = Object::new();
        error.set("name", Value::str("Error"));
        error.set("message", Value::str(message));
        Value::Object(error)
    }

    fn function(&self, name: &str, f: HostFunction<Self>) -> Value {
        Value::Function(Function::new(name, f))
    }

    fn from_json(&self, value: &serde_json::Value) -> Value {
        Value::from_json(value)
    }

    fn as_number(&self, value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn as_string(&self, value: &Value) -> Option<String> {
        match value {
            Value::Str(s) => Some(s.to_string()),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(format!("{}", *n as i64)),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    fn truthy(&self, value: &Value) -> bool {
        value.is_truthy()
    }

    fn as_bytes(&self, value: &Value) -> Option<Bytes> {
        match value {
            Value::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn to_json(&self, value: &Value) -> Option<serde_json::Value> {
        value.to_json()
    }

    fn global(&self) -> Value {
        Value::Object(self.global.clone())
    }

    fn get(&self, object: &Value, key: &str) -> GuestResult<Value, Value> {
        match object {
            Value::Undefined | Value::Null => Err(RuntimeError::type_error(
                format!("object with property '{key}'"),
                object.kind().name(),
            )
            .into()),
            other => Ok(other.prop(key)),
        }
    }

    fn set(&self, object: &Value, key: &str, value: Value) -> GuestResult<(), Value> {
        let target = object.as_object().ok_or_else(|| not_an_object(object))?;
        target.set(key, value);
        Ok(())
    }

    fn call(&self, function: &Value, this: &Value, args: &[Value]) -> GuestResult<Value, Value> {
        match function {
            Value::Function(f) => {
                let body = f.body();
                body(self, this, args)
            }
            other => Err(RuntimeError::type_error("function", other.kind().name()).into()),
        }
    }

    fn construct(&self, constructor: &Value, args: &[Value]) -> GuestResult<Value, Value> {
        let Value::Function(f) = constructor else {
            return Err(RuntimeError::type_error("constructor", constructor.kind().name()).into());
        };
        let instance = Object::new();
        if let Value::Object(proto) = f.props().get("prototype") {
            instance.set_proto(Some(proto));
        }
        let instance = Value::Object(instance);
        let result = self.call(constructor, &instance, args)?;
        Ok(match result.kind() {
            ValueKind::Object | ValueKind::Function => result,
            _ => instance,
        })
    }

    fn evaluate(&self, source: &str, filename: &str) -> GuestResult<Value, Value> {
        self.evaluated
            .borrow_mut()
            .push((filename.to_string(), source.to_string()));
        let body = self.scripts.borrow().get(filename).cloned();
        let wrapper = move |guest: &TestGuest, _this: &Value, args: &[Value]| {
            let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);
            let scope = ModuleScope {
                exports: arg(0),
                require: arg(1),
                module: arg(2),
                filename: arg(3).as_str().unwrap_or_default().to_string(),
                dirname: arg(4).as_str().unwrap_or_default().to_string(),
                process: arg(5),
            };
            match &body {
                Some(body) => body(guest, &scope)?,
                None => tracing::trace!("no body registered for {}", scope.filename),
            }
            Ok(Value::Undefined)
        };
        Ok(self.func(filename, wrapper))
    }

    fn set_job_executor(&self, executor: JobExecutor) {
        *self.executor.borrow_mut() = Some(executor);
    }
}
