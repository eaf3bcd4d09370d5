//! Values of the test engine.

use crate::TestGuest;
use bytes::Bytes;
use marten_runtime::{GuestValue, HostFunction, ValueKind};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Bytes(Bytes),
    Object(Object),
    Function(Function),
}

/// Shared, mutable property bag with an optional prototype.
#[derive(Clone)]
pub struct Object(Rc<ObjectData>);

pub(crate) struct ObjectData {
    props: RefCell<BTreeMap<String, Value>>,
    proto: RefCell<Option<Object>>,
    is_array: bool,
}

/// Host closure plus its own properties (`prototype`, `resolve`, ...).
#[derive(Clone)]
pub struct Function(Rc<FunctionData>);

pub(crate) struct FunctionData {
    pub(crate) name: String,
    pub(crate) body: HostFunction<TestGuest>,
    pub(crate) props: Object,
}

impl Object {
    pub fn new() -> Self {
        Self::with_flags(false)
    }

    pub fn array(items: Vec<Value>) -> Self {
        let object = Self::with_flags(true);
        let len = items.len();
        for (i, item) in items.into_iter().enumerate() {
            object.set(&i.to_string(), item);
        }
        object.set("length", Value::Number(len as f64));
        object
    }

    fn with_flags(is_array: bool) -> Self {
        Self(Rc::new(ObjectData {
            props: RefCell::new(BTreeMap::new()),
            proto: RefCell::new(None),
            is_array,
        }))
    }

    pub fn get(&self, key: &str) -> Value {
        if let Some(value) = self.0.props.borrow().get(key) {
            return value.clone();
        }
        match &*self.0.proto.borrow() {
            Some(proto) => proto.get(key),
            None => Value::Undefined,
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        self.0.props.borrow_mut().insert(key.to_string(), value);
    }

    pub fn has_own(&self, key: &str) -> bool {
        self.0.props.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.props.borrow().keys().cloned().collect()
    }

    pub fn set_proto(&self, proto: Option<Object>) {
        *self.0.proto.borrow_mut() = proto;
    }

    pub fn is_array(&self) -> bool {
        self.0.is_array
    }

    /// Elements of an array object, in index order.
    pub fn elements(&self) -> Vec<Value> {
        let len = match self.get("length") {
            Value::Number(n) if n >= 0.0 => n as usize,
            _ => 0,
        };
        (0..len).map(|i| self.get(&i.to_string())).collect()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Function {
    pub(crate) fn new(name: &str, body: HostFunction<TestGuest>) -> Self {
        Self(Rc::new(FunctionData {
            name: name.to_string(),
            body,
            props: Object::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn props(&self) -> &Object {
        &self.0.props
    }

    pub(crate) fn body(&self) -> HostFunction<TestGuest> {
        self.0.body.clone()
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            Value::Function(function) => Some(function.props()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Property lookup; primitives have none.
    pub fn prop(&self, key: &str) -> Value {
        match self {
            Value::Object(object) => object.get(key),
            Value::Function(function) => function.props().get(key),
            Value::Bytes(bytes) if key == "length" => Value::Number(bytes.len() as f64),
            Value::Str(s) if key == "length" => Value::Number(s.chars().count() as f64),
            _ => Value::Undefined,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value as Json;
        Some(match self {
            Value::Undefined | Value::Function(_) => return None,
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Value::Object(object) if object.is_array() => {
                Json::Array(object.elements().iter().map(|v| v.to_json().unwrap_or(Json::Null)).collect())
            }
            Value::Object(object) => {
                let mut map = serde_json::Map::new();
                for key in object.keys() {
                    if let Some(value) = object.get(&key).to_json() {
                        map.insert(key, value);
                    }
                }
                Json::Object(map)
            }
        })
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::str(s),
            Json::Array(items) => Value::Object(Object::array(items.iter().map(Value::from_json).collect())),
            Json::Object(map) => {
                let object = Object::new();
                for (key, value) in map {
                    object.set(key, Value::from_json(value));
                }
                Value::Object(object)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(bytes) => write!(f, "<Buffer {} bytes>", bytes.len()),
            Value::Object(object) => match object.get("message") {
                Value::Str(message) => write!(f, "Error: {message}"),
                _ => write!(f, "[object {:?}]", object.keys()),
            },
            Value::Function(function) => write!(f, "[Function {}]", function.name()),
        }
    }
}

impl GuestValue for Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::Undefined => ValueKind::Undefined,
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::Str(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Object(_) => ValueKind::Object,
            Value::Function(_) => ValueKind::Function,
        }
    }

    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}
