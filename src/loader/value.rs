//! Values crossing the module boundary
//!
//! Exports objects, `require` results and event payloads are all `Value`s.
//! Objects are shared by reference like their script counterparts, so a
//! module that fills its exports after being required is seen by every
//! holder of the object.

use super::builtins::Builtin;
use super::error::ScriptError;
use crate::sandbox::buffer::Buffer;
use serde_json::{Map, Number, Value as Json};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

pub type ObjectRef = Rc<RefCell<BTreeMap<String, Value>>>;

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A callable exported by native code
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, ScriptError>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Buffer),
    Array(Vec<Value>),
    Object(ObjectRef),
    Function(NativeFn),
    /// A built-in module
    Builtin(Builtin),
    /// Engine-specific payload (a JS value on wasm32)
    Host(Rc<dyn Any>),
}

impl Value {
    /// A fresh empty object
    pub fn object() -> Value {
        Value::Object(Rc::new(RefCell::new(BTreeMap::new())))
    }

    pub fn function<F>(f: F) -> Value
    where
        F: Fn(&[Value]) -> Result<Value, ScriptError> + 'static,
    {
        Value::Function(Rc::new(f))
    }

    /// Property lookup; anything that is not an object has no properties
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(obj) => obj.borrow().get(key).cloned().unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    /// Set a property. Returns false on non-objects.
    pub fn set(&self, key: &str, value: Value) -> bool {
        match self {
            Value::Object(obj) => {
                obj.borrow_mut().insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        match self {
            Value::Object(obj) => obj.borrow().contains_key(key),
            _ => false,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            Value::Object(obj) => obj.borrow().keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Call a function value
    pub fn call(&self, args: &[Value]) -> Result<Value, ScriptError> {
        match self {
            Value::Function(f) => f(args),
            other => Err(ScriptError::new(format!("{} is not a function", other.type_name()))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_builtin(&self) -> Option<&Builtin> {
        match self {
            Value::Builtin(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Same object (or function) by identity; primitives by value
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Host(a), Value::Host(b)) => Rc::ptr_eq(a, b),
            (a, b) => a == b,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "Buffer",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Builtin(_) => "module",
            Value::Host(_) => "host",
        }
    }

    /// Console rendering: strings bare, everything else JSON-ish
    pub fn display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Undefined => "undefined".to_string(),
            Value::Bytes(buf) => format!("<Buffer {}>", buf.to_hex()),
            Value::Function(_) => "[Function]".to_string(),
            Value::Builtin(b) => format!("[module {}]", b.module().name()),
            Value::Host(_) => "[host]".to_string(),
            other => other.to_json().to_string(),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let obj: BTreeMap<_, _> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Value::Object(Rc::new(RefCell::new(obj)))
            }
        }
    }

    /// Structured-clone into JSON. Functions and host values are dropped
    /// from objects and become null elsewhere.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Undefined | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER => {
                Json::from(*n as i64)
            }
            Value::Number(n) => Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(buf) => Json::Array(
                buf.as_bytes()
                    .iter()
                    .map(|b| Json::Number((*b).into()))
                    .collect(),
            ),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(obj) => {
                let mut map = Map::new();
                for (k, v) in obj.borrow().iter() {
                    if !matches!(v, Value::Undefined | Value::Function(_) | Value::Host(_)) {
                        map.insert(k.clone(), v.to_json());
                    }
                }
                Json::Object(map)
            }
            Value::Function(_) | Value::Builtin(_) | Value::Host(_) => Json::Null,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.module() == b.module(),
            (Value::Host(a), Value::Host(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other.display()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
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

impl From<Buffer> for Value {
    fn from(buf: Buffer) -> Self {
        Value::Bytes(buf)
    }
}

/// Default-import rule: an exports object carrying a `default` field is
/// unwrapped to it, anything else is used as-is
pub fn interop_default(exports: Value) -> Value {
    if exports.has("default") {
        exports.get("default")
    } else {
        exports
    }
}
