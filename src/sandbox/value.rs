//! The sandbox value model.
//!
//! Arrays and objects handed to sandboxed code are *managed*: every access
//! routes through the interruption bookkeeping of the currently installed
//! engine handle, so the engine can treat container traffic as safe points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Result, SandboxError};
use crate::sandbox::engine::{self, EngineHandle};

/// Maximum nesting the plain/managed converters will follow.
const MAX_CONVERT_DEPTH: usize = 64;

/// A host-implemented function callable from sandboxed code.
#[derive(Clone)]
pub struct NativeFn {
    name: String,
    imp: Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl NativeFn {
    /// Wrap a host closure as a callable sandbox value.
    pub fn new(
        name: impl Into<String>,
        imp: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            imp: Arc::new(imp),
        }
    }

    /// The function's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.imp)(args)
    }
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

impl PartialEq for NativeFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.imp, &other.imp)
    }
}

/// A value visible to sandboxed code.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absent value.
    Undefined,
    /// Boolean.
    Bool(bool),
    /// Double-precision number.
    Num(f64),
    /// Immutable string.
    Str(String),
    /// Managed array.
    Array(ManagedArray),
    /// Managed object.
    Object(ManagedObject),
    /// Host function.
    Native(NativeFn),
}

impl Value {
    /// Convenience string constructor.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Convenience native-function constructor.
    pub fn native(
        name: impl Into<String>,
        imp: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Value::Native(NativeFn::new(name, imp))
    }

    /// Truthiness: `undefined`, `false`, `0`, `NaN` and `""` are falsey.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Native(_) => true,
        }
    }

    /// The value's type name, used in runtime error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Native(_) => "function",
        }
    }

    /// Render the value the way the console substitute prints it.
    pub fn to_display(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => display_number(*n),
            Value::Str(s) => s.clone(),
            Value::Array(arr) => {
                let parts: Vec<String> =
                    arr.snapshot().iter().map(Value::to_display).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Object(_) => "[object]".to_string(),
            Value::Native(f) => format!("[function {}]", f.name()),
        }
    }
}

fn display_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.same_cells(b),
            (Value::Object(a), Value::Object(b)) => a.same_entries(b),
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }
}

/// An array whose every access ticks the installed engine handle's
/// interruption bookkeeping.
#[derive(Debug, Clone)]
pub struct ManagedArray {
    cells: Arc<RwLock<Vec<Value>>>,
}

impl ManagedArray {
    /// Wrap a plain vector.
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            cells: Arc::new(RwLock::new(items)),
        }
    }

    /// Identity comparison: two handles over the same cells.
    pub fn same_cells(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cells, &other.cells)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        engine::checkpoint();
        self.cells.read().unwrap().len()
    }

    /// Check if the array is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read an element.
    pub fn get(&self, index: usize) -> Result<Value> {
        engine::checkpoint();
        self.cells
            .read()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or_else(|| SandboxError::Runtime(format!("array index {index} is out of bounds")))
    }

    /// Write an element in place.
    pub fn set(&self, index: usize, value: Value) -> Result<()> {
        engine::checkpoint();
        let mut cells = self.cells.write().unwrap();
        match cells.get_mut(index) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(SandboxError::Runtime(format!(
                "array index {index} is out of bounds"
            ))),
        }
    }

    /// Append an element.
    pub fn push(&self, value: Value) {
        engine::checkpoint();
        self.cells.write().unwrap().push(value);
    }

    /// Clone out the current contents.
    pub fn snapshot(&self) -> Vec<Value> {
        engine::checkpoint();
        self.cells.read().unwrap().clone()
    }
}

/// A string-keyed object with freeze support. Frozen objects reject writes
/// with a runtime error.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    entries: Arc<RwLock<HashMap<String, Value>>>,
    frozen: Arc<AtomicBool>,
}

impl ManagedObject {
    /// An empty, mutable object.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build an object from key/value pairs.
    pub fn from_pairs<K: Into<String>>(pairs: Vec<(K, Value)>) -> Self {
        let object = Self::new();
        {
            let mut entries = object.entries.write().unwrap();
            for (key, value) in pairs {
                entries.insert(key.into(), value);
            }
        }
        object
    }

    /// Identity comparison: two handles over the same entries.
    pub fn same_entries(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    /// Read a member.
    pub fn get(&self, name: &str) -> Option<Value> {
        engine::checkpoint();
        self.entries.read().unwrap().get(name).cloned()
    }

    /// Write a member. Fails if the object is frozen.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Result<()> {
        engine::checkpoint();
        let name = name.into();
        if self.is_frozen() {
            return Err(SandboxError::Runtime(format!(
                "cannot set '{name}' on a frozen object"
            )));
        }
        self.entries.write().unwrap().insert(name, value);
        Ok(())
    }

    /// Make the object reject all further writes.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Check if the object is frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// The member names, unordered.
    pub fn keys(&self) -> Vec<String> {
        engine::checkpoint();
        self.entries.read().unwrap().keys().cloned().collect()
    }
}

impl Default for ManagedObject {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration object handed to every whitelist-module factory.
///
/// It exposes exactly three capabilities: the current execution handle,
/// plain-array conversion, and recursive plain-structure conversion.
pub struct ModuleCtx {
    _priv: (),
}

impl ModuleCtx {
    pub(crate) fn new() -> Self {
        Self { _priv: () }
    }

    /// The currently installed execution handle, if any. During namespace
    /// construction no handle is installed yet; factories that capture this
    /// capability must look it up lazily, at call time.
    pub fn handle(&self) -> Option<EngineHandle> {
        engine::current()
    }

    /// Convert a plain vector into an interruption-safe managed array.
    pub fn manage_array(&self, items: Vec<Value>) -> Value {
        Value::Array(ManagedArray::new(items))
    }

    /// Recursively convert a plain nested structure into managed
    /// equivalents.
    pub fn manage_deep(&self, plain: serde_json::Value) -> Value {
        manage_deep(plain)
    }
}

/// Recursively convert a plain JSON structure into managed sandbox values.
pub fn manage_deep(plain: serde_json::Value) -> Value {
    match plain {
        serde_json::Value::Null => Value::Undefined,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => {
            Value::Array(ManagedArray::new(items.into_iter().map(manage_deep).collect()))
        }
        serde_json::Value::Object(map) => {
            let object = ManagedObject::new();
            {
                let mut entries = object.entries.write().unwrap();
                for (key, value) in map {
                    entries.insert(key, manage_deep(value));
                }
            }
            Value::Object(object)
        }
    }
}

/// Convert a sandbox value back into a plain JSON structure, for the codec
/// encode path. Function values cannot be encoded; non-finite numbers and
/// `undefined` encode as null.
pub fn to_plain(value: &Value) -> Result<serde_json::Value> {
    to_plain_at(value, 0)
}

fn to_plain_at(value: &Value, depth: usize) -> Result<serde_json::Value> {
    if depth > MAX_CONVERT_DEPTH {
        return Err(SandboxError::Runtime(
            "structure is nested too deeply to encode".to_string(),
        ));
    }
    match value {
        Value::Undefined => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Num(n) => Ok(serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        Value::Str(s) => Ok(serde_json::Value::String(s.clone())),
        Value::Array(arr) => {
            let mut out = Vec::new();
            for item in arr.snapshot() {
                out.push(to_plain_at(&item, depth + 1)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Object(obj) => {
            let mut out = serde_json::Map::new();
            for key in obj.keys() {
                if let Some(member) = obj.get(&key) {
                    out.insert(key, to_plain_at(&member, depth + 1)?);
                }
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Native(f) => Err(SandboxError::Runtime(format!(
            "function {} cannot be encoded",
            f.name()
        ))),
    }
}
