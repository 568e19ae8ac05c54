//! The protected global namespace.
//!
//! The fixed-key portion is built once per compile and never changes
//! identity afterwards; writes to fixed keys always fail, writes to any
//! other key always succeed and are visible to subsequent reads in the same
//! program. Reads of absent names fail instead of producing an absent
//! value.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::{CompileOptions, LogSink};
use crate::sandbox::value::{
    manage_deep, to_plain, ManagedArray, ManagedObject, ModuleCtx, Value,
};

/// The access-controlled namespace installed as the engine's global scope.
pub struct GlobalScope {
    fixed: HashMap<String, Value>,
    user: RwLock<HashMap<String, Value>>,
}

impl GlobalScope {
    fn new(fixed: HashMap<String, Value>) -> Self {
        Self {
            fixed,
            user: RwLock::new(HashMap::new()),
        }
    }

    /// Read a name. Fails with "is not defined" if the name is neither a
    /// fixed binding nor a prior write.
    pub fn get(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.fixed.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.user.read().unwrap().get(name) {
            return Ok(value.clone());
        }
        Err(SandboxError::NotDefined(name.to_string()))
    }

    /// Write a name. Fails with "cannot be overwritten" for fixed bindings
    /// and leaves the namespace unchanged; any other write succeeds.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        if self.fixed.contains_key(name) {
            return Err(SandboxError::ProtectedGlobal(name.to_string()));
        }
        self.user.write().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    /// Check whether a name belongs to the protected fixed set.
    pub fn is_fixed(&self, name: &str) -> bool {
        self.fixed.contains_key(name)
    }

    /// The protected binding names, unordered.
    pub fn fixed_names(&self) -> Vec<&str> {
        self.fixed.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for GlobalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalScope")
            .field("fixed", &self.fixed.len())
            .field("user", &self.user.read().unwrap().len())
            .finish()
    }
}

/// Build the protected namespace from the caller's options.
///
/// Every registered whitelist-module factory is evaluated exactly once,
/// with a [`ModuleCtx`]; the results are the only sanctioned caller-supplied
/// capability bundles in the namespace.
pub(crate) fn build_globals(opts: &CompileOptions) -> Result<GlobalScope> {
    let ctx = ModuleCtx::new();
    let mut modules: HashMap<String, Value> = HashMap::new();
    for (name, factory) in &opts.modules {
        modules.insert(name.clone(), factory(&ctx)?);
    }

    let mut fixed = HashMap::new();

    fixed.insert("sandbox".to_string(), support_object());
    fixed.insert("console".to_string(), console_object(opts.log_sink.clone()));
    fixed.insert("test".to_string(), test_fn(opts.log_sink.clone()));
    fixed.insert("assert".to_string(), assert_fn());

    // The same whitelist module under its current and its legacy name.
    let stdlib = freeze(modules.get("stdlib").cloned().unwrap_or(Value::Undefined));
    fixed.insert("stdlib".to_string(), stdlib.clone());
    fixed.insert("teachpack".to_string(), stdlib);

    fixed.insert("version".to_string(), opts.version.clone());
    fixed.insert("Array".to_string(), array_ctor());
    fixed.insert("Math".to_string(), math_object());
    fixed.insert("undefined".to_string(), Value::Undefined);
    fixed.insert("Infinity".to_string(), Value::Num(f64::INFINITY));
    fixed.insert("Object".to_string(), object_helpers());
    fixed.insert("parseInt".to_string(), parse_int_fn());
    fixed.insert("parseFloat".to_string(), parse_float_fn());

    for export in ["submit", "solution1", "decoy1"] {
        fixed.insert(export.to_string(), lift(&modules, "autograder", export));
    }

    fixed.insert("JSON".to_string(), json_codec());

    let geometry = ManagedObject::from_pairs(vec![
        ("point", lift(&modules, "paths", "point")),
        ("line", lift(&modules, "paths", "line")),
        ("intersects", lift(&modules, "paths", "intersects")),
    ]);
    geometry.freeze();
    fixed.insert("geometry".to_string(), Value::Object(geometry));

    fixed.insert("require".to_string(), require_fn(modules));

    Ok(GlobalScope::new(fixed))
}

/// Freeze object values; anything else is immutable already.
fn freeze(value: Value) -> Value {
    if let Value::Object(obj) = &value {
        obj.freeze();
    }
    value
}

/// One named export of a whitelist module, or `undefined` when the module
/// or the export is absent.
fn lift(modules: &HashMap<String, Value>, module: &str, export: &str) -> Value {
    match modules.get(module) {
        Some(Value::Object(obj)) => obj.get(export).unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

/// The runtime-support object: error raising and managed-array construction
/// for instrumented code.
fn support_object() -> Value {
    let obj = ManagedObject::from_pairs(vec![
        (
            "raise",
            Value::native("raise", |args| {
                let message = args
                    .first()
                    .map(Value::to_display)
                    .unwrap_or_else(|| "error".to_string());
                Err(SandboxError::Runtime(message))
            }),
        ),
        (
            "arrayFrom",
            Value::native("arrayFrom", |args| {
                Ok(Value::Array(ManagedArray::new(args.to_vec())))
            }),
        ),
    ]);
    obj.freeze();
    Value::Object(obj)
}

/// The frozen console substitute: `log` only, forwarding to the caller's
/// sink.
fn console_object(sink: LogSink) -> Value {
    let obj = ManagedObject::from_pairs(vec![(
        "log",
        Value::native("log", move |args| {
            let line = args
                .iter()
                .map(Value::to_display)
                .collect::<Vec<_>>()
                .join(" ");
            sink(&line);
            Ok(Value::Undefined)
        }),
    )]);
    obj.freeze();
    Value::Object(obj)
}

/// `test(description, thunk)`: runs the thunk and reports the result
/// through the sink.
fn test_fn(sink: LogSink) -> Value {
    Value::native("test", move |args| {
        let description = args
            .first()
            .map(Value::to_display)
            .unwrap_or_else(|| "<unnamed test>".to_string());
        let thunk = match args.get(1) {
            Some(Value::Native(f)) => f.clone(),
            _ => {
                return Err(SandboxError::Runtime(
                    "test requires a function as its second argument".to_string(),
                ))
            }
        };
        match thunk.call(&[]) {
            Ok(_) => sink(&format!("PASSED: {description}")),
            Err(e) => sink(&format!("FAILED: {description}: {e}")),
        }
        Ok(Value::Undefined)
    })
}

/// `assert(condition)`: raises on falsey values.
fn assert_fn() -> Value {
    Value::native("assert", |args| {
        let condition = args.first().cloned().unwrap_or(Value::Undefined);
        if condition.is_truthy() {
            Ok(Value::Bool(true))
        } else {
            Err(SandboxError::Runtime("assertion failed".to_string()))
        }
    })
}

/// The managed `Array` constructor: `Array()`, `Array(len)`,
/// `Array(len, fill)`.
fn array_ctor() -> Value {
    Value::native("Array", |args| {
        if args.is_empty() {
            return Ok(Value::Array(ManagedArray::new(Vec::new())));
        }
        let len = match args[0] {
            Value::Num(n) if n >= 0.0 && n.fract() == 0.0 && n <= (u32::MAX as f64) => n as usize,
            _ => {
                return Err(SandboxError::Runtime(
                    "invalid array length".to_string(),
                ))
            }
        };
        let fill = args.get(1).cloned().unwrap_or(Value::Undefined);
        Ok(Value::Array(ManagedArray::new(vec![fill; len])))
    })
}

fn num_arg(args: &[Value], index: usize, name: &str) -> Result<f64> {
    match args.get(index) {
        Some(Value::Num(n)) => Ok(*n),
        other => Err(SandboxError::Runtime(format!(
            "{name} expects a number, got {}",
            other.map(Value::type_name).unwrap_or("nothing")
        ))),
    }
}

fn math_object() -> Value {
    use rand::Rng;

    fn unary(name: &'static str, f: fn(f64) -> f64) -> Value {
        Value::native(name, move |args| Ok(Value::Num(f(num_arg(args, 0, name)?))))
    }

    let obj = ManagedObject::from_pairs(vec![
        ("PI", Value::Num(std::f64::consts::PI)),
        ("E", Value::Num(std::f64::consts::E)),
        ("abs", unary("abs", f64::abs)),
        ("floor", unary("floor", f64::floor)),
        ("ceil", unary("ceil", f64::ceil)),
        ("round", unary("round", f64::round)),
        ("sqrt", unary("sqrt", f64::sqrt)),
        (
            "pow",
            Value::native("pow", |args| {
                let base = num_arg(args, 0, "pow")?;
                let exp = num_arg(args, 1, "pow")?;
                Ok(Value::Num(base.powf(exp)))
            }),
        ),
        (
            "min",
            Value::native("min", |args| {
                let mut best = f64::INFINITY;
                for (i, _) in args.iter().enumerate() {
                    best = best.min(num_arg(args, i, "min")?);
                }
                Ok(Value::Num(best))
            }),
        ),
        (
            "max",
            Value::native("max", |args| {
                let mut best = f64::NEG_INFINITY;
                for (i, _) in args.iter().enumerate() {
                    best = best.max(num_arg(args, i, "max")?);
                }
                Ok(Value::Num(best))
            }),
        ),
        (
            "random",
            Value::native("random", |_args| {
                Ok(Value::Num(rand::thread_rng().gen::<f64>()))
            }),
        ),
    ]);
    obj.freeze();
    Value::Object(obj)
}

fn object_helpers() -> Value {
    let obj = ManagedObject::from_pairs(vec![
        (
            "keys",
            Value::native("keys", |args| match args.first() {
                Some(Value::Object(obj)) => {
                    let mut keys = obj.keys();
                    keys.sort();
                    Ok(Value::Array(ManagedArray::new(
                        keys.into_iter().map(Value::Str).collect(),
                    )))
                }
                other => Err(SandboxError::Runtime(format!(
                    "Object.keys expects an object, got {}",
                    other.map(Value::type_name).unwrap_or("nothing")
                ))),
            }),
        ),
        (
            "freeze",
            Value::native("freeze", |args| {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                Ok(freeze(value))
            }),
        ),
    ]);
    obj.freeze();
    Value::Object(obj)
}

fn parse_int_fn() -> Value {
    Value::native("parseInt", |args| {
        let text = match args.first() {
            Some(Value::Str(s)) => s.clone(),
            Some(Value::Num(n)) => return Ok(Value::Num(n.trunc())),
            _ => return Ok(Value::Num(f64::NAN)),
        };
        let radix = match args.get(1) {
            Some(Value::Num(r)) if (2.0..=36.0).contains(r) && r.fract() == 0.0 => *r as u32,
            Some(_) => return Ok(Value::Num(f64::NAN)),
            None => 10,
        };
        Ok(Value::Num(parse_int_prefix(&text, radix)))
    })
}

/// Parse the longest leading integer in the given radix, NaN if there is
/// none.
fn parse_int_prefix(text: &str, radix: u32) -> f64 {
    let trimmed = text.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let mut value: f64 = 0.0;
    let mut seen = false;
    for ch in digits.chars() {
        match ch.to_digit(radix) {
            Some(d) => {
                value = value * (radix as f64) + d as f64;
                seen = true;
            }
            None => break,
        }
    }
    if seen {
        sign * value
    } else {
        f64::NAN
    }
}

fn parse_float_fn() -> Value {
    Value::native("parseFloat", |args| {
        let text = match args.first() {
            Some(Value::Str(s)) => s.clone(),
            Some(Value::Num(n)) => return Ok(Value::Num(*n)),
            _ => return Ok(Value::Num(f64::NAN)),
        };
        Ok(Value::Num(parse_float_prefix(&text)))
    })
}

/// Parse the longest leading float, NaN if there is none.
fn parse_float_prefix(text: &str) -> f64 {
    let trimmed = text.trim_start();
    for end in (1..=trimmed.len()).rev() {
        if !trimmed.is_char_boundary(end) {
            continue;
        }
        if let Ok(parsed) = trimmed[..end].parse::<f64>() {
            return parsed;
        }
    }
    f64::NAN
}

/// The structured-text codec: decode deep-converts into managed
/// structures, encode walks them back out.
fn json_codec() -> Value {
    let obj = ManagedObject::from_pairs(vec![
        (
            "parse",
            Value::native("parse", |args| {
                let text = match args.first() {
                    Some(Value::Str(s)) => s.clone(),
                    other => {
                        return Err(SandboxError::Runtime(format!(
                            "JSON.parse expects a string, got {}",
                            other.map(Value::type_name).unwrap_or("nothing")
                        )))
                    }
                };
                let plain: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| SandboxError::Runtime(format!("JSON.parse: {e}")))?;
                Ok(manage_deep(plain))
            }),
        ),
        (
            "stringify",
            Value::native("stringify", |args| {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                let plain = to_plain(&value)?;
                Ok(Value::Str(plain.to_string()))
            }),
        ),
    ]);
    obj.freeze();
    Value::Object(obj)
}

/// The dynamic whitelist lookup. Returns a frozen entry by name or raises
/// "module not found".
fn require_fn(modules: HashMap<String, Value>) -> Value {
    Value::native("require", move |args| {
        let name = match args.first() {
            Some(Value::Str(s)) => s.clone(),
            other => {
                return Err(SandboxError::Runtime(format!(
                    "require expects a module name, got {}",
                    other.map(Value::type_name).unwrap_or("nothing")
                )))
            }
        };
        match modules.get(&name) {
            Some(value) => Ok(freeze(value.clone())),
            None => Err(SandboxError::ModuleNotFound(name)),
        }
    })
}
