//! Runtime values of the script language.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::{Map, Number, Value as Json};

use crate::ast::FunctionDef;
use crate::builtins::Builtin;
use crate::interp::Scope;

/// Nesting bound for recursive conversions; deeper structures are treated as cyclic.
const MAX_DEPTH: usize = 128;

/// Lock a mutex, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Abrupt completion of an evaluation.
#[derive(Debug, Clone)]
pub enum Exception {
    /// A script-visible throw, catchable by `try/catch`.
    Thrown(Value),
    /// The execution deadline passed. Never catchable.
    Cancelled,
}

impl Exception {
    pub fn error(name: &str, message: impl Into<String>) -> Self {
        Exception::Thrown(Value::error(name, message))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::error("TypeError", message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::error("RangeError", message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::error("ReferenceError", message)
    }
}

pub type Completion<T> = Result<T, Exception>;

pub type PromiseFuture = Shared<BoxFuture<'static, Completion<Value>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Plain,
    Error,
}

/// An ordered property bag.
#[derive(Debug, Clone)]
pub struct Object {
    pub kind: ObjectKind,
    props: Vec<(String, Value)>,
}

impl Default for Object {
    fn default() -> Self {
        Self::new(ObjectKind::Plain)
    }
}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            props: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.props.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.props.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.props
    }
}

/// A script function together with the scope it closes over.
pub struct Closure {
    pub def: Arc<FunctionDef>,
    pub scope: Arc<Scope>,
}

/// A host function, optionally bound to the value it was read from.
pub struct Native {
    pub builtin: Builtin,
    pub this: Value,
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Array(Arc<Mutex<Vec<Value>>>),
    Object(Arc<Mutex<Object>>),
    Function(Arc<Closure>),
    Native(Arc<Native>),
    Promise(PromiseFuture),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Function(_) | Value::Native(_) => f.write_str("[Function]"),
            Value::Promise(_) => f.write_str("[Promise]"),
            other => match other.to_json() {
                Ok(Some(json)) => write!(f, "{json}"),
                _ => write!(f, "{}", other.display()),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
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

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(object: Object) -> Self {
        Value::Object(Arc::new(Mutex::new(object)))
    }

    pub fn native(builtin: Builtin) -> Self {
        Self::bound(builtin, Value::Undefined)
    }

    pub fn bound(builtin: Builtin, this: Value) -> Self {
        Value::Native(Arc::new(Native { builtin, this }))
    }

    pub fn promise(future: BoxFuture<'static, Completion<Value>>) -> Self {
        Value::Promise(future.shared())
    }

    pub fn resolved(value: Value) -> Self {
        Self::promise(futures::future::ready(Ok(value)).boxed())
    }

    pub fn rejected(reason: Value) -> Self {
        Self::promise(futures::future::ready(Err(Exception::Thrown(reason))).boxed())
    }

    /// An error object with `name` and `message` properties.
    pub fn error(name: &str, message: impl Into<String>) -> Self {
        let object = Object::new(ObjectKind::Error)
            .with("name", name.into())
            .with("message", Value::from(message.into()));
        Value::object(object)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) | Value::Native(_) => "function",
            Value::Array(_) | Value::Object(_) | Value::Promise(_) => "object",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(items) => {
                let items = lock(items).clone();
                match items.as_slice() {
                    [] => 0.0,
                    [single] => parse_number(&single.display()),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// String conversion, as `String(value)` performs it.
    pub fn display(&self) -> String {
        self.display_at(0)
    }

    fn display_at(&self, depth: usize) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Array(items) => {
                if depth > MAX_DEPTH {
                    return String::new();
                }
                let items = lock(items).clone();
                items
                    .iter()
                    .map(|item| match item {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.display_at(depth + 1),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(object) => {
                let (kind, name, message) = {
                    let object = lock(object);
                    (
                        object.kind,
                        object.get("name").cloned(),
                        object.get("message").cloned(),
                    )
                };
                match kind {
                    ObjectKind::Error => {
                        let name = name.map_or("Error".into(), |n| n.display_at(depth + 1));
                        match message.map(|m| m.display_at(depth + 1)) {
                            Some(message) if !message.is_empty() => format!("{name}: {message}"),
                            _ => name,
                        }
                    }
                    ObjectKind::Plain => "[object Object]".into(),
                }
            }
            Value::Function(closure) => match &closure.def.name {
                Some(name) => format!("function {name}() {{ [code] }}"),
                None => "function () { [code] }".into(),
            },
            Value::Native(_) => "function () { [native code] }".into(),
            Value::Promise(_) => "[object Promise]".into(),
        }
    }

    /// The text reported for an uncaught throw of this value.
    pub fn error_message(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            Value::Object(object) => {
                let message = lock(object).get("message").cloned();
                match message {
                    Some(Value::String(s)) => s.to_string(),
                    _ => self.to_json_string(),
                }
            }
            Value::Array(_) => self.to_json_string(),
            other => other.display(),
        }
    }

    fn to_json_string(&self) -> String {
        match self.to_json() {
            Ok(Some(json)) => json.to_string(),
            _ => self.display(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => {
                Arc::ptr_eq(a, b) || (a.builtin == b.builtin && a.this.strict_equals(&b.this))
            }
            _ => false,
        }
    }

    /// `SameValueZero`, as used by `includes`.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
                self.to_number() == other.to_number()
            }
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Value::Bool(_)) => self.loose_equals(&Value::Number(other.to_number())),
            (Value::Array(_) | Value::Object(_), Value::Number(_) | Value::String(_)) => {
                Value::from(self.display()).loose_equals(other)
            }
            (Value::Number(_) | Value::String(_), Value::Array(_) | Value::Object(_)) => {
                self.loose_equals(&Value::from(other.display()))
            }
            _ => self.strict_equals(other),
        }
    }

    /// Primitive conversion used by `+` and relational operators.
    pub fn to_primitive(&self) -> Value {
        match self {
            Value::Array(_)
            | Value::Object(_)
            | Value::Function(_)
            | Value::Native(_)
            | Value::Promise(_) => Value::from(self.display()),
            other => other.clone(),
        }
    }

    /// Convert to JSON. `None` for values JSON cannot represent (`undefined`, functions).
    pub fn to_json(&self) -> Completion<Option<Json>> {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Completion<Option<Json>> {
        if depth > MAX_DEPTH {
            return Err(Exception::type_error(
                "Converting circular structure to JSON",
            ));
        }
        let json = match self {
            Value::Undefined | Value::Function(_) | Value::Native(_) => return Ok(None),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.to_string()),
            Value::Array(items) => {
                let items = lock(items).clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(item.to_json_at(depth + 1)?.unwrap_or(Json::Null));
                }
                Json::Array(out)
            }
            Value::Object(object) => {
                let entries = lock(object).entries().to_vec();
                let mut out = Map::new();
                for (key, value) in &entries {
                    if let Some(json) = value.to_json_at(depth + 1)? {
                        out.insert(key.clone(), json);
                    }
                }
                Json::Object(out)
            }
            Value::Promise(_) => Json::Object(Map::new()),
        };
        Ok(Some(json))
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::from(s.as_str()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let mut object = Object::default();
                for (key, value) in map {
                    object.set(key.clone(), Value::from_json(value));
                }
                Value::object(object)
            }
        }
    }
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        // Integral values serialize without a trailing `.0`.
        return Json::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Json::Null, Json::Number)
}

/// Format a number the way scripts print it: `3`, `0.5`, `NaN`, `1e+21`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if (1e-6..1e21).contains(&abs) {
        return format!("{n}");
    }
    let formatted = format!("{n:e}");
    match formatted.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => formatted,
    }
}

/// String-to-number conversion: whitespace trimmed, empty is zero, hex accepted.
pub fn parse_number(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() {
        return 0.0;
    }
    match s {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
    }
    let lower = s.to_ascii_lowercase();
    if lower.contains("inf") || lower.contains("nan") {
        return f64::NAN;
    }
    s.parse().unwrap_or(f64::NAN)
}

/// Canonical array index for a property key, if it is one.
pub fn array_index(key: &str) -> Option<usize> {
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_format_like_scripts_print_them() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn string_to_number_conversion() {
        assert_eq!(parse_number("  42 "), 42.0);
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("0x1f"), 31.0);
        assert!(parse_number("inf").is_nan());
        assert!(parse_number("12px").is_nan());
    }

    #[test]
    fn json_conversion_keeps_integers_and_drops_undefined() {
        let object = Object::default()
            .with("n", Value::Number(2.0))
            .with("skip", Value::Undefined)
            .with("list", Value::array(vec![Value::Undefined, Value::from("x")]));
        let json = Value::object(object).to_json().unwrap().unwrap();
        assert_eq!(json, json!({"n": 2, "list": [null, "x"]}));
    }

    #[test]
    fn cyclic_structures_fail_json_conversion() {
        let array = Value::array(Vec::new());
        if let Value::Array(items) = &array {
            lock(items).push(array.clone());
        }
        assert!(matches!(array.to_json(), Err(Exception::Thrown(_))));
    }

    #[test]
    fn loose_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(Value::from("1").loose_equals(&Value::Number(1.0)));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
    }

    #[test]
    fn error_values_render_name_and_message() {
        let err = Value::error("TypeError", "boom");
        assert_eq!(err.display(), "TypeError: boom");
        assert_eq!(err.error_message(), "boom");
        assert_eq!(Value::from("plain").error_message(), "plain");
    }

    #[test]
    fn array_index_is_canonical() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("12"), Some(12));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("length"), None);
    }
}
