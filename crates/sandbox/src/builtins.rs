//! Global bindings available to scripts.
//!
//! The host surface is `mcp.*`, `console.*`, `parallel` and `settle`; the
//! rest is the small standard library scripts need to shape tool results.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as Json;

use crate::interp::{Flow, Interpreter, Scope, iterate, own_entries};
use crate::value::{Completion, Exception, Native, Object, Value, format_number, lock};

/// Upper bound on `String.prototype.repeat` and `padStart` output.
const MAX_STRING_LEN: usize = 1 << 28;

macro_rules! methods {
    ($name:ident { $($variant:ident => $js:literal),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(crate) enum $name {
            $($variant),*
        }

        impl $name {
            pub(crate) fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($js => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

methods!(ArrayMethod {
    Push => "push",
    Pop => "pop",
    Shift => "shift",
    Unshift => "unshift",
    Map => "map",
    Filter => "filter",
    ForEach => "forEach",
    Find => "find",
    FindIndex => "findIndex",
    Some => "some",
    Every => "every",
    Reduce => "reduce",
    Includes => "includes",
    IndexOf => "indexOf",
    Join => "join",
    Slice => "slice",
    Concat => "concat",
    Reverse => "reverse",
    Sort => "sort",
    Flat => "flat",
});

methods!(StringMethod {
    ToUpperCase => "toUpperCase",
    ToLowerCase => "toLowerCase",
    Trim => "trim",
    TrimStart => "trimStart",
    TrimEnd => "trimEnd",
    Split => "split",
    Includes => "includes",
    StartsWith => "startsWith",
    EndsWith => "endsWith",
    Slice => "slice",
    Substring => "substring",
    Replace => "replace",
    ReplaceAll => "replaceAll",
    IndexOf => "indexOf",
    Repeat => "repeat",
    PadStart => "padStart",
    PadEnd => "padEnd",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MathFn {
    Max,
    Min,
    Floor,
    Ceil,
    Round,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    CallTool,
    Log,
    Console(&'static str),
    Parallel,
    Settle,
    PromiseResolve,
    PromiseReject,
    PromiseAll,
    PromiseAllSettled,
    Then,
    Catch,
    Finally,
    Stringify,
    ParseJson,
    Math(MathFn),
    Keys,
    Values,
    Entries,
    Assign,
    IsArray,
    ToStr,
    ToNumber,
    ToBoolean,
    ParseInt,
    ParseFloat,
    IsNaN,
    ValueToString,
    Error(&'static str),
    Array(ArrayMethod),
    Str(StringMethod),
    ToFixed,
}

fn namespace(entries: &[(&str, Builtin)]) -> Value {
    let mut object = Object::default();
    for (name, builtin) in entries {
        object.set(*name, Value::native(*builtin));
    }
    Value::object(object)
}

/// A fresh global scope for one execution.
pub(crate) fn globals() -> Arc<Scope> {
    let scope = Scope::root();

    scope.define(
        "mcp",
        namespace(&[("callTool", Builtin::CallTool), ("log", Builtin::Log)]),
    );
    scope.define(
        "console",
        namespace(&[
            ("log", Builtin::Console("log")),
            ("info", Builtin::Console("info")),
            ("warn", Builtin::Console("warn")),
            ("error", Builtin::Console("error")),
            ("debug", Builtin::Console("debug")),
        ]),
    );
    scope.define("parallel", Value::native(Builtin::Parallel));
    scope.define("settle", Value::native(Builtin::Settle));

    scope.define(
        "Promise",
        namespace(&[
            ("resolve", Builtin::PromiseResolve),
            ("reject", Builtin::PromiseReject),
            ("all", Builtin::PromiseAll),
            ("allSettled", Builtin::PromiseAllSettled),
        ]),
    );
    scope.define(
        "JSON",
        namespace(&[
            ("stringify", Builtin::Stringify),
            ("parse", Builtin::ParseJson),
        ]),
    );

    let mut math = Object::default();
    for (name, function) in [
        ("max", MathFn::Max),
        ("min", MathFn::Min),
        ("floor", MathFn::Floor),
        ("ceil", MathFn::Ceil),
        ("round", MathFn::Round),
        ("abs", MathFn::Abs),
    ] {
        math.set(name, Value::native(Builtin::Math(function)));
    }
    math.set("PI", Value::Number(std::f64::consts::PI));
    scope.define("Math", Value::object(math));

    scope.define(
        "Object",
        namespace(&[
            ("keys", Builtin::Keys),
            ("values", Builtin::Values),
            ("entries", Builtin::Entries),
            ("assign", Builtin::Assign),
        ]),
    );
    scope.define("Array", namespace(&[("isArray", Builtin::IsArray)]));

    scope.define("String", Value::native(Builtin::ToStr));
    scope.define("Number", Value::native(Builtin::ToNumber));
    scope.define("Boolean", Value::native(Builtin::ToBoolean));
    scope.define("parseInt", Value::native(Builtin::ParseInt));
    scope.define("parseFloat", Value::native(Builtin::ParseFloat));
    scope.define("isNaN", Value::native(Builtin::IsNaN));
    for name in ["Error", "TypeError", "RangeError"] {
        scope.define(name, Value::native(Builtin::Error(name)));
    }
    scope.define("NaN", Value::Number(f64::NAN));
    scope.define("Infinity", Value::Number(f64::INFINITY));

    scope
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn callback(args: &[Value]) -> Completion<Value> {
    let f = arg(args, 0);
    if f.is_callable() {
        Ok(f)
    } else {
        Err(Exception::type_error(format!("{} is not a function", f.display())))
    }
}

/// Render console arguments: strings verbatim, everything else as JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string(),
        other => match other.to_json() {
            Ok(Some(json)) if !matches!(other, Value::Number(_)) => json.to_string(),
            _ => other.display(),
        },
    }
}

pub(crate) fn call<'a>(
    interp: &'a Interpreter,
    native: &'a Native,
    args: Vec<Value>,
) -> Flow<'a, Value> {
    async move {
        let this = &native.this;
        match native.builtin {
            Builtin::CallTool => call_tool(interp, &args),
            Builtin::Log => {
                let fields = match arg(&args, 2) {
                    Value::Undefined => None,
                    fields => fields.to_json()?,
                };
                interp.host.logs.push(
                    &arg(&args, 0).display(),
                    &arg(&args, 1).display(),
                    fields.as_ref(),
                );
                Ok(Value::Undefined)
            }
            Builtin::Console(level) => {
                let message = args.iter().map(render).collect::<Vec<_>>().join(" ");
                interp.host.logs.push(level, &message, None);
                Ok(Value::Undefined)
            }
            Builtin::Parallel => Ok(parallel(interp, awaitables(args))),
            Builtin::Settle => Ok(settle(interp, awaitables(args))),
            Builtin::PromiseResolve => Ok(match arg(&args, 0) {
                promise @ Value::Promise(_) => promise,
                value => Value::resolved(value),
            }),
            Builtin::PromiseReject => Ok(Value::rejected(arg(&args, 0))),
            Builtin::PromiseAll => Ok(parallel(interp, iterate(&arg(&args, 0))?)),
            Builtin::PromiseAllSettled => Ok(settle(interp, iterate(&arg(&args, 0))?)),
            Builtin::Then | Builtin::Catch | Builtin::Finally => {
                Ok(reaction(interp, native.builtin, this, &args))
            }
            Builtin::Stringify => stringify(&arg(&args, 0), &arg(&args, 2)),
            Builtin::ParseJson => {
                let text = arg(&args, 0).display();
                serde_json::from_str::<Json>(&text)
                    .map(|json| Value::from_json(&json))
                    .map_err(|err| Exception::error("SyntaxError", err.to_string()))
            }
            Builtin::Math(function) => Ok(Value::Number(math(function, &args))),
            Builtin::Keys => Ok(Value::array(
                own_entries(&arg(&args, 0))
                    .into_iter()
                    .map(|(key, _)| Value::from(key))
                    .collect(),
            )),
            Builtin::Values => Ok(Value::array(
                own_entries(&arg(&args, 0))
                    .into_iter()
                    .map(|(_, value)| value)
                    .collect(),
            )),
            Builtin::Entries => Ok(Value::array(
                own_entries(&arg(&args, 0))
                    .into_iter()
                    .map(|(key, value)| Value::array(vec![Value::from(key), value]))
                    .collect(),
            )),
            Builtin::Assign => {
                let target = arg(&args, 0);
                let Value::Object(object) = &target else {
                    return Err(Exception::type_error("Object.assign target must be an object"));
                };
                for source in args.iter().skip(1) {
                    for (key, value) in own_entries(source) {
                        lock(object).set(key, value);
                    }
                }
                Ok(target)
            }
            Builtin::IsArray => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
            Builtin::ToStr => Ok(match args.first() {
                None => Value::from(""),
                Some(value) => Value::from(value.display()),
            }),
            Builtin::ToNumber => Ok(Value::Number(args.first().map_or(0.0, Value::to_number))),
            Builtin::ToBoolean => Ok(Value::Bool(arg(&args, 0).truthy())),
            Builtin::ParseInt => {
                let radix = match arg(&args, 1) {
                    Value::Undefined => None,
                    radix => Some(radix.to_number()),
                };
                Ok(Value::Number(parse_int(&arg(&args, 0).display(), radix)))
            }
            Builtin::ParseFloat => Ok(Value::Number(parse_float(&arg(&args, 0).display()))),
            Builtin::IsNaN => Ok(Value::Bool(arg(&args, 0).to_number().is_nan())),
            Builtin::ValueToString => Ok(Value::from(this.display())),
            Builtin::Error(name) => {
                let message = match arg(&args, 0) {
                    Value::Undefined => String::new(),
                    message => message.display(),
                };
                Ok(Value::error(name, message))
            }
            Builtin::Array(method) => array_method(interp, method, this, args).await,
            Builtin::Str(method) => {
                let Value::String(s) = this else {
                    return Err(Exception::type_error("not a string"));
                };
                string_method(interp, method, s, args).await
            }
            Builtin::ToFixed => {
                let digits = arg(&args, 0).to_number();
                let digits = if digits.is_nan() { 0.0 } else { digits.trunc() };
                if !(0.0..=100.0).contains(&digits) {
                    return Err(Exception::range_error(
                        "toFixed() digits argument must be between 0 and 100",
                    ));
                }
                let n = this.to_number();
                if !n.is_finite() {
                    return Ok(Value::from(format_number(n)));
                }
                Ok(Value::from(format!("{:.*}", digits as usize, n)))
            }
        }
    }
    .boxed()
}

// --- Host bindings ---

fn call_tool(interp: &Interpreter, args: &[Value]) -> Completion<Value> {
    let Value::String(name) = arg(args, 0) else {
        return Err(Exception::type_error(
            "mcp.callTool expects a tool name string",
        ));
    };
    let params = match arg(args, 1) {
        Value::Undefined | Value::Null => Json::Object(Default::default()),
        params => params.to_json()?.unwrap_or_default(),
    };
    let host = interp.host.clone();
    let name = name.to_string();
    Ok(Value::promise(
        async move { host.call_tool(name, params).await }.boxed(),
    ))
}

/// `parallel(a, b)` and `parallel([a, b])` are equivalent.
fn awaitables(args: Vec<Value>) -> Vec<Value> {
    match args.as_slice() {
        [Value::Array(items)] => lock(items).clone(),
        _ => args,
    }
}

fn parallel(interp: &Interpreter, items: Vec<Value>) -> Value {
    let interp = interp.clone();
    Value::promise(
        async move {
            let values = futures::future::try_join_all(
                items.into_iter().map(|item| interp.await_value(item)),
            )
            .await?;
            Ok(Value::array(values))
        }
        .boxed(),
    )
}

fn settle(interp: &Interpreter, items: Vec<Value>) -> Value {
    let interp = interp.clone();
    Value::promise(
        async move {
            let results =
                futures::future::join_all(items.into_iter().map(|item| interp.await_value(item)))
                    .await;
            let mut settled = Vec::with_capacity(results.len());
            for result in results {
                let entry = match result {
                    Ok(value) => Object::default()
                        .with("status", Value::from("fulfilled"))
                        .with("value", value),
                    Err(Exception::Thrown(reason)) => Object::default()
                        .with("status", Value::from("rejected"))
                        .with("reason", reason),
                    Err(Exception::Cancelled) => return Err(Exception::Cancelled),
                };
                settled.push(Value::object(entry));
            }
            Ok(Value::array(settled))
        }
        .boxed(),
    )
}

/// `.then`, `.catch` and `.finally` on a promise.
fn reaction(interp: &Interpreter, kind: Builtin, source: &Value, args: &[Value]) -> Value {
    let interp = interp.clone();
    let source = source.clone();
    let (first, second) = (arg(args, 0), arg(args, 1));
    Value::promise(
        async move {
            let outcome = interp.await_value(source).await;
            let (handler, input) = match (kind, outcome) {
                (Builtin::Then, Ok(value)) if first.is_callable() => (first, value),
                (Builtin::Then, Err(Exception::Thrown(reason))) if second.is_callable() => {
                    (second, reason)
                }
                (Builtin::Catch, Err(Exception::Thrown(reason))) if first.is_callable() => {
                    (first, reason)
                }
                (Builtin::Finally, outcome) => {
                    if first.is_callable() {
                        let result = interp.call(&first, Vec::new()).await?;
                        interp.await_value(result).await?;
                    }
                    return outcome;
                }
                (_, outcome) => return outcome,
            };
            let result = interp.call(&handler, vec![input]).await?;
            interp.await_value(result).await
        }
        .boxed(),
    )
}

// --- Language library ---

fn stringify(value: &Value, space: &Value) -> Completion<Value> {
    let indent = match space {
        Value::Number(n) if *n >= 1.0 => " ".repeat(n.min(10.0) as usize),
        Value::String(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    let Some(json) = value.to_json()? else {
        return Ok(Value::Undefined);
    };
    if indent.is_empty() {
        return Ok(Value::from(json.to_string()));
    }
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    json.serialize(&mut serializer)
        .map_err(|err| Exception::type_error(err.to_string()))?;
    String::from_utf8(out)
        .map(Value::from)
        .map_err(|err| Exception::type_error(err.to_string()))
}

fn math(function: MathFn, args: &[Value]) -> f64 {
    let numbers = args.iter().map(Value::to_number);
    let x = arg(args, 0).to_number();
    match function {
        MathFn::Max => numbers.fold(f64::NEG_INFINITY, |acc, n| {
            if acc.is_nan() || n.is_nan() {
                f64::NAN
            } else {
                acc.max(n)
            }
        }),
        MathFn::Min => numbers.fold(f64::INFINITY, |acc, n| {
            if acc.is_nan() || n.is_nan() {
                f64::NAN
            } else {
                acc.min(n)
            }
        }),
        MathFn::Floor => x.floor(),
        MathFn::Ceil => x.ceil(),
        MathFn::Round => (x + 0.5).floor(),
        MathFn::Abs => x.abs(),
    }
}

fn parse_int(text: &str, radix: Option<f64>) -> f64 {
    let s = text.trim_start();
    let (negative, mut s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (mut radix, prefix_allowed) = match radix {
        None => (10, true),
        Some(r) if r.is_nan() || r.trunc() == 0.0 => (10, true),
        Some(r) => (r.trunc() as u32, r.trunc() == 16.0),
    };
    if prefix_allowed {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: Vec<u32> = s.chars().map_while(|c| c.to_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .iter()
        .fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(*d));
    if negative { -value } else { value }
}

fn parse_float(text: &str) -> f64 {
    let s = text.trim_start();
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);
    if unsigned.starts_with("Infinity") {
        return if s.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut mantissa_digits = end - int_start;
    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        mantissa_digits += frac_end - frac_start;
        if mantissa_digits > 0 {
            end = frac_end;
        }
    }
    if mantissa_digits == 0 {
        return f64::NAN;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > digits_start {
            end = exp_end;
        }
    }
    s[..end].parse().unwrap_or(f64::NAN)
}

/// Resolve a possibly negative relative index against `len`.
fn relative(len: usize, value: Option<&Value>, default: usize) -> usize {
    match value {
        None | Some(Value::Undefined) => default,
        Some(value) => {
            let n = value.to_number();
            if n.is_nan() {
                0
            } else if n < 0.0 {
                (len as f64 + n.trunc()).max(0.0) as usize
            } else {
                (n.trunc() as usize).min(len)
            }
        }
    }
}

async fn array_method(
    interp: &Interpreter,
    method: ArrayMethod,
    this: &Value,
    args: Vec<Value>,
) -> Completion<Value> {
    let Value::Array(cell) = this else {
        return Err(Exception::type_error("not an array"));
    };
    let snapshot = || lock(cell).clone();
    let index = |i: usize| Value::Number(i as f64);

    match method {
        ArrayMethod::Push => {
            let mut items = lock(cell);
            items.extend(args);
            Ok(index(items.len()))
        }
        ArrayMethod::Pop => Ok(lock(cell).pop().unwrap_or(Value::Undefined)),
        ArrayMethod::Shift => {
            let mut items = lock(cell);
            Ok(if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            })
        }
        ArrayMethod::Unshift => {
            let mut items = lock(cell);
            items.splice(0..0, args);
            Ok(index(items.len()))
        }
        ArrayMethod::Map => {
            let f = callback(&args)?;
            let items = snapshot();
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                out.push(interp.call(&f, vec![item, index(i), this.clone()]).await?);
            }
            Ok(Value::array(out))
        }
        ArrayMethod::Filter => {
            let f = callback(&args)?;
            let mut out = Vec::new();
            for (i, item) in snapshot().into_iter().enumerate() {
                let keep = interp
                    .call(&f, vec![item.clone(), index(i), this.clone()])
                    .await?;
                if keep.truthy() {
                    out.push(item);
                }
            }
            Ok(Value::array(out))
        }
        ArrayMethod::ForEach => {
            let f = callback(&args)?;
            for (i, item) in snapshot().into_iter().enumerate() {
                interp.call(&f, vec![item, index(i), this.clone()]).await?;
            }
            Ok(Value::Undefined)
        }
        ArrayMethod::Find
        | ArrayMethod::FindIndex
        | ArrayMethod::Some
        | ArrayMethod::Every => {
            let f = callback(&args)?;
            for (i, item) in snapshot().into_iter().enumerate() {
                let hit = interp
                    .call(&f, vec![item.clone(), index(i), this.clone()])
                    .await?
                    .truthy();
                match method {
                    ArrayMethod::Find if hit => return Ok(item),
                    ArrayMethod::FindIndex if hit => return Ok(index(i)),
                    ArrayMethod::Some if hit => return Ok(Value::Bool(true)),
                    ArrayMethod::Every if !hit => return Ok(Value::Bool(false)),
                    _ => {}
                }
            }
            Ok(match method {
                ArrayMethod::Find => Value::Undefined,
                ArrayMethod::FindIndex => Value::Number(-1.0),
                ArrayMethod::Some => Value::Bool(false),
                _ => Value::Bool(true),
            })
        }
        ArrayMethod::Reduce => {
            let f = callback(&args)?;
            let mut items = snapshot().into_iter().enumerate();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match items.next() {
                    Some((_, first)) => first,
                    None => {
                        return Err(Exception::type_error(
                            "Reduce of empty array with no initial value",
                        ));
                    }
                },
            };
            for (i, item) in items {
                acc = interp
                    .call(&f, vec![acc, item, index(i), this.clone()])
                    .await?;
            }
            Ok(acc)
        }
        ArrayMethod::Includes => {
            let needle = arg(&args, 0);
            Ok(Value::Bool(
                snapshot().iter().any(|item| item.same_value_zero(&needle)),
            ))
        }
        ArrayMethod::IndexOf => {
            let needle = arg(&args, 0);
            Ok(snapshot()
                .iter()
                .position(|item| item.strict_equals(&needle))
                .map_or(Value::Number(-1.0), index))
        }
        ArrayMethod::Join => {
            let separator = match arg(&args, 0) {
                Value::Undefined => ",".to_string(),
                separator => separator.display(),
            };
            let parts: Vec<String> = snapshot()
                .iter()
                .map(|item| {
                    if item.is_nullish() {
                        String::new()
                    } else {
                        item.display()
                    }
                })
                .collect();
            Ok(Value::from(parts.join(&separator)))
        }
        ArrayMethod::Slice => {
            let items = snapshot();
            let start = relative(items.len(), args.first(), 0);
            let end = relative(items.len(), args.get(1), items.len());
            Ok(Value::array(if start < end {
                items[start..end].to_vec()
            } else {
                Vec::new()
            }))
        }
        ArrayMethod::Concat => {
            let mut out = snapshot();
            for item in args {
                match &item {
                    Value::Array(other) => {
                        let other = lock(other).clone();
                        out.extend(other);
                    }
                    _ => out.push(item),
                }
            }
            Ok(Value::array(out))
        }
        ArrayMethod::Reverse => {
            lock(cell).reverse();
            Ok(this.clone())
        }
        ArrayMethod::Sort => {
            let sorted = sort(interp, snapshot(), args.first()).await?;
            *lock(cell) = sorted;
            Ok(this.clone())
        }
        ArrayMethod::Flat => {
            let depth = match arg(&args, 0) {
                Value::Undefined => 1.0,
                depth => depth.to_number(),
            };
            let mut out = Vec::new();
            flatten(snapshot(), depth.min(64.0), &mut out);
            Ok(Value::array(out))
        }
    }
}

fn flatten(items: Vec<Value>, depth: f64, out: &mut Vec<Value>) {
    for item in items {
        let nested = match &item {
            Value::Array(inner) if depth >= 1.0 => Some(lock(inner).clone()),
            _ => None,
        };
        match nested {
            Some(inner) => flatten(inner, depth - 1.0, out),
            None => out.push(item),
        }
    }
}

/// Stable binary-insertion sort; `undefined` sorts last.
async fn sort(
    interp: &Interpreter,
    items: Vec<Value>,
    comparator: Option<&Value>,
) -> Completion<Vec<Value>> {
    let (defined, undefined): (Vec<Value>, Vec<Value>) = items
        .into_iter()
        .partition(|item| !matches!(item, Value::Undefined));

    let mut sorted: Vec<Value> = Vec::with_capacity(defined.len() + undefined.len());
    for item in defined {
        let (mut lo, mut hi) = (0, sorted.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if compare(interp, comparator, &item, &sorted[mid]).await? == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        sorted.insert(lo, item);
    }
    sorted.extend(undefined);
    Ok(sorted)
}

async fn compare(
    interp: &Interpreter,
    comparator: Option<&Value>,
    a: &Value,
    b: &Value,
) -> Completion<Ordering> {
    match comparator {
        Some(f) if f.is_callable() => {
            let n = interp
                .call(f, vec![a.clone(), b.clone()])
                .await?
                .to_number();
            Ok(n.partial_cmp(&0.0).unwrap_or(Ordering::Equal))
        }
        _ => Ok(a.display().cmp(&b.display())),
    }
}

fn char_slice(s: &str, start: usize, end: usize) -> String {
    s.chars().skip(start).take(end.saturating_sub(start)).collect()
}

fn char_index(s: &str, byte: usize) -> usize {
    s[..byte].chars().count()
}

async fn replacement(
    interp: &Interpreter,
    with: &Value,
    matched: &str,
    position: usize,
) -> Completion<String> {
    if with.is_callable() {
        let result = interp
            .call(with, vec![Value::from(matched), Value::Number(position as f64)])
            .await?;
        Ok(result.display())
    } else {
        Ok(with.display())
    }
}

fn pad(s: &str, target: &Value, fill: &Value) -> Completion<Option<String>> {
    let target = target.to_number();
    let len = s.chars().count();
    let fill = match fill {
        Value::Undefined => " ".to_string(),
        fill => fill.display(),
    };
    if target.is_nan() || target <= len as f64 || fill.is_empty() {
        return Ok(None);
    }
    if target > MAX_STRING_LEN as f64 {
        return Err(Exception::range_error("Invalid string length"));
    }
    let needed = target as usize - len;
    Ok(Some(fill.chars().cycle().take(needed).collect()))
}

async fn string_method(
    interp: &Interpreter,
    method: StringMethod,
    s: &str,
    args: Vec<Value>,
) -> Completion<Value> {
    let len = s.chars().count();
    let text = |index: usize| arg(&args, index).display();

    let value = match method {
        StringMethod::ToUpperCase => Value::from(s.to_uppercase()),
        StringMethod::ToLowerCase => Value::from(s.to_lowercase()),
        StringMethod::Trim => Value::from(s.trim()),
        StringMethod::TrimStart => Value::from(s.trim_start()),
        StringMethod::TrimEnd => Value::from(s.trim_end()),
        StringMethod::Split => {
            let limit = match arg(&args, 1) {
                Value::Undefined => usize::MAX,
                limit => limit.to_number().max(0.0) as usize,
            };
            let parts: Vec<Value> = match arg(&args, 0) {
                Value::Undefined => vec![Value::from(s)],
                separator => {
                    let separator = separator.display();
                    if separator.is_empty() {
                        s.chars().map(|c| Value::from(c.to_string())).collect()
                    } else {
                        s.split(separator.as_str()).map(Value::from).collect()
                    }
                }
            };
            Value::array(parts.into_iter().take(limit).collect())
        }
        StringMethod::Includes => Value::Bool(s.contains(text(0).as_str())),
        StringMethod::StartsWith => {
            let start = relative(len, args.get(1), 0);
            Value::Bool(char_slice(s, start, len).starts_with(text(0).as_str()))
        }
        StringMethod::EndsWith => {
            let end = relative(len, args.get(1), len);
            Value::Bool(char_slice(s, 0, end).ends_with(text(0).as_str()))
        }
        StringMethod::Slice => {
            let start = relative(len, args.first(), 0);
            let end = relative(len, args.get(1), len);
            Value::from(char_slice(s, start, end))
        }
        StringMethod::Substring => {
            let clamp = |value: Option<&Value>, default: usize| match value {
                None | Some(Value::Undefined) => default,
                Some(value) => {
                    let n = value.to_number();
                    if n.is_nan() || n < 0.0 {
                        0
                    } else {
                        (n.trunc() as usize).min(len)
                    }
                }
            };
            let (a, b) = (clamp(args.first(), 0), clamp(args.get(1), len));
            Value::from(char_slice(s, a.min(b), a.max(b)))
        }
        StringMethod::Replace => {
            let pattern = text(0);
            match s.find(pattern.as_str()) {
                Some(byte) => {
                    let with =
                        replacement(interp, &arg(&args, 1), &pattern, char_index(s, byte)).await?;
                    let mut out = String::with_capacity(s.len());
                    out.push_str(&s[..byte]);
                    out.push_str(&with);
                    out.push_str(&s[byte + pattern.len()..]);
                    Value::from(out)
                }
                None => Value::from(s),
            }
        }
        StringMethod::ReplaceAll => {
            let pattern = text(0);
            if pattern.is_empty() {
                return Err(Exception::type_error("replaceAll requires a non-empty pattern"));
            }
            let with = arg(&args, 1);
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for (byte, matched) in s.match_indices(pattern.as_str()) {
                out.push_str(&s[last..byte]);
                out.push_str(&replacement(interp, &with, matched, char_index(s, byte)).await?);
                last = byte + matched.len();
            }
            out.push_str(&s[last..]);
            Value::from(out)
        }
        StringMethod::IndexOf => {
            let needle = text(0);
            Value::Number(
                s.find(needle.as_str())
                    .map_or(-1.0, |byte| char_index(s, byte) as f64),
            )
        }
        StringMethod::Repeat => {
            let count = arg(&args, 0).to_number();
            let count = if count.is_nan() { 0.0 } else { count.trunc() };
            if count < 0.0 || count.is_infinite() {
                return Err(Exception::range_error(format!(
                    "Invalid count value: {}",
                    format_number(count)
                )));
            }
            if count * s.len() as f64 > MAX_STRING_LEN as f64 {
                return Err(Exception::range_error("Invalid string length"));
            }
            Value::from(s.repeat(count as usize))
        }
        StringMethod::PadStart => match pad(s, &arg(&args, 0), &arg(&args, 1))? {
            Some(padding) => Value::from(padding + s),
            None => Value::from(s),
        },
        StringMethod::PadEnd => match pad(s, &arg(&args, 0), &arg(&args, 1))? {
            Some(padding) => Value::from(format!("{s}{padding}")),
            None => Value::from(s),
        },
    };
    Ok(value)
}
