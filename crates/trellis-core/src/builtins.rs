//! Pure builtins: global functions, the `math`/`date`/`json` namespaces
//! and the non-callback methods of strings, lists and objects.
//!
//! Methods that take a callback (`map`, `filter`, `reduce`, ...) need the
//! interpreter to call back into script code and live in the evaluator.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::provider::CallArgs;
use crate::value::{BuiltinFunction, StaticNamespace, Value};

/// Largest list `range` will build.
const MAX_RANGE: i64 = 1_000_000;

pub const MATH_FUNCTIONS: [&str; 10] = ["abs", "floor", "ceil", "round", "min", "max", "pow", "sqrt", "clamp", "sum"];
pub const DATE_FUNCTIONS: [&str; 7] = ["now", "today", "timestamp", "format", "parse", "addDays", "diffDays"];
pub const JSON_FUNCTIONS: [&str; 3] = ["parse", "stringify", "pretty"];

pub const LIST_METHODS: [&str; 19] = [
    "map", "filter", "reduce", "forEach", "find", "some", "every", "includes", "indexOf", "join", "slice",
    "reverse", "sort", "first", "last", "push", "pop", "concat", "length",
];
pub const STRING_METHODS: [&str; 10] = [
    "length", "upper", "lower", "trim", "split", "includes", "startsWith", "endsWith", "replace", "slice",
];
pub const OBJECT_METHODS: [&str; 6] = ["keys", "values", "entries", "has", "get", "length"];

fn type_error(message: impl Into<String>, line: usize) -> ExecutionError {
    ExecutionError::type_error(message, line)
}

/// Checks the positional count and rejects named arguments.
fn arity(name: &str, args: &CallArgs, min: usize, max: usize, line: usize) -> Result<(), ExecutionError> {
    if !args.named.is_empty() {
        return Err(ExecutionError::new(
            ExecutionErrorKind::Arity,
            format!("{} does not take named arguments", name),
            line,
        ));
    }
    let n = args.positional.len();
    if n < min || n > max {
        let expected = if min == max {
            format!("{}", min)
        } else if max == usize::MAX {
            format!("at least {}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(ExecutionError::new(
            ExecutionErrorKind::Arity,
            format!("{} expects {} argument(s), got {}", name, expected, n),
            line,
        ));
    }
    Ok(())
}

fn number(name: &str, value: &Value, line: usize) -> Result<f64, ExecutionError> {
    value
        .as_f64()
        .ok_or_else(|| type_error(format!("{} expects a number, got {}", name, value.type_name()), line))
}

fn integer(name: &str, value: &Value, line: usize) -> Result<i64, ExecutionError> {
    match value {
        Value::Integer(n) => Ok(*n),
        other => other
            .as_i64()
            .ok_or_else(|| type_error(format!("{} expects an integer, got {}", name, other.type_name()), line)),
    }
}

fn text<'a>(name: &str, value: &'a Value, line: usize) -> Result<&'a str, ExecutionError> {
    value
        .as_str()
        .ok_or_else(|| type_error(format!("{} expects a string, got {}", name, value.type_name()), line))
}

fn float_to_integer(n: f64, line: usize) -> Result<Value, ExecutionError> {
    if n.is_finite() && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Ok(Value::Integer(n as i64))
    } else {
        Err(type_error(format!("{} does not fit in an integer", n), line))
    }
}

/// Ordering used by comparisons and `sort`: numbers with numbers, strings
/// with strings. Anything else is unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

/// Resolves a JS-style `slice` bound against `len`; negatives count from the end.
fn slice_bound(index: i64, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs() as usize)
    } else {
        (index as usize).min(len)
    }
}

fn slice_range(name: &str, args: &CallArgs, len: usize, line: usize) -> Result<(usize, usize), ExecutionError> {
    arity(name, args, 0, 2, line)?;
    let start = match args.positional.first() {
        Some(v) => slice_bound(integer(name, v, line)?, len),
        None => 0,
    };
    let end = match args.positional.get(1) {
        Some(v) => slice_bound(integer(name, v, line)?, len),
        None => len,
    };
    Ok((start, end.max(start)))
}

pub fn call_builtin(func: BuiltinFunction, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    let name = func.name();
    match func {
        BuiltinFunction::Len => {
            arity(name, args, 1, 1, line)?;
            match &args.positional[0] {
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Integer(items.len() as i64)),
                Value::Object(map) => Ok(Value::Integer(map.len() as i64)),
                other => Err(type_error(format!("len() of {}", other.type_name()), line)),
            }
        }
        BuiltinFunction::Str => {
            arity(name, args, 1, 1, line)?;
            Ok(Value::String(args.positional[0].as_text()))
        }
        BuiltinFunction::Int => {
            arity(name, args, 1, 1, line)?;
            match &args.positional[0] {
                Value::Integer(n) => Ok(Value::Integer(*n)),
                Value::Float(n) => float_to_integer(n.trunc(), line),
                Value::Bool(b) => Ok(Value::Integer(*b as i64)),
                Value::String(s) => {
                    let s = s.trim();
                    match s.parse::<i64>() {
                        Ok(n) => Ok(Value::Integer(n)),
                        Err(_) => match s.parse::<f64>() {
                            Ok(n) => float_to_integer(n.trunc(), line),
                            Err(_) => Err(type_error(format!("cannot convert '{}' to an integer", s), line)),
                        },
                    }
                }
                other => Err(type_error(format!("cannot convert {} to an integer", other.type_name()), line)),
            }
        }
        BuiltinFunction::Float => {
            arity(name, args, 1, 1, line)?;
            match &args.positional[0] {
                Value::Integer(n) => Ok(Value::Float(*n as f64)),
                Value::Float(n) => Ok(Value::Float(*n)),
                Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| type_error(format!("cannot convert '{}' to a float", s), line)),
                other => Err(type_error(format!("cannot convert {} to a float", other.type_name()), line)),
            }
        }
        BuiltinFunction::Typeof => {
            arity(name, args, 1, 1, line)?;
            Ok(Value::string(args.positional[0].type_name()))
        }
        BuiltinFunction::Range => {
            arity(name, args, 1, 3, line)?;
            let ints = args
                .positional
                .iter()
                .map(|v| integer(name, v, line))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, end, step) = match ints.as_slice() {
                [end] => (0, *end, 1),
                [start, end] => (*start, *end, 1),
                [start, end, step] => (*start, *end, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(type_error("range() step must not be zero", line));
            }
            let count = if (step > 0 && end > start) || (step < 0 && end < start) {
                ((end as i128 - start as i128).abs() + step.unsigned_abs() as i128 - 1) / step.unsigned_abs() as i128
            } else {
                0
            };
            if count > MAX_RANGE as i128 {
                return Err(type_error(format!("range() of {} elements is too large", count), line));
            }
            Ok(Value::List(
                (0..count as i64).map(|i| Value::Integer(start + i * step)).collect(),
            ))
        }
    }
}

/// Whether `name` is a function or constant of `ns`.
pub fn has_static_member(ns: StaticNamespace, name: &str) -> bool {
    match ns {
        StaticNamespace::Math => name == "PI" || name == "E" || MATH_FUNCTIONS.contains(&name),
        StaticNamespace::Date => DATE_FUNCTIONS.contains(&name),
        StaticNamespace::Json => JSON_FUNCTIONS.contains(&name),
    }
}

/// Reads `ns.name` without calling it. Functions come back as capabilities.
pub fn static_member(ns: StaticNamespace, name: &str) -> Option<Value> {
    match (ns, name) {
        (StaticNamespace::Math, "PI") => Some(Value::Float(std::f64::consts::PI)),
        (StaticNamespace::Math, "E") => Some(Value::Float(std::f64::consts::E)),
        _ if has_static_member(ns, name) => Some(Value::Capability {
            namespace: ns.name().to_string(),
            method: name.to_string(),
        }),
        _ => None,
    }
}

pub fn call_static(ns: StaticNamespace, method: &str, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    let qualified = format!("{}.{}", ns.name(), method);
    match ns {
        StaticNamespace::Math => call_math(&qualified, method, args, line),
        StaticNamespace::Date => call_date(&qualified, method, args, line),
        StaticNamespace::Json => call_json(&qualified, method, args, line),
    }
}

fn numbers_of(name: &str, args: &CallArgs, line: usize) -> Result<Vec<Value>, ExecutionError> {
    let values = match args.positional.as_slice() {
        [Value::List(items)] => items.clone(),
        other => other.to_vec(),
    };
    for v in &values {
        number(name, v, line)?;
    }
    Ok(values)
}

fn call_math(name: &str, method: &str, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    match method {
        "abs" => {
            arity(name, args, 1, 1, line)?;
            match &args.positional[0] {
                Value::Integer(n) => n
                    .checked_abs()
                    .map(Value::Integer)
                    .ok_or_else(|| type_error("integer overflow in math.abs", line)),
                other => Ok(Value::Float(number(name, other, line)?.abs())),
            }
        }
        "floor" | "ceil" | "round" => {
            arity(name, args, 1, 1, line)?;
            match &args.positional[0] {
                Value::Integer(n) => Ok(Value::Integer(*n)),
                other => {
                    let n = number(name, other, line)?;
                    let rounded = match method {
                        "floor" => n.floor(),
                        "ceil" => n.ceil(),
                        _ => n.round(),
                    };
                    float_to_integer(rounded, line)
                }
            }
        }
        "min" | "max" => {
            arity(name, args, 1, usize::MAX, line)?;
            let values = numbers_of(name, args, line)?;
            let mut best: Option<Value> = None;
            for v in values {
                best = match best {
                    None => Some(v),
                    Some(b) => {
                        let ord = compare(&v, &b).unwrap_or(Ordering::Equal);
                        let replace = if method == "min" { ord == Ordering::Less } else { ord == Ordering::Greater };
                        Some(if replace { v } else { b })
                    }
                };
            }
            best.ok_or_else(|| type_error(format!("{} of an empty list", name), line))
        }
        "sum" => {
            arity(name, args, 1, usize::MAX, line)?;
            let values = numbers_of(name, args, line)?;
            let mut int_total: Option<i64> = Some(0);
            let mut float_total = 0.0;
            for v in &values {
                int_total = match (int_total, v) {
                    (Some(t), Value::Integer(n)) => t.checked_add(*n),
                    _ => None,
                };
                float_total += v.as_f64().unwrap_or(0.0);
            }
            Ok(match int_total {
                Some(t) => Value::Integer(t),
                None => Value::Float(float_total),
            })
        }
        "pow" => {
            arity(name, args, 2, 2, line)?;
            match (&args.positional[0], &args.positional[1]) {
                (Value::Integer(base), Value::Integer(exp)) if *exp >= 0 => {
                    let exact = u32::try_from(*exp).ok().and_then(|e| base.checked_pow(e));
                    Ok(match exact {
                        Some(n) => Value::Integer(n),
                        None => Value::Float((*base as f64).powf(*exp as f64)),
                    })
                }
                (base, exp) => Ok(Value::Float(number(name, base, line)?.powf(number(name, exp, line)?))),
            }
        }
        "sqrt" => {
            arity(name, args, 1, 1, line)?;
            let n = number(name, &args.positional[0], line)?;
            if n < 0.0 {
                return Err(type_error("math.sqrt of a negative number", line));
            }
            Ok(Value::Float(n.sqrt()))
        }
        "clamp" => {
            arity(name, args, 3, 3, line)?;
            let (value, low, high) = (&args.positional[0], &args.positional[1], &args.positional[2]);
            for v in [value, low, high] {
                number(name, v, line)?;
            }
            if compare(low, high) == Some(Ordering::Greater) {
                return Err(type_error("math.clamp lower bound is above upper bound", line));
            }
            Ok(if compare(value, low) == Some(Ordering::Less) {
                low.clone()
            } else if compare(value, high) == Some(Ordering::Greater) {
                high.clone()
            } else {
                value.clone()
            })
        }
        _ => Err(unknown_member(name, line)),
    }
}

fn unknown_member(name: &str, line: usize) -> ExecutionError {
    ExecutionError::new(ExecutionErrorKind::UndefinedName, format!("{} does not exist", name), line)
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
/// The flag reports whether the input was a bare date.
fn parse_instant(name: &str, value: &Value, line: usize) -> Result<(DateTime<Utc>, bool), ExecutionError> {
    let s = text(name, value, line)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok((dt.with_timezone(&Utc), false));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| (dt.and_utc(), true))
        .ok_or_else(|| type_error(format!("{}: '{}' is not an RFC 3339 timestamp or date", name, s), line))
}

fn format_instant(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn call_date(name: &str, method: &str, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    match method {
        "now" => {
            arity(name, args, 0, 0, line)?;
            Ok(Value::String(format_instant(Utc::now())))
        }
        "today" => {
            arity(name, args, 0, 0, line)?;
            Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string()))
        }
        "timestamp" => {
            arity(name, args, 0, 0, line)?;
            Ok(Value::Integer(Utc::now().timestamp_millis()))
        }
        "format" => {
            arity(name, args, 2, 2, line)?;
            let (dt, _) = parse_instant(name, &args.positional[0], line)?;
            let pattern = text(name, &args.positional[1], line)?;
            let mut out = String::new();
            write!(out, "{}", dt.format(pattern))
                .map_err(|_| type_error(format!("{}: invalid format '{}'", name, pattern), line))?;
            Ok(Value::String(out))
        }
        "parse" => {
            arity(name, args, 2, 2, line)?;
            let input = text(name, &args.positional[0], line)?;
            let pattern = text(name, &args.positional[1], line)?;
            let parsed = NaiveDateTime::parse_from_str(input, pattern).or_else(|_| {
                NaiveDate::parse_from_str(input, pattern)
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            });
            parsed
                .map(|dt| Value::String(format_instant(dt.and_utc())))
                .map_err(|e| type_error(format!("{}: cannot parse '{}' as '{}': {}", name, input, pattern, e), line))
        }
        "addDays" => {
            arity(name, args, 2, 2, line)?;
            let (dt, date_only) = parse_instant(name, &args.positional[0], line)?;
            let days = integer(name, &args.positional[1], line)?;
            let shifted = TimeDelta::try_days(days)
                .and_then(|delta| dt.checked_add_signed(delta))
                .ok_or_else(|| type_error(format!("{}: {} days is out of range", name, days), line))?;
            Ok(Value::String(if date_only {
                shifted.format("%Y-%m-%d").to_string()
            } else {
                format_instant(shifted)
            }))
        }
        "diffDays" => {
            arity(name, args, 2, 2, line)?;
            let (from, _) = parse_instant(name, &args.positional[0], line)?;
            let (to, _) = parse_instant(name, &args.positional[1], line)?;
            Ok(Value::Integer((to - from).num_days()))
        }
        _ => Err(unknown_member(name, line)),
    }
}

fn call_json(name: &str, method: &str, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    arity(name, args, 1, 1, line)?;
    let value = &args.positional[0];
    match method {
        "parse" => {
            let source = text(name, value, line)?;
            serde_json::from_str::<serde_json::Value>(source)
                .map(|json| Value::from_json(&json))
                .map_err(|e| type_error(format!("json.parse: {}", e), line))
        }
        "stringify" => Ok(Value::String(value.to_json().to_string())),
        "pretty" => serde_json::to_string_pretty(&value.to_json())
            .map(Value::String)
            .map_err(|e| type_error(format!("json.pretty: {}", e), line)),
        _ => Err(unknown_member(name, line)),
    }
}

/// Sorts values that all share one ordering.
pub fn natural_sort(mut items: Vec<Value>, line: usize) -> Result<Vec<Value>, ExecutionError> {
    for pair in items.windows(2) {
        if compare(&pair[0], &pair[1]).is_none() {
            return Err(type_error(
                format!("cannot sort {} with {}", pair[0].type_name(), pair[1].type_name()),
                line,
            ));
        }
    }
    items.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
    Ok(items)
}

/// List methods that need no callback and do not modify the receiver.
pub fn list_method(items: &[Value], method: &str, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    let name = format!("list.{}", method);
    match method {
        "length" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::Integer(items.len() as i64))
        }
        "includes" => {
            arity(&name, args, 1, 1, line)?;
            Ok(Value::Bool(items.contains(&args.positional[0])))
        }
        "indexOf" => {
            arity(&name, args, 1, 1, line)?;
            let index = items.iter().position(|v| v == &args.positional[0]);
            Ok(Value::Integer(index.map(|i| i as i64).unwrap_or(-1)))
        }
        "join" => {
            arity(&name, args, 0, 1, line)?;
            let sep = match args.positional.first() {
                Some(v) => text(&name, v, line)?,
                None => ",",
            };
            Ok(Value::String(items.iter().map(Value::as_text).collect::<Vec<_>>().join(sep)))
        }
        "slice" => {
            let (start, end) = slice_range(&name, args, items.len(), line)?;
            Ok(Value::List(items[start..end].to_vec()))
        }
        "reverse" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::List(items.iter().rev().cloned().collect()))
        }
        "sort" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::List(natural_sort(items.to_vec(), line)?))
        }
        "first" => {
            arity(&name, args, 0, 0, line)?;
            Ok(items.first().cloned().unwrap_or(Value::Null))
        }
        "last" => {
            arity(&name, args, 0, 0, line)?;
            Ok(items.last().cloned().unwrap_or(Value::Null))
        }
        "concat" => {
            arity(&name, args, 0, usize::MAX, line)?;
            let mut out = items.to_vec();
            for arg in &args.positional {
                match arg {
                    Value::List(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::List(out))
        }
        _ => Err(unknown_member(&name, line)),
    }
}

pub fn string_method(s: &str, method: &str, args: &CallArgs, line: usize) -> Result<Value, ExecutionError> {
    let name = format!("string.{}", method);
    match method {
        "length" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::Integer(s.chars().count() as i64))
        }
        "upper" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::String(s.to_uppercase()))
        }
        "lower" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::String(s.to_lowercase()))
        }
        "trim" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::string(s.trim()))
        }
        "split" => {
            arity(&name, args, 0, 1, line)?;
            let parts: Vec<Value> = match args.positional.first() {
                None => s.split_whitespace().map(Value::from).collect(),
                Some(sep) => match text(&name, sep, line)? {
                    "" => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    sep => s.split(sep).map(Value::from).collect(),
                },
            };
            Ok(Value::List(parts))
        }
        "includes" | "startsWith" | "endsWith" => {
            arity(&name, args, 1, 1, line)?;
            let needle = text(&name, &args.positional[0], line)?;
            Ok(Value::Bool(match method {
                "includes" => s.contains(needle),
                "startsWith" => s.starts_with(needle),
                _ => s.ends_with(needle),
            }))
        }
        "replace" => {
            arity(&name, args, 2, 2, line)?;
            let from = text(&name, &args.positional[0], line)?;
            let to = text(&name, &args.positional[1], line)?;
            Ok(Value::String(s.replace(from, to)))
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_range(&name, args, chars.len(), line)?;
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        _ => Err(unknown_member(&name, line)),
    }
}

pub fn object_method(
    map: &BTreeMap<String, Value>,
    method: &str,
    args: &CallArgs,
    line: usize,
) -> Result<Value, ExecutionError> {
    let name = format!("object.{}", method);
    match method {
        "length" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::Integer(map.len() as i64))
        }
        "keys" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::List(map.keys().map(|k| Value::String(k.clone())).collect()))
        }
        "values" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::List(map.values().cloned().collect()))
        }
        "entries" => {
            arity(&name, args, 0, 0, line)?;
            Ok(Value::List(
                map.iter()
                    .map(|(k, v)| Value::List(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            ))
        }
        "has" => {
            arity(&name, args, 1, 1, line)?;
            Ok(Value::Bool(map.contains_key(&args.positional[0].as_text())))
        }
        "get" => {
            arity(&name, args, 1, 2, line)?;
            let key = args.positional[0].as_text();
            Ok(map
                .get(&key)
                .cloned()
                .or_else(|| args.positional.get(1).cloned())
                .unwrap_or(Value::Null))
        }
        _ => Err(unknown_member(&name, line)),
    }
}
