//! Runtime values.
//!
//! [`Value`] is a closed union. Composite values own their contents, so
//! `clone()` is a deep copy: this is what gives argument passing and plain
//! assignment their by-value semantics. Functions are the exception and are
//! shared behind an [`Arc`] (they are immutable once created).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::ast::{FunctionDecl, LambdaDecl, SystemVariable};
use crate::scope::ScopeId;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(Arc<FunctionValue>),
    Builtin(BuiltinFunction),
    Namespace(Namespace),
    /// A provider method bound by `import { member } from namespace`.
    Capability { namespace: String, method: String },
}

/// A user-defined function or lambda together with the scope it closes over.
#[derive(Debug)]
pub struct FunctionValue {
    pub name: String,
    pub body: FunctionBody,
    pub closure: ScopeId,
}

impl FunctionValue {
    pub fn params(&self) -> &[String] {
        match &self.body {
            FunctionBody::Block(decl) => &decl.params,
            FunctionBody::Lambda(decl) => &decl.params,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Block(Arc<FunctionDecl>),
    Lambda(Arc<LambdaDecl>),
}

/// Global functions seeded in the root scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFunction {
    Len,
    Str,
    Int,
    Float,
    Typeof,
    Range,
}

impl BuiltinFunction {
    pub const ALL: [BuiltinFunction; 6] = [
        BuiltinFunction::Len,
        BuiltinFunction::Str,
        BuiltinFunction::Int,
        BuiltinFunction::Float,
        BuiltinFunction::Typeof,
        BuiltinFunction::Range,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinFunction::Len => "len",
            BuiltinFunction::Str => "str",
            BuiltinFunction::Int => "int",
            BuiltinFunction::Float => "float",
            BuiltinFunction::Typeof => "typeof",
            BuiltinFunction::Range => "range",
        }
    }
}

/// Pure utility namespaces implemented inside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticNamespace {
    Math,
    Date,
    Json,
}

impl StaticNamespace {
    pub const ALL: [StaticNamespace; 3] = [StaticNamespace::Math, StaticNamespace::Date, StaticNamespace::Json];

    pub fn name(&self) -> &'static str {
        match self {
            StaticNamespace::Math => "math",
            StaticNamespace::Date => "date",
            StaticNamespace::Json => "json",
        }
    }
}

/// Service namespaces that are always reserved, whether or not a provider
/// is registered for them.
pub const SERVICE_NAMESPACES: [&str; 2] = ["random", "http"];

#[derive(Debug, Clone, PartialEq)]
pub enum Namespace {
    System(SystemVariable),
    Static(StaticNamespace),
    /// Dispatched through the service registry.
    Service(String),
}

impl Namespace {
    pub fn name(&self) -> &str {
        match self {
            Namespace::System(v) => v.name(),
            Namespace::Static(ns) => ns.name(),
            Namespace::Service(name) => name,
        }
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Function(_) | Value::Builtin(_) | Value::Capability { .. } => "function",
            Value::Namespace(_) => "namespace",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Function(_) | Value::Builtin(_) | Value::Namespace(_) | Value::Capability { .. } => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Builtin(_) | Value::Capability { .. })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Float(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Text used by interpolation, `log` and string concatenation.
    /// Strings appear without quotes at the top level.
    pub fn as_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            ),
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => (*a as f64) == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Namespace(a), Value::Namespace(b)) => a == b,
            (
                Value::Capability { namespace: n1, method: m1 },
                Value::Capability { namespace: n2, method: m2 },
            ) => n1 == n2 && m1 == m2,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_nested(f)?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", key)?;
                    value.fmt_nested(f)?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name()),
            Value::Namespace(ns) => write!(f, "<namespace {}>", ns.name()),
            Value::Capability { namespace, method } => write!(f, "<{}.{}>", namespace, method),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
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

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
