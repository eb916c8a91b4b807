//! Expression evaluation for [`Interpreter`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::{
    Argument, AssignOp, AssignTarget, Accessor, BinaryOp, ExprKind, Expression, InterpolationPart, Literal,
    SystemVariable, UnaryOp,
};
use crate::builtins::{self, LIST_METHODS, OBJECT_METHODS, STRING_METHODS};
use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::interpreter::{Eval, Interpreter};
use crate::provider::CallArgs;
use crate::scope::SymbolKind;
use crate::value::{FunctionBody, FunctionValue, Namespace, Value};

/// One resolved step of a writable place.
#[derive(Debug, Clone)]
pub(crate) enum PathStep {
    Key(String),
    Index(Value),
}

enum InPlace {
    Applied(Value),
    /// The place held something other than a list.
    NotAList(Value),
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Integer(n) => Value::Integer(*n),
        Literal::Float(n) => Value::Float(*n),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn undefined(message: String, line: usize) -> ExecutionError {
    ExecutionError::new(ExecutionErrorKind::UndefinedName, message, line)
}

fn object(entries: Vec<(&str, Value)>) -> Value {
    Value::Object(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

impl Interpreter {
    pub(crate) fn eval<'a>(&'a mut self, expr: &'a Expression) -> Eval<'a, Value> {
        Box::pin(async move {
            let line = expr.line;
            match &expr.kind {
                ExprKind::Literal(literal) => Ok(literal_value(literal)),
                ExprKind::Identifier(name) => self.lookup(name, line),
                ExprKind::System(var) => Ok(self.system_value(*var)),
                ExprKind::Binary { op, left, right } => self.eval_binary(*op, left, right, line).await,
                ExprKind::Unary { op, operand } => {
                    let value = self.eval(operand).await?;
                    unary(*op, value, line)
                }
                ExprKind::Member { object, name } => {
                    if let ExprKind::System(var) = &object.kind {
                        return self.system_member(*var, name, line);
                    }
                    let target = self.eval(object).await?;
                    self.member(target, name, line)
                }
                ExprKind::Index { object, index } => {
                    let target = self.eval(object).await?;
                    let index = self.eval(index).await?;
                    index_value(target, index, line)
                }
                ExprKind::MethodCall { object, method, args } => {
                    self.eval_method_call(object, method, args, line).await
                }
                ExprKind::Call { callee, args } => {
                    let (target, label) = match &callee.kind {
                        ExprKind::Identifier(name) => {
                            let value = self
                                .scopes
                                .resolve(self.scope, name)
                                .and_then(|(_, symbol)| symbol.value.clone())
                                .ok_or_else(|| {
                                    ExecutionError::new(
                                        ExecutionErrorKind::UndefinedFunction,
                                        format!("undefined function '{}'", name),
                                        line,
                                    )
                                })?;
                            (value, format!("'{}'", name))
                        }
                        _ => {
                            let value = self.eval(callee).await?;
                            let label = value.type_name().to_string();
                            (value, label)
                        }
                    };
                    if !target.is_callable() {
                        return Err(ExecutionError::new(
                            ExecutionErrorKind::NotCallable,
                            format!("{} is not callable", label),
                            line,
                        ));
                    }
                    let args = self.eval_args(args).await?;
                    self.call_value(target, args, line).await
                }
                ExprKind::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    Ok(Value::List(values))
                }
                ExprKind::Object(entries) => {
                    let mut map = BTreeMap::new();
                    for (key, value) in entries {
                        let value = self.eval(value).await?;
                        map.insert(key.clone(), value);
                    }
                    Ok(Value::Object(map))
                }
                ExprKind::Interpolated(parts) => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            InterpolationPart::Text(text) => out.push_str(text),
                            InterpolationPart::Expr(expr) => out.push_str(&self.eval(expr).await?.as_text()),
                        }
                    }
                    Ok(Value::String(out))
                }
                ExprKind::Lambda(decl) => {
                    let function = Arc::new(FunctionValue {
                        name: decl.display_name(),
                        body: FunctionBody::Lambda(decl.clone()),
                        closure: self.scope,
                    });
                    self.scopes.capture(&function);
                    Ok(Value::Function(function))
                }
            }
        })
    }

    pub(crate) async fn eval_args(&mut self, args: &[Argument]) -> Result<CallArgs, ExecutionError> {
        let mut positional = Vec::new();
        let mut named = BTreeMap::new();
        for arg in args {
            let value = self.eval(&arg.value).await?;
            match &arg.name {
                Some(name) => {
                    if named.insert(name.clone(), value).is_some() {
                        return Err(ExecutionError::new(
                            ExecutionErrorKind::Arity,
                            format!("argument '{}' given more than once", name),
                            arg.value.line,
                        ));
                    }
                }
                None => positional.push(value),
            }
        }
        Ok(CallArgs::new(positional, named))
    }

    async fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        line: usize,
    ) -> Result<Value, ExecutionError> {
        match op {
            BinaryOp::And => {
                if !self.eval(left).await?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right).await?.is_truthy()))
            }
            BinaryOp::Or => {
                if self.eval(left).await?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right).await?.is_truthy()))
            }
            _ => {
                let left = self.eval(left).await?;
                let right = self.eval(right).await?;
                binary(op, left, right, line)
            }
        }
    }

    // ---- system variables ----

    /// Current state of a system variable as a plain object.
    pub(crate) fn system_value(&self, var: SystemVariable) -> Value {
        match var {
            SystemVariable::Page => object(vec![
                ("url", Value::String(self.page.url.clone())),
                ("title", Value::String(self.page.title.clone())),
            ]),
            SystemVariable::Env => Value::Object(
                self.env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
            SystemVariable::Response => self.response.clone(),
            SystemVariable::Browser => object(vec![
                ("name", Value::String(self.config.browser.clone())),
                ("headless", Value::Bool(self.config.headless)),
            ]),
            SystemVariable::Context => object(vec![
                ("run_id", Value::String(self.run_id.to_string())),
                ("script", Value::String(self.script_name.clone())),
                ("started_at", Value::String(self.started_at_text())),
                (
                    "step",
                    self.current_step.clone().map(Value::String).unwrap_or(Value::Null),
                ),
            ]),
            SystemVariable::Config => {
                let mut config = match Value::from_json(&self.config.to_json()) {
                    Value::Object(map) => map,
                    _ => BTreeMap::new(),
                };
                config.entry("base_url".to_string()).or_insert(Value::Null);
                config.entry("random_seed".to_string()).or_insert(Value::Null);
                Value::Object(config)
            }
        }
    }

    /// `page.url`, `env.HOME`, ... Unset environment variables read as null;
    /// any other unknown attribute is an error.
    fn system_member(&self, var: SystemVariable, name: &str, line: usize) -> Result<Value, ExecutionError> {
        match (var, self.system_value(var)) {
            (SystemVariable::Env, Value::Object(mut env)) => Ok(env.remove(name).unwrap_or(Value::Null)),
            (SystemVariable::Response, Value::Null) => Err(undefined(
                format!("cannot read 'response.{}': no HTTP call has been made yet", name),
                line,
            )),
            (_, Value::Object(mut map)) => map
                .remove(name)
                .ok_or_else(|| undefined(format!("'{}' has no attribute '{}'", var.name(), name), line)),
            (_, other) => self.member(other, name, line),
        }
    }

    // ---- members and indexing ----

    pub(crate) fn member(&self, target: Value, name: &str, line: usize) -> Result<Value, ExecutionError> {
        match target {
            Value::Object(mut map) => match map.remove(name) {
                Some(value) => Ok(value),
                None if name == "length" => Ok(Value::Integer(map.len() as i64)),
                None => Ok(Value::Null),
            },
            Value::List(items) if name == "length" => Ok(Value::Integer(items.len() as i64)),
            Value::String(s) if name == "length" => Ok(Value::Integer(s.chars().count() as i64)),
            Value::Namespace(Namespace::System(var)) => self.system_member(var, name, line),
            Value::Namespace(Namespace::Static(ns)) => builtins::static_member(ns, name)
                .ok_or_else(|| undefined(format!("'{}' has no member '{}'", ns.name(), name), line)),
            Value::Namespace(Namespace::Service(ns)) => match self.registry.get(&ns) {
                Some(provider) if provider.supports(name) => Ok(Value::Capability {
                    namespace: ns,
                    method: name.to_string(),
                }),
                _ => Err(undefined(format!("'{}' has no member '{}'", ns, name), line)),
            },
            other => Err(ExecutionError::type_error(
                format!("cannot read member '{}' of {}", name, other.type_name()),
                line,
            )),
        }
    }

    // ---- method calls ----

    async fn eval_method_call(
        &mut self,
        object: &Expression,
        method: &str,
        args: &[Argument],
        line: usize,
    ) -> Result<Value, ExecutionError> {
        let mut read = None;
        if method == "push" || method == "pop" {
            match self.mutate_list_in_place(object, method, args, line).await? {
                Some(InPlace::Applied(value)) => return Ok(value),
                Some(InPlace::NotAList(value)) => read = Some(value),
                None => {}
            }
        }

        let receiver = match read {
            Some(value) => value,
            None => self.eval(object).await?,
        };
        match receiver {
            Value::Namespace(Namespace::Static(ns)) => {
                let args = self.eval_args(args).await?;
                builtins::call_static(ns, method, &args, line)
            }
            Value::Namespace(Namespace::Service(ns)) => {
                let args = self.eval_args(args).await?;
                self.invoke_service(&ns, method, args, line).await
            }
            Value::List(items) => {
                let args = self.eval_args(args).await?;
                self.list_method_call(items, method, args, line).await
            }
            Value::String(s) => {
                if !STRING_METHODS.contains(&method) {
                    return Err(undefined(format!("string has no method '{}'", method), line));
                }
                let args = self.eval_args(args).await?;
                builtins::string_method(&s, method, &args, line)
            }
            Value::Object(map) => {
                if let Some(field) = map.get(method).filter(|v| v.is_callable()) {
                    let field = field.clone();
                    let args = self.eval_args(args).await?;
                    return self.call_value(field, args, line).await;
                }
                if !OBJECT_METHODS.contains(&method) {
                    return Err(undefined(format!("object has no method '{}'", method), line));
                }
                let args = self.eval_args(args).await?;
                builtins::object_method(&map, method, &args, line)
            }
            other => Err(ExecutionError::type_error(
                format!("{} has no method '{}'", other.type_name(), method),
                line,
            )),
        }
    }

    /// `push`/`pop` on a list stored in a variable write the result back.
    /// Returns `None` when the receiver is not a place. Index expressions
    /// along the place are evaluated exactly once either way.
    async fn mutate_list_in_place(
        &mut self,
        object: &Expression,
        method: &str,
        args: &[Argument],
        line: usize,
    ) -> Result<Option<InPlace>, ExecutionError> {
        let Some((root, steps)) = place_of(object) else {
            return Ok(None);
        };
        let path = self.resolve_path(&steps).await?;
        let mut items = match read_path(self.lookup(root, line)?, &path, line)? {
            Value::List(items) => items,
            other => return Ok(Some(InPlace::NotAList(other))),
        };
        let args = self.eval_args(args).await?;
        let result = list_mutation(&mut items, method, args, line)?;
        self.store(root, &path, Value::List(items), line)?;
        Ok(Some(InPlace::Applied(result)))
    }

    async fn list_method_call(
        &mut self,
        items: Vec<Value>,
        method: &str,
        args: CallArgs,
        line: usize,
    ) -> Result<Value, ExecutionError> {
        match method {
            "push" | "pop" => {
                let mut items = items;
                list_mutation(&mut items, method, args, line)
            }
            "map" | "filter" | "forEach" | "find" | "some" | "every" | "reduce" => {
                self.callback_method(items, method, args, line).await
            }
            "sort" if !args.positional.is_empty() => self.callback_method(items, method, args, line).await,
            _ if LIST_METHODS.contains(&method) => builtins::list_method(&items, method, &args, line),
            _ => Err(undefined(format!("list has no method '{}'", method), line)),
        }
    }

    async fn callback_method(
        &mut self,
        items: Vec<Value>,
        method: &str,
        args: CallArgs,
        line: usize,
    ) -> Result<Value, ExecutionError> {
        let name = format!("list.{}", method);
        let max = if method == "reduce" { 2 } else { 1 };
        if !args.named.is_empty() || args.positional.is_empty() || args.positional.len() > max {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Arity,
                format!("{} expects a callback argument", name),
                line,
            ));
        }
        let mut positional = args.positional.into_iter();
        let callback = positional.next().unwrap_or(Value::Null);
        if !callback.is_callable() {
            return Err(ExecutionError::type_error(
                format!("{} expects a function, got {}", name, callback.type_name()),
                line,
            ));
        }

        match method {
            "map" => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    out.push(self.invoke_callback(&callback, vec![item, Value::Integer(i as i64)], 1, line).await?);
                }
                Ok(Value::List(out))
            }
            "filter" => {
                let mut out = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let keep = self
                        .invoke_callback(&callback, vec![item.clone(), Value::Integer(i as i64)], 1, line)
                        .await?;
                    if keep.is_truthy() {
                        out.push(item);
                    }
                }
                Ok(Value::List(out))
            }
            "forEach" => {
                for (i, item) in items.into_iter().enumerate() {
                    self.invoke_callback(&callback, vec![item, Value::Integer(i as i64)], 1, line).await?;
                }
                Ok(Value::Null)
            }
            "find" => {
                for (i, item) in items.into_iter().enumerate() {
                    let hit = self
                        .invoke_callback(&callback, vec![item.clone(), Value::Integer(i as i64)], 1, line)
                        .await?;
                    if hit.is_truthy() {
                        return Ok(item);
                    }
                }
                Ok(Value::Null)
            }
            "some" | "every" => {
                let want = method == "some";
                for (i, item) in items.into_iter().enumerate() {
                    let hit = self
                        .invoke_callback(&callback, vec![item, Value::Integer(i as i64)], 1, line)
                        .await?
                        .is_truthy();
                    if hit == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            "reduce" => {
                let mut iter = items.into_iter().enumerate();
                let mut acc = match positional.next() {
                    Some(initial) => initial,
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(ExecutionError::type_error(
                                "list.reduce of an empty list needs an initial value",
                                line,
                            ))
                        }
                    },
                };
                for (i, item) in iter {
                    acc = self
                        .invoke_callback(&callback, vec![acc, item, Value::Integer(i as i64)], 2, line)
                        .await?;
                }
                Ok(acc)
            }
            _ => {
                // Stable insertion sort driven by the comparator.
                let mut sorted: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    let mut pos = sorted.len();
                    while pos > 0 {
                        let result = self
                            .invoke_callback(&callback, vec![sorted[pos - 1].clone(), item.clone()], 2, line)
                            .await?;
                        let order = result.as_f64().ok_or_else(|| {
                            ExecutionError::type_error(
                                format!("sort comparator must return a number, got {}", result.type_name()),
                                line,
                            )
                        })?;
                        if order > 0.0 {
                            pos -= 1;
                        } else {
                            break;
                        }
                    }
                    sorted.insert(pos, item);
                }
                Ok(Value::List(sorted))
            }
        }
    }

    /// Calls `callback` with as many leading `candidates` as it declares
    /// parameters. Builtins and capabilities get the first `fixed`.
    async fn invoke_callback(
        &mut self,
        callback: &Value,
        candidates: Vec<Value>,
        fixed: usize,
        line: usize,
    ) -> Result<Value, ExecutionError> {
        let take = match callback {
            Value::Function(function) => function.params().len(),
            _ => fixed,
        };
        let args = CallArgs::positional(candidates.into_iter().take(take).collect());
        self.call_value(callback.clone(), args, line).await
    }

    // ---- assignment ----

    async fn resolve_path(&mut self, steps: &[&Expression]) -> Result<Vec<PathStep>, ExecutionError> {
        let mut path = Vec::with_capacity(steps.len());
        for step in steps {
            match &step.kind {
                ExprKind::Member { name, .. } => path.push(PathStep::Key(name.clone())),
                ExprKind::Index { index, .. } => path.push(PathStep::Index(self.eval(index).await?)),
                _ => {}
            }
        }
        Ok(path)
    }

    pub(crate) async fn assign(
        &mut self,
        target: &AssignTarget,
        op: AssignOp,
        value: &Expression,
        line: usize,
    ) -> Result<(), ExecutionError> {
        let mut path = Vec::with_capacity(target.path.len());
        for accessor in &target.path {
            path.push(match accessor {
                Accessor::Member(name) => PathStep::Key(name.clone()),
                Accessor::Index(index) => PathStep::Index(self.eval(index).await?),
            });
        }
        let rhs = self.eval(value).await?;
        let new_value = match op.binary() {
            None => rhs,
            Some(bin) => {
                let current = read_path(self.lookup(&target.root, line)?, &path, line)?;
                binary(bin, current, rhs, line)?
            }
        };
        self.store(&target.root, &path, new_value, line)
    }

    /// Writes `value` into the variable `root` at `path`.
    pub(crate) fn store(&mut self, root: &str, path: &[PathStep], value: Value, line: usize) -> Result<(), ExecutionError> {
        let symbol = self
            .scopes
            .resolve_mut(self.scope, root)
            .ok_or_else(|| undefined(format!("'{}' is not defined", root), line))?;
        match symbol.kind {
            SymbolKind::Mutable | SymbolKind::Parameter => {}
            kind => {
                return Err(ExecutionError::type_error(
                    format!("cannot assign to {} '{}'", kind.describe(), root),
                    line,
                ))
            }
        }
        let slot = symbol.value.get_or_insert(Value::Null);
        write_path(slot, path, value, line)
    }
}

/// Splits `items.tags[0]` into its root variable and the member/index
/// nodes leading to it, innermost first.
fn place_of(expr: &Expression) -> Option<(&str, Vec<&Expression>)> {
    let mut steps = Vec::new();
    let mut current = expr;
    loop {
        match &current.kind {
            ExprKind::Identifier(name) => {
                steps.reverse();
                return Some((name, steps));
            }
            ExprKind::Member { object, .. } | ExprKind::Index { object, .. } => {
                steps.push(current);
                current = object;
            }
            _ => return None,
        }
    }
}

fn list_mutation(items: &mut Vec<Value>, method: &str, args: CallArgs, line: usize) -> Result<Value, ExecutionError> {
    let arity = |message: String| ExecutionError::new(ExecutionErrorKind::Arity, message, line);
    if !args.named.is_empty() {
        return Err(arity(format!("list.{} does not take named arguments", method)));
    }
    if method == "push" {
        if args.positional.is_empty() {
            return Err(arity("list.push expects at least 1 argument(s), got 0".to_string()));
        }
        items.extend(args.positional);
        Ok(Value::Integer(items.len() as i64))
    } else {
        if !args.positional.is_empty() {
            return Err(arity(format!("list.pop expects 0 argument(s), got {}", args.positional.len())));
        }
        Ok(items.pop().unwrap_or(Value::Null))
    }
}

fn read_path(mut value: Value, path: &[PathStep], line: usize) -> Result<Value, ExecutionError> {
    for step in path {
        value = match step {
            PathStep::Key(key) => match value {
                Value::Object(mut map) => map.remove(key).unwrap_or(Value::Null),
                other => {
                    return Err(ExecutionError::type_error(
                        format!("cannot read member '{}' of {}", key, other.type_name()),
                        line,
                    ))
                }
            },
            PathStep::Index(index) => index_value(value, index.clone(), line)?,
        };
    }
    Ok(value)
}

fn write_path(slot: &mut Value, path: &[PathStep], value: Value, line: usize) -> Result<(), ExecutionError> {
    let Some((step, rest)) = path.split_first() else {
        *slot = value;
        return Ok(());
    };
    let child = match (slot, step) {
        (Value::Object(map), PathStep::Key(key)) | (Value::Object(map), PathStep::Index(Value::String(key))) => {
            if rest.is_empty() {
                map.insert(key.clone(), value);
                return Ok(());
            }
            map.get_mut(key)
                .ok_or_else(|| undefined(format!("object has no member '{}'", key), line))?
        }
        (Value::List(items), PathStep::Index(Value::Integer(i))) => {
            let len = items.len();
            usize::try_from(*i)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| out_of_range(*i, len, line))?
        }
        (target, _) => {
            return Err(ExecutionError::type_error(
                format!("cannot assign into {}", target.type_name()),
                line,
            ))
        }
    };
    write_path(child, rest, value, line)
}

fn out_of_range(index: i64, len: usize, line: usize) -> ExecutionError {
    ExecutionError::new(
        ExecutionErrorKind::IndexOutOfRange,
        format!("index {} out of range for length {}", index, len),
        line,
    )
}

pub(crate) fn index_value(target: Value, index: Value, line: usize) -> Result<Value, ExecutionError> {
    match (target, index) {
        (Value::List(mut items), Value::Integer(i)) => {
            let len = items.len();
            match usize::try_from(i) {
                Ok(i) if i < len => Ok(items.swap_remove(i)),
                _ => Err(out_of_range(i, len, line)),
            }
        }
        (Value::String(s), Value::Integer(i)) => {
            let len = s.chars().count();
            usize::try_from(i)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| out_of_range(i, len, line))
        }
        (Value::Object(mut map), Value::String(key)) => Ok(map.remove(&key).unwrap_or(Value::Null)),
        (target, index) => Err(ExecutionError::type_error(
            format!("cannot index {} with {}", target.type_name(), index.type_name()),
            line,
        )),
    }
}

fn unary(op: UnaryOp, value: Value, line: usize) -> Result<Value, ExecutionError> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Negate, Value::Integer(n)) => n
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| ExecutionError::type_error("integer overflow", line)),
        (UnaryOp::Negate, Value::Float(n)) => Ok(Value::Float(-n)),
        (UnaryOp::Plus, value @ (Value::Integer(_) | Value::Float(_))) => Ok(value),
        (_, value) => Err(ExecutionError::type_error(
            format!("bad operand type for unary operator: {}", value.type_name()),
            line,
        )),
    }
}

pub(crate) fn binary(op: BinaryOp, left: Value, right: Value, line: usize) -> Result<Value, ExecutionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::NotEq => Ok(Value::Bool(left != right)),
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            let order = builtins::compare(&left, &right).ok_or_else(|| {
                ExecutionError::type_error(
                    format!("cannot compare {} with {}", left.type_name(), right.type_name()),
                    line,
                )
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Less => order == Ordering::Less,
                BinaryOp::LessEq => order != Ordering::Greater,
                BinaryOp::Greater => order == Ordering::Greater,
                _ => order != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Ok(Value::String(a + &b.as_text())),
            (a, Value::String(b)) => Ok(Value::String(a.as_text() + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => arithmetic(op, a, b, line),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => arithmetic(op, left, right, line),
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value, line: usize) -> Result<Value, ExecutionError> {
    let by_zero = || {
        let what = if op == BinaryOp::Mod { "modulo" } else { "division" };
        ExecutionError::type_error(format!("{} by zero", what), line)
    };
    if let (Value::Integer(a), Value::Integer(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(by_zero());
                }
                if a.checked_rem(b) != Some(0) {
                    return Ok(Value::Float(a as f64 / b as f64));
                }
                a.checked_div(b)
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(by_zero());
                }
                a.checked_rem(b)
            }
            _ => None,
        };
        return result
            .map(Value::Integer)
            .ok_or_else(|| ExecutionError::type_error(format!("integer overflow in '{}'", op), line));
    }

    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => {
            if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == 0.0 {
                return Err(by_zero());
            }
            Ok(Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }))
        }
        _ => Err(ExecutionError::type_error(
            format!(
                "unsupported operand types for '{}': {} and {}",
                op,
                left.type_name(),
                right.type_name()
            ),
            line,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        assert_eq!(binary(BinaryOp::Add, Value::Integer(2), Value::Integer(3), 1), Ok(Value::Integer(5)));
        assert_eq!(binary(BinaryOp::Div, Value::Integer(10), Value::Integer(2), 1), Ok(Value::Integer(5)));
        assert_eq!(binary(BinaryOp::Div, Value::Integer(7), Value::Integer(2), 1), Ok(Value::Float(3.5)));
        assert_eq!(binary(BinaryOp::Mod, Value::Integer(7), Value::Integer(3), 1), Ok(Value::Integer(1)));
    }

    #[test]
    fn test_division_by_zero() {
        let err = binary(BinaryOp::Div, Value::Integer(1), Value::Integer(0), 4).unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Type);
        assert_eq!(err.line, 4);
        assert!(binary(BinaryOp::Mod, Value::Float(1.0), Value::Float(0.0), 1).is_err());
    }

    #[test]
    fn test_overflow_is_an_error() {
        assert!(binary(BinaryOp::Add, Value::Integer(i64::MAX), Value::Integer(1), 1).is_err());
        assert!(binary(BinaryOp::Div, Value::Integer(i64::MIN), Value::Integer(-1), 1).is_err());
    }

    #[test]
    fn test_string_concatenation_coerces() {
        assert_eq!(
            binary(BinaryOp::Add, Value::string("n="), Value::Integer(3), 1),
            Ok(Value::string("n=3"))
        );
        assert_eq!(
            binary(BinaryOp::Add, Value::Integer(3), Value::string("px"), 1),
            Ok(Value::string("3px"))
        );
    }

    #[test]
    fn test_list_concatenation() {
        assert_eq!(
            binary(BinaryOp::Add, Value::from(vec![1i64]), Value::from(vec![2i64]), 1),
            Ok(Value::from(vec![1i64, 2]))
        );
    }

    #[test]
    fn test_comparison_requires_compatible_types() {
        assert_eq!(binary(BinaryOp::Less, Value::Integer(1), Value::Float(1.5), 1), Ok(Value::Bool(true)));
        assert_eq!(binary(BinaryOp::GreaterEq, Value::string("b"), Value::string("a"), 1), Ok(Value::Bool(true)));
        assert!(binary(BinaryOp::Less, Value::string("a"), Value::Integer(1), 1).is_err());
    }

    #[test]
    fn test_index_out_of_range() {
        let err = index_value(Value::from(vec![1i64, 2]), Value::Integer(2), 3).unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::IndexOutOfRange);
        assert!(index_value(Value::from(vec![1i64]), Value::Integer(-1), 3).is_err());
        assert_eq!(index_value(Value::string("abc"), Value::Integer(1), 1), Ok(Value::string("b")));
    }

    #[test]
    fn test_write_path_into_nested_list() {
        let mut slot = Value::Object(BTreeMap::from([("tags".to_string(), Value::from(vec!["a", "b"]))]));
        let path = vec![PathStep::Key("tags".to_string()), PathStep::Index(Value::Integer(1))];
        write_path(&mut slot, &path, Value::string("z"), 1).unwrap();
        assert_eq!(read_path(slot, &path, 1), Ok(Value::string("z")));
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(unary(UnaryOp::Negate, Value::Integer(4), 1), Ok(Value::Integer(-4)));
        assert_eq!(unary(UnaryOp::Not, Value::Null, 1), Ok(Value::Bool(true)));
        assert!(unary(UnaryOp::Negate, Value::string("x"), 1).is_err());
    }
}
