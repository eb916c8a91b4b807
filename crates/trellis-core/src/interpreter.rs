//! Tree-walking interpreter.
//!
//! [`Interpreter::run`] executes a parsed [`Program`] against a fresh
//! [`ScopeArena`]. Statements return a [`Control`] signal instead of
//! unwinding, so `break`, `continue` and `return` travel up the call chain
//! as ordinary values until a loop or call frame consumes them.
//!
//! Automation statements are turned into [`ActionType`]s and sent through
//! the [`ActionExecutor`]; every one of them (plus `log` lines and
//! assertions) lands in the [`Session`] action log. Service calls go through
//! the [`ServiceRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_core::interpreter::Interpreter;
//! use trellis_core::recording_driver::RecordingDriver;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut interpreter = Interpreter::new(Arc::new(RecordingDriver::new()));
//!     let report = interpreter.run_source("let x = 1 + 2\nlog x").await.unwrap();
//!     assert_eq!(report.logs, vec!["3"]);
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::action::{ActionLog, ActionResult, ActionType};
use crate::ast::{Action, Import, Program, Statement, StatementKind};
use crate::builtins;
use crate::config::TrellisConfig;
use crate::driver::{AutomationDriver, PageState};
use crate::error::{ExecutionError, ExecutionErrorKind, TrellisError};
use crate::executor::ActionExecutor;
use crate::http::{HttpProvider, HttpTransport};
use crate::openapi::OpenApiProvider;
use crate::parser;
use crate::provider::{CallArgs, ProviderError, ServiceProvider, ServiceRegistry};
use crate::random_data::RandomProvider;
use crate::scope::{DeclareError, ScopeArena, ScopeId, Symbol, SymbolKind};
use crate::session::Session;
use crate::value::{FunctionBody, FunctionValue, Namespace, StaticNamespace, Value};

pub(crate) type Eval<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ExecutionError>> + 'a>>;

/// How a statement finished.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Control {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// What a successful run leaves behind.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Output of every `log` statement, in order.
    pub logs: Vec<String>,
    /// The session action log, session markers included.
    pub actions: Vec<ActionLog>,
    /// Final values of the program scope.
    pub globals: BTreeMap<String, Value>,
    /// The last HTTP response, or null.
    pub response: Value,
}

impl ExecutionReport {
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }
}

pub struct Interpreter {
    pub(crate) scopes: ScopeArena,
    pub(crate) scope: ScopeId,
    pub(crate) loop_depth: usize,
    /// Running functions, keyed by closure identity, with their names.
    pub(crate) call_stack: Vec<(usize, String)>,
    pub(crate) registry: ServiceRegistry,
    pub(crate) config: TrellisConfig,
    pub(crate) page: PageState,
    pub(crate) response: Value,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) current_step: Option<String>,
    pub(crate) run_id: Uuid,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) script_name: String,
    executor: ActionExecutor,
    session: Arc<Session>,
    /// Whether `session` has already recorded a run.
    session_used: bool,
    http: Option<Arc<dyn HttpTransport>>,
    providers: Vec<Arc<dyn ServiceProvider>>,
    env_overrides: BTreeMap<String, String>,
    logs: Vec<String>,
    base_dir: PathBuf,
}

impl Interpreter {
    pub fn new(driver: Arc<dyn AutomationDriver>) -> Self {
        Self {
            scopes: ScopeArena::new(),
            scope: ScopeArena::ROOT,
            loop_depth: 0,
            call_stack: Vec::new(),
            registry: ServiceRegistry::new(),
            config: TrellisConfig::default(),
            page: PageState::default(),
            response: Value::Null,
            env: BTreeMap::new(),
            current_step: None,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            script_name: "script".to_string(),
            executor: ActionExecutor::new(driver),
            session: Session::new("script", None),
            session_used: false,
            http: None,
            providers: Vec::new(),
            env_overrides: BTreeMap::new(),
            logs: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_config(mut self, config: TrellisConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables the `http` namespace and OpenAPI imports.
    pub fn with_http(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(transport);
        self
    }

    /// Records the next run into `session`. Later runs get a renewed
    /// session with the same name and log directory.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = session;
        self.session_used = false;
        self
    }

    /// Names the run after `path` and resolves imports relative to its directory.
    pub fn with_script(mut self, path: &Path) -> Self {
        self.script_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());
        self.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self
    }

    /// Sets a variable visible through `env`, overriding the process environment.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env_overrides.insert(key.to_string(), value.to_string());
        self
    }

    /// Registers an extra service namespace.
    pub fn with_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Parses and runs `source`.
    pub async fn run_source(&mut self, source: &str) -> Result<ExecutionReport, TrellisError> {
        let program = parser::parse(source)?;
        Ok(self.run(&program).await?)
    }

    pub async fn run(&mut self, program: &Program) -> Result<ExecutionReport, ExecutionError> {
        self.reset().await;
        let span = info_span!("script", name = %self.script_name, run_id = %self.run_id);
        async {
            self.record(ActionType::StartSession, ActionResult::Success, None).await;
            let global = self.scopes.child(ScopeArena::ROOT);
            let outcome = self.execute_block(&program.statements, global).await.map(|_| ());

            let end = match &outcome {
                Ok(()) => ActionResult::Success,
                Err(e) => ActionResult::Failure(e.to_string()),
            };
            self.record(ActionType::EndSession, end, None).await;

            match outcome {
                Ok(()) => {
                    info!(logs = self.logs.len(), "script finished");
                    Ok(ExecutionReport {
                        logs: std::mem::take(&mut self.logs),
                        actions: self.session.get_action_log().await,
                        globals: self.scopes.snapshot(global),
                        response: self.response.clone(),
                    })
                }
                Err(e) => {
                    debug!(line = e.line, code = e.kind.code(), "script failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn reset(&mut self) {
        self.scopes = ScopeArena::new();
        self.scope = ScopeArena::ROOT;
        self.loop_depth = 0;
        self.call_stack.clear();
        if std::mem::replace(&mut self.session_used, true) {
            self.session = self.session.renew();
        }
        self.logs.clear();
        self.response = Value::Null;
        self.current_step = None;
        self.run_id = Uuid::new_v4();
        self.started_at = Utc::now();
        self.page = self.executor.driver().page().await.unwrap_or_default();

        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(self.config.env.clone());
        env.extend(self.env_overrides.clone());
        self.env = env;

        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(RandomProvider::new(self.config.random_seed)));
        if let Some(transport) = &self.http {
            registry.register(Arc::new(HttpProvider::new(
                transport.clone(),
                self.config.base_url.clone(),
                self.config.default_timeout_ms,
            )));
        }
        for provider in &self.providers {
            registry.register(provider.clone());
        }
        self.registry = registry;
    }

    pub(crate) fn started_at_text(&self) -> String {
        self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    // ---- scopes ----

    pub(crate) fn declare(&mut self, name: &str, kind: SymbolKind, value: Value, line: usize) -> Result<(), ExecutionError> {
        self.declare_in(self.scope, name, kind, value, line)
    }

    fn declare_in(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: SymbolKind,
        value: Value,
        line: usize,
    ) -> Result<(), ExecutionError> {
        self.scopes
            .declare(scope, Symbol::new(name, kind, line, Some(value)))
            .map_err(|e| match e {
                DeclareError::Duplicate { line: first } => ExecutionError::type_error(
                    format!("'{}' is already declared on line {}", name, first),
                    line,
                ),
                DeclareError::Reserved { kind } => {
                    ExecutionError::type_error(format!("'{}' is a reserved {}", name, kind.describe()), line)
                }
            })
    }

    /// Reads a binding. System variables read their current state.
    pub(crate) fn lookup(&self, name: &str, line: usize) -> Result<Value, ExecutionError> {
        match self.scopes.resolve(self.scope, name) {
            Some((_, Symbol { value: Some(Value::Namespace(Namespace::System(var))), .. })) => {
                Ok(self.system_value(*var))
            }
            Some((_, Symbol { value: Some(value), .. })) => Ok(value.clone()),
            _ => Err(ExecutionError::new(
                ExecutionErrorKind::UndefinedName,
                format!("'{}' is not defined", name),
                line,
            )),
        }
    }

    // ---- statements ----

    pub(crate) fn execute_block<'a>(&'a mut self, statements: &'a [Statement], scope: ScopeId) -> Eval<'a, Control> {
        Box::pin(async move {
            let outer = std::mem::replace(&mut self.scope, scope);
            let mut result = Ok(Control::Normal);
            for stmt in statements {
                match self.execute_statement(stmt).await {
                    Ok(Control::Normal) => {}
                    other => {
                        result = other;
                        break;
                    }
                }
            }
            self.scope = outer;
            result
        })
    }

    /// Runs `statements` in a new child of the current scope.
    async fn execute_nested(&mut self, statements: &[Statement]) -> Result<Control, ExecutionError> {
        let scope = self.scopes.child(self.scope);
        let result = self.execute_block(statements, scope).await;
        self.scopes.release(scope);
        result
    }

    fn execute_statement<'a>(&'a mut self, stmt: &'a Statement) -> Eval<'a, Control> {
        Box::pin(async move {
            let line = stmt.line;
            debug!(line, "statement");
            match &stmt.kind {
                StatementKind::Let { name, value } => {
                    let value = self.eval(value).await?;
                    self.declare(name, SymbolKind::Mutable, value, line)?;
                    Ok(Control::Normal)
                }
                StatementKind::Const { name, value } => {
                    let value = self.eval(value).await?;
                    self.declare(name, SymbolKind::Constant, value, line)?;
                    Ok(Control::Normal)
                }
                StatementKind::Assign { target, op, value } => {
                    self.assign(target, *op, value, line).await?;
                    Ok(Control::Normal)
                }
                StatementKind::If { branches, else_block } => {
                    for branch in branches {
                        if self.eval(&branch.condition).await?.is_truthy() {
                            return self.execute_nested(&branch.body).await;
                        }
                    }
                    match else_block {
                        Some(body) => self.execute_nested(body).await,
                        None => Ok(Control::Normal),
                    }
                }
                StatementKind::When { subject, arms, else_block } => {
                    let subject = match subject {
                        Some(expr) => Some(self.eval(expr).await?),
                        None => None,
                    };
                    for arm in arms {
                        for pattern in &arm.patterns {
                            let candidate = self.eval(pattern).await?;
                            let matched = match &subject {
                                Some(subject) => &candidate == subject,
                                None => candidate.is_truthy(),
                            };
                            if matched {
                                debug!(line = arm.line, "when arm matched");
                                return self.execute_nested(&arm.body).await;
                            }
                        }
                    }
                    match else_block {
                        Some(body) => self.execute_nested(body).await,
                        None => Ok(Control::Normal),
                    }
                }
                StatementKind::ForEach { first, second, iterable, body } => {
                    self.loop_depth += 1;
                    let result = self.execute_for(first, second.as_deref(), iterable, body, line).await;
                    self.loop_depth -= 1;
                    result
                }
                StatementKind::While { condition, body } => {
                    self.loop_depth += 1;
                    let result = self.execute_while(condition, body).await;
                    self.loop_depth -= 1;
                    result
                }
                StatementKind::Break | StatementKind::Continue => {
                    let is_break = matches!(stmt.kind, StatementKind::Break);
                    if self.loop_depth == 0 {
                        let keyword = if is_break { "break" } else { "continue" };
                        return Err(ExecutionError::new(
                            ExecutionErrorKind::ControlFlow,
                            format!("'{}' outside of a loop", keyword),
                            line,
                        ));
                    }
                    Ok(if is_break { Control::Break } else { Control::Continue })
                }
                StatementKind::Function(decl) => {
                    let function = Arc::new(FunctionValue {
                        name: decl.name.clone(),
                        body: FunctionBody::Block(decl.clone()),
                        closure: self.scope,
                    });
                    self.scopes.capture(&function);
                    self.declare(&decl.name, SymbolKind::Function, Value::Function(function), line)?;
                    Ok(Control::Normal)
                }
                StatementKind::Return(value) => {
                    if self.call_stack.is_empty() {
                        return Err(ExecutionError::new(
                            ExecutionErrorKind::ControlFlow,
                            "'return' outside of a function",
                            line,
                        ));
                    }
                    let value = match value {
                        Some(expr) => self.eval(expr).await?,
                        None => Value::Null,
                    };
                    Ok(Control::Return(value))
                }
                StatementKind::Action(action) => {
                    self.execute_action(action, line).await?;
                    Ok(Control::Normal)
                }
                StatementKind::Step { name, body } => {
                    let name = self.eval(name).await?.as_text();
                    info!(line, step = %name, "step");
                    let outer = self.current_step.replace(name.clone());
                    let span = info_span!("step", name = %name);
                    let result = self.execute_nested(body).instrument(span).await;
                    self.current_step = outer;
                    result
                }
                StatementKind::Import(import) => {
                    self.execute_import(import, line).await?;
                    Ok(Control::Normal)
                }
                StatementKind::Expression(expr) => {
                    self.eval(expr).await?;
                    Ok(Control::Normal)
                }
            }
        })
    }

    async fn execute_for(
        &mut self,
        first: &str,
        second: Option<&str>,
        iterable: &crate::ast::Expression,
        body: &[Statement],
        line: usize,
    ) -> Result<Control, ExecutionError> {
        // (key, item) pairs; a single loop variable takes the key for objects
        // and the item otherwise.
        let (pairs, single_takes_key): (Vec<(Value, Value)>, bool) = match self.eval(iterable).await? {
            Value::List(items) => (
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| (Value::Integer(i as i64), item))
                    .collect(),
                false,
            ),
            Value::Object(map) => (map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(), true),
            Value::String(s) => (
                s.chars()
                    .enumerate()
                    .map(|(i, c)| (Value::Integer(i as i64), Value::String(c.to_string())))
                    .collect(),
                false,
            ),
            other => {
                return Err(ExecutionError::type_error(
                    format!("cannot iterate over {}", other.type_name()),
                    line,
                ))
            }
        };

        for (key, item) in pairs {
            let iteration = self.scopes.child(self.scope);
            let bound = match second {
                Some(second) => self
                    .declare_in(iteration, first, SymbolKind::Mutable, key, line)
                    .and_then(|_| self.declare_in(iteration, second, SymbolKind::Mutable, item, line)),
                None => {
                    let value = if single_takes_key { key } else { item };
                    self.declare_in(iteration, first, SymbolKind::Mutable, value, line)
                }
            };
            let outcome = match bound {
                Ok(()) => self.execute_block(body, iteration).await,
                Err(e) => Err(e),
            };
            self.scopes.release(iteration);
            match outcome? {
                Control::Normal | Control::Continue => {}
                Control::Break => break,
                ret @ Control::Return(_) => return Ok(ret),
            }
        }
        Ok(Control::Normal)
    }

    async fn execute_while(
        &mut self,
        condition: &crate::ast::Expression,
        body: &[Statement],
    ) -> Result<Control, ExecutionError> {
        while self.eval(condition).await?.is_truthy() {
            match self.execute_nested(body).await? {
                Control::Normal | Control::Continue => {}
                Control::Break => break,
                ret @ Control::Return(_) => return Ok(ret),
            }
        }
        Ok(Control::Normal)
    }

    // ---- actions ----

    async fn eval_text(&mut self, expr: &crate::ast::Expression) -> Result<String, ExecutionError> {
        Ok(self.eval(expr).await?.as_text())
    }

    async fn eval_millis(&mut self, expr: &crate::ast::Expression, line: usize) -> Result<u64, ExecutionError> {
        let value = self.eval(expr).await?;
        value
            .as_i64()
            .filter(|ms| *ms >= 0)
            .map(|ms| ms as u64)
            .ok_or_else(|| {
                ExecutionError::type_error(
                    format!("expected a duration in milliseconds, got {}", value.type_name()),
                    line,
                )
            })
    }

    /// Relative navigation targets are joined onto the configured base URL.
    fn page_url(&self, url: String) -> String {
        match &self.config.base_url {
            Some(base) if url.starts_with('/') => crate::http::join_url(base, &url),
            _ => url,
        }
    }

    async fn record(&self, action: ActionType, result: ActionResult, duration_ms: Option<u64>) {
        self.session.log_action(action, result, duration_ms).await;
    }

    async fn execute_action(&mut self, action: &Action, line: usize) -> Result<(), ExecutionError> {
        let action_type = match action {
            Action::Navigate { url } => {
                let url = self.eval_text(url).await?;
                ActionType::Navigate { url: self.page_url(url) }
            }
            Action::Click { selector } => ActionType::Click {
                selector: self.eval_text(selector).await?,
            },
            Action::Type { selector, text } => ActionType::Type {
                selector: self.eval_text(selector).await?,
                text: self.eval_text(text).await?,
            },
            Action::Select { selector, value } => ActionType::Select {
                selector: self.eval_text(selector).await?,
                value: self.eval_text(value).await?,
            },
            Action::Hover { selector } => ActionType::Hover {
                selector: self.eval_text(selector).await?,
            },
            Action::Wait { duration } => ActionType::Wait {
                ms: self.eval_millis(duration, line).await?,
            },
            Action::WaitFor { selector, timeout } => {
                let selector = self.eval_text(selector).await?;
                let timeout_ms = match timeout {
                    Some(expr) => self.eval_millis(expr, line).await?,
                    None => self.config.default_timeout_ms,
                };
                ActionType::WaitFor { selector, timeout_ms }
            }
            Action::Extract { selector, .. } => ActionType::Extract {
                selector: self.eval_text(selector).await?,
            },
            Action::Screenshot { name } => ActionType::Screenshot {
                name: match name {
                    Some(expr) => Some(self.eval_text(expr).await?),
                    None => None,
                },
            },
            Action::Assert { condition, message } => {
                let passed = self.eval(condition).await?.is_truthy();
                let message = match message {
                    Some(expr) => Some(self.eval_text(expr).await?),
                    None => None,
                };
                ActionType::Assert { passed, message }
            }
            Action::Log { values } => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    parts.push(self.eval_text(value).await?);
                }
                let message = parts.join(" ");
                info!(line, message = %message, "log");
                self.logs.push(message.clone());
                ActionType::LogComment { message }
            }
        };

        let result = self.executor.execute(action_type.clone()).await;
        let outcome = if result.success {
            ActionResult::Success
        } else {
            ActionResult::Failure(result.message.clone())
        };
        self.record(action_type.clone(), outcome, Some(result.duration_ms)).await;

        if action_type.is_driver_action() {
            if let Ok(page) = self.executor.driver().page().await {
                self.page = page;
            }
            info!(line, action = action_type.name(), msg = %result.message, "action executed");
        }

        if let ActionType::Assert { passed: false, message } = action_type {
            warn!(line, message = message.as_deref().unwrap_or(""), "assertion failed");
            return Err(ExecutionError::assertion(message, line));
        }
        if !result.success {
            return Err(ExecutionError::new(ExecutionErrorKind::Action, result.message, line));
        }

        if let Action::Extract { name, .. } = action {
            let text = Value::String(result.data.unwrap_or_default());
            self.bind_extracted(name, text, line)?;
        }
        Ok(())
    }

    /// Stores extracted text, reusing a binding of the current scope.
    fn bind_extracted(&mut self, name: &str, text: Value, line: usize) -> Result<(), ExecutionError> {
        if self.scopes.lookup_local(self.scope, name).is_some() {
            return self.store(name, &[], text, line);
        }
        self.declare(name, SymbolKind::Mutable, text, line)
    }

    // ---- imports ----

    async fn execute_import(&mut self, import: &Import, line: usize) -> Result<(), ExecutionError> {
        match import {
            Import::Resource { alias, path, options } => {
                let options = match options {
                    Some(expr) => Some(self.eval(expr).await?),
                    None => None,
                };
                let config_error = |message: String| {
                    ExecutionError::new(ExecutionErrorKind::Configuration, message, line)
                };
                let transport = self
                    .http
                    .clone()
                    .ok_or_else(|| config_error(format!("cannot import '{}': no HTTP transport is configured", alias)))?;
                let resolved = self.base_dir.join(path);
                let provider = OpenApiProvider::load(
                    alias,
                    &resolved,
                    options.as_ref(),
                    self.config.default_timeout_ms,
                    transport,
                )
                .map_err(|e| config_error(format!("cannot import '{}': {}", alias, e)))?;

                info!(
                    line,
                    alias = %alias,
                    path = %resolved.display(),
                    operations = provider.methods().len(),
                    "imported resource"
                );
                self.registry.register(Arc::new(provider));
                self.declare(alias, SymbolKind::Imported, Value::Namespace(Namespace::Service(alias.clone())), line)
            }
            Import::Members { members, source } => {
                let namespace = self.lookup(source, line)?;
                for member in members {
                    let value = match &namespace {
                        Value::Namespace(Namespace::Static(ns)) => builtins::static_member(*ns, &member.name),
                        Value::Namespace(Namespace::Service(ns)) => self
                            .registry
                            .get(ns)
                            .filter(|provider| provider.supports(&member.name))
                            .map(|_| Value::Capability {
                                namespace: ns.clone(),
                                method: member.name.clone(),
                            }),
                        _ => None,
                    };
                    let value = value.ok_or_else(|| {
                        ExecutionError::new(
                            ExecutionErrorKind::UndefinedName,
                            format!("'{}' has no member '{}'", source, member.name),
                            line,
                        )
                    })?;
                    self.declare(member.binding(), SymbolKind::Imported, value, line)?;
                }
                info!(line, source = %source, members = members.len(), "imported members");
                Ok(())
            }
        }
    }

    // ---- calls ----

    pub(crate) fn call_value<'a>(&'a mut self, callee: Value, args: CallArgs, line: usize) -> Eval<'a, Value> {
        Box::pin(async move {
            match callee {
                Value::Function(function) => self.call_function(function, args, line).await,
                Value::Builtin(builtin) => builtins::call_builtin(builtin, &args, line),
                Value::Capability { namespace, method } => self.call_namespace(&namespace, &method, args, line).await,
                other => Err(ExecutionError::new(
                    ExecutionErrorKind::NotCallable,
                    format!("{} is not callable", other.type_name()),
                    line,
                )),
            }
        })
    }

    async fn call_function(&mut self, function: Arc<FunctionValue>, args: CallArgs, line: usize) -> Result<Value, ExecutionError> {
        let identity = Arc::as_ptr(&function) as usize;
        if self.call_stack.iter().any(|(running, _)| *running == identity) {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Recursion,
                format!("recursion not supported: '{}' is already running", function.name),
                line,
            ));
        }

        let frame = self.scopes.child(function.closure);
        if let Err(e) = self.bind_arguments(&function, frame, args, line) {
            self.scopes.release(frame);
            return Err(e);
        }

        self.call_stack.push((identity, function.name.clone()));
        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        debug!(line, function = %function.name, depth = self.call_stack.len(), "call");

        let result = match &function.body {
            FunctionBody::Block(decl) => match self.execute_block(&decl.body, frame).await {
                Ok(Control::Return(value)) => Ok(value),
                Ok(Control::Normal) => Ok(Value::Null),
                Ok(Control::Break | Control::Continue) => Err(ExecutionError::new(
                    ExecutionErrorKind::ControlFlow,
                    format!("'break' or 'continue' escaped function '{}'", function.name),
                    line,
                )),
                Err(e) => Err(e),
            },
            FunctionBody::Lambda(decl) => {
                let outer = std::mem::replace(&mut self.scope, frame);
                let value = self.eval(&decl.body).await;
                self.scope = outer;
                value
            }
        };

        self.loop_depth = saved_loops;
        self.call_stack.pop();
        self.scopes.release(frame);
        result
    }

    /// Binds positional arguments in order and named ones by parameter name.
    /// Every parameter must end up bound exactly once.
    fn bind_arguments(
        &mut self,
        function: &FunctionValue,
        frame: ScopeId,
        args: CallArgs,
        line: usize,
    ) -> Result<(), ExecutionError> {
        let params = function.params();
        let given = args.len();
        let arity_error = |message: String| ExecutionError::new(ExecutionErrorKind::Arity, message, line);
        let count_error = || {
            arity_error(format!(
                "'{}' expects {} argument(s), got {}",
                function.name,
                params.len(),
                given
            ))
        };

        if args.positional.len() > params.len() {
            return Err(count_error());
        }
        let mut bound: Vec<Option<Value>> = vec![None; params.len()];
        for (slot, value) in bound.iter_mut().zip(args.positional) {
            *slot = Some(value);
        }
        for (name, value) in args.named {
            let index = params
                .iter()
                .position(|p| p == &name)
                .ok_or_else(|| arity_error(format!("'{}' has no parameter '{}'", function.name, name)))?;
            if bound[index].is_some() {
                return Err(arity_error(format!("argument '{}' given more than once", name)));
            }
            bound[index] = Some(value);
        }

        for (param, value) in params.iter().zip(bound) {
            let value = value.ok_or_else(&count_error)?;
            self.declare_in(frame, param, SymbolKind::Parameter, value, line)?;
        }
        Ok(())
    }

    pub(crate) async fn call_namespace(
        &mut self,
        namespace: &str,
        method: &str,
        args: CallArgs,
        line: usize,
    ) -> Result<Value, ExecutionError> {
        match StaticNamespace::ALL.into_iter().find(|ns| ns.name() == namespace) {
            Some(ns) => builtins::call_static(ns, method, &args, line),
            None => self.invoke_service(namespace, method, args, line).await,
        }
    }

    /// Calls a provider. HTTP-like providers also update `response`.
    pub(crate) async fn invoke_service(
        &mut self,
        namespace: &str,
        method: &str,
        args: CallArgs,
        line: usize,
    ) -> Result<Value, ExecutionError> {
        info!(line, namespace, method, "service call");
        match self.registry.invoke(namespace, method, args).await {
            Ok(value) => {
                let records = self.registry.get(namespace).map(|p| p.records_response()).unwrap_or(false);
                if records {
                    self.response = value.clone();
                }
                Ok(value)
            }
            Err(e) => Err(provider_error(namespace, method, e, line)),
        }
    }
}

fn provider_error(namespace: &str, method: &str, error: ProviderError, line: usize) -> ExecutionError {
    match error {
        ProviderError::Configuration(_) => ExecutionError::new(
            ExecutionErrorKind::Configuration,
            format!("{}.{}: {}", namespace, method, error),
            line,
        ),
        ProviderError::NotSupported { .. } => {
            ExecutionError::new(ExecutionErrorKind::Provider, error.to_string(), line)
        }
        other => ExecutionError::new(
            ExecutionErrorKind::Provider,
            format!("{}.{} failed: {}", namespace, method, other),
            line,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording_driver::RecordingDriver;

    async fn run(source: &str) -> Result<ExecutionReport, TrellisError> {
        Interpreter::new(Arc::new(RecordingDriver::new())).run_source(source).await
    }

    fn execution_error(result: Result<ExecutionReport, TrellisError>) -> ExecutionError {
        match result {
            Err(TrellisError::Execution(e)) => e,
            other => panic!("Expected execution error, got {:?}", other.map(|r| r.logs)),
        }
    }

    #[tokio::test]
    async fn test_function_call_returns_value() {
        let report = run("function add(a, b):\n    return a + b\nlet r = add(10, 20)").await.unwrap();
        assert_eq!(report.global("r"), Some(&Value::Integer(30)));
    }

    #[tokio::test]
    async fn test_function_without_return_is_null() {
        let report = run("function noop():\n    let x = 1\nlet r = noop()").await.unwrap();
        assert_eq!(report.global("r"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_direct_recursion_is_rejected() {
        let err = execution_error(run("function f(n):\n    return f(n - 1)\nf(3)").await);
        assert_eq!(err.kind, ExecutionErrorKind::Recursion);
        assert!(err.message.contains("recursion not supported"));
        assert_eq!(err.line, 2);
    }

    #[tokio::test]
    async fn test_arguments_are_passed_by_value() {
        let source = "let num = 5\nfunction double(n):\n    n = n * 2\n    return n\nlet result = double(num)";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("num"), Some(&Value::Integer(5)));
        assert_eq!(report.global("result"), Some(&Value::Integer(10)));
    }

    #[tokio::test]
    async fn test_arity_mismatch() {
        let err = execution_error(run("function add(a, b):\n    return a + b\nadd(1)").await);
        assert_eq!(err.kind, ExecutionErrorKind::Arity);
        assert_eq!(err.message, "'add' expects 2 argument(s), got 1");
    }

    #[tokio::test]
    async fn test_named_arguments_bind_by_name() {
        let source = "function sub(a, b):\n    return a - b\nlet r = sub(b: 1, a: 10)";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("r"), Some(&Value::Integer(9)));
    }

    #[tokio::test]
    async fn test_unknown_named_argument() {
        let err = execution_error(run("function f(a):\n    return a\nf(b: 1)").await);
        assert_eq!(err.kind, ExecutionErrorKind::Arity);
    }

    #[tokio::test]
    async fn test_break_and_continue() {
        let source = "\
let total = 0
for n in [1, 2, 3, 4, 5, 6]:
    if n == 2:
        continue
    if n == 5:
        break
    total += n
";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("total"), Some(&Value::Integer(8)));
    }

    #[tokio::test]
    async fn test_return_from_inside_loop() {
        let source = "\
function first_even(items):
    for x in items:
        if x % 2 == 0:
            return x
    return null
let r = first_even([3, 5, 8, 10])
";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("r"), Some(&Value::Integer(8)));
    }

    #[tokio::test]
    async fn test_top_level_return_is_control_flow_error() {
        let err = execution_error(run("let x = 1\nreturn x").await);
        assert_eq!(err.kind, ExecutionErrorKind::ControlFlow);
        assert_eq!(err.line, 2);
    }

    #[tokio::test]
    async fn test_while_loop() {
        let report = run("let i = 0\nwhile i < 5:\n    i += 1").await.unwrap();
        assert_eq!(report.global("i"), Some(&Value::Integer(5)));
    }

    #[tokio::test]
    async fn test_loop_body_gets_fresh_scope_per_iteration() {
        let source = "let seen = []\nfor x in [1, 2]:\n    let doubled = x * 2\n    seen = seen + [doubled]";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("seen"), Some(&Value::from(vec![2i64, 4])));
    }

    #[tokio::test]
    async fn test_when_matches_first_arm() {
        let source = "\
let code = 404
let kind = \"\"
when code:
    200, 201:
        kind = \"ok\"
    404:
        kind = \"missing\"
    else:
        kind = \"other\"
";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("kind"), Some(&Value::string("missing")));
    }

    #[tokio::test]
    async fn test_log_and_assert() {
        let report = run("log \"hello\", 1 + 1").await.unwrap();
        assert_eq!(report.logs, vec!["hello 2"]);

        let err = execution_error(run("let x = 1\nassert x == 2, \"x is two\"").await);
        assert_eq!(err.kind, ExecutionErrorKind::Assertion);
        assert_eq!(err.message, "Assertion failed: x is two");
        assert_eq!(err.line, 2);
    }

    #[tokio::test]
    async fn test_session_records_markers() {
        let report = run("log \"a\"").await.unwrap();
        assert_eq!(report.actions.first().map(|a| &a.action), Some(&ActionType::StartSession));
        assert_eq!(report.actions.last().map(|a| &a.action), Some(&ActionType::EndSession));
    }

    #[tokio::test]
    async fn test_each_run_gets_its_own_session() {
        let mut interpreter = Interpreter::new(Arc::new(RecordingDriver::new()));
        let program = parser::parse("log \"a\"").unwrap();
        let first = interpreter.run(&program).await.unwrap();
        let first_id = interpreter.session().id;
        let second = interpreter.run(&program).await.unwrap();

        assert_ne!(interpreter.session().id, first_id);
        assert_eq!(second.actions.len(), first.actions.len());
        let starts = second
            .actions
            .iter()
            .filter(|a| a.action == ActionType::StartSession)
            .count();
        assert_eq!(starts, 1);
        assert_eq!(second.actions.first().map(|a| &a.action), Some(&ActionType::StartSession));
        assert_eq!(second.actions.last().map(|a| &a.action), Some(&ActionType::EndSession));
    }

    async fn live_scopes_after(source: &str) -> usize {
        let mut interpreter = Interpreter::new(Arc::new(RecordingDriver::new()));
        interpreter.run_source(source).await.unwrap();
        interpreter.scopes.live_scopes()
    }

    #[tokio::test]
    async fn test_loop_lambdas_do_not_accumulate_scopes() {
        let mapped = |n: usize| format!("let xs = [1]\nfor i in range({}):\n    let ys = xs.map(x => x + i)", n);
        assert_eq!(live_scopes_after(&mapped(10)).await, live_scopes_after(&mapped(200)).await);

        let stored = |n: usize| format!("for i in range({}):\n    let f = x => x + i\n    let y = f(1)", n);
        assert_eq!(live_scopes_after(&stored(10)).await, live_scopes_after(&stored(200)).await);
    }

    #[tokio::test]
    async fn test_escaped_closures_keep_their_iteration() {
        let source = "\
let fs = []
for i in range(5):
    fs.push(x => x + i)
let r = fs[2](1)
let last = fs[4](10)
";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("r"), Some(&Value::Integer(3)));
        assert_eq!(report.global("last"), Some(&Value::Integer(14)));
    }

    #[tokio::test]
    async fn test_dropped_escaped_closures_release_their_scopes() {
        let escaped = |n: usize| {
            format!(
                "let total = 0\nfor i in range({}):\n    let fs = []\n    fs.push(x => x + i)\n    total = total + fs[0](1)",
                n
            )
        };
        let small = live_scopes_after(&escaped(10)).await;
        let large = live_scopes_after(&escaped(500)).await;
        assert!(large <= small + 64, "{} scopes after 500 iterations, {} after 10", large, small);
    }

    #[tokio::test]
    async fn test_closure_keeps_defining_scope() {
        let source = "\
function make_adder(n):
    return x => x + n
let add5 = make_adder(5)
let r = add5(10)
";
        let report = run(source).await.unwrap();
        assert_eq!(report.global("r"), Some(&Value::Integer(15)));
    }

    #[tokio::test]
    async fn test_import_without_transport_is_configuration_error() {
        let err = execution_error(run("import api from \"api.json\"").await);
        assert_eq!(err.kind, ExecutionErrorKind::Configuration);
        assert_eq!(err.line, 1);
    }

    #[tokio::test]
    async fn test_http_without_transport_is_not_supported() {
        let err = execution_error(run("let r = http.get(\"http://x.test\")").await);
        assert_eq!(err.kind, ExecutionErrorKind::Provider);
        assert!(err.message.contains("not supported"));
    }

    #[tokio::test]
    async fn test_seeded_random_is_repeatable() {
        let source = "let n = random.int(1, 1000)";
        let config = TrellisConfig {
            random_seed: Some(11),
            ..TrellisConfig::default()
        };
        let mut a = Interpreter::new(Arc::new(RecordingDriver::new())).with_config(config.clone());
        let mut b = Interpreter::new(Arc::new(RecordingDriver::new())).with_config(config);
        let x = a.run_source(source).await.unwrap();
        let y = b.run_source(source).await.unwrap();
        assert_eq!(x.global("n"), y.global("n"));
    }
}
