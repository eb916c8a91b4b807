//! Lexical scopes and symbols.
//!
//! The same [`ScopeArena`] backs both the parser's static checks and the
//! interpreter's name resolution, so both walk an identically shaped tree:
//!
//! ```text
//! root (reserved: system variables, builtin namespaces, builtin functions)
//! └── program
//!     ├── function body (parameters + locals)
//!     ├── loop body / branch / step / lambda
//!     └── ...
//! ```
//!
//! Scopes live in an arena and are addressed by [`ScopeId`]. A closure keeps
//! the id of the scope it was created in, and [`ScopeArena::capture`] records
//! a weak handle to it on that scope and every ancestor. When the block that
//! opened a scope exits, [`ScopeArena::release`] recycles it unless a closure
//! that depends on it is still alive somewhere other than the scope's own
//! bindings. Scopes kept that way are retained and revisited by
//! [`ScopeArena::collect`] once enough of them pile up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::ast::SystemVariable;
use crate::value::{BuiltinFunction, FunctionValue, Namespace, StaticNamespace, Value, SERVICE_NAMESPACES};

pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Mutable,
    Constant,
    Function,
    Parameter,
    Imported,
    /// `page`, `env`, `response`, `browser`, `context`, `config`.
    System,
    /// Builtin namespaces and functions.
    Builtin,
}

impl SymbolKind {
    pub fn is_reserved(&self) -> bool {
        matches!(self, SymbolKind::System | SymbolKind::Builtin)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            SymbolKind::Mutable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Function => "function",
            SymbolKind::Parameter => "parameter",
            SymbolKind::Imported => "import",
            SymbolKind::System => "system variable",
            SymbolKind::Builtin => "builtin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub line: usize,
    /// Live value at run time; `None` while parsing.
    pub value: Option<Value>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, line: usize, value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            line,
            value,
        }
    }
}

/// Why a declaration was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclareError {
    /// Already declared in the same scope, on `line`.
    Duplicate { line: usize },
    /// The name belongs to a reserved binding.
    Reserved { kind: SymbolKind },
}

/// Retained scopes tolerated before a collection runs.
const MIN_COLLECT_THRESHOLD: usize = 32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    #[default]
    Open,
    /// Released by its block but still needed by a live closure.
    Retained,
    Free,
}

#[derive(Debug, Default)]
struct ScopeNode {
    symbols: Vec<Symbol>,
    index: HashMap<String, usize>,
    parent: Option<ScopeId>,
    /// Closures created in this scope or any descendant.
    closures: Vec<Weak<FunctionValue>>,
    state: ScopeState,
}

impl ScopeNode {
    fn vacant() -> Self {
        Self {
            state: ScopeState::Free,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ScopeArena {
    nodes: Vec<ScopeNode>,
    free: Vec<ScopeId>,
    retained: Vec<ScopeId>,
    collect_threshold: usize,
}

fn function_key(function: &Arc<FunctionValue>) -> usize {
    Arc::as_ptr(function) as usize
}

/// Counts every function reachable inside `value`, keyed by identity.
fn count_functions(value: &Value, counts: &mut HashMap<usize, usize>) {
    match value {
        Value::Function(f) => *counts.entry(function_key(f)).or_default() += 1,
        Value::List(items) => items.iter().for_each(|v| count_functions(v, counts)),
        Value::Object(map) => map.values().for_each(|v| count_functions(v, counts)),
        _ => {}
    }
}

fn functions_in<'a>(value: &'a Value, out: &mut Vec<&'a Arc<FunctionValue>>) {
    match value {
        Value::Function(f) => out.push(f),
        Value::List(items) => items.iter().for_each(|v| functions_in(v, out)),
        Value::Object(map) => map.values().for_each(|v| functions_in(v, out)),
        _ => {}
    }
}

impl ScopeArena {
    pub const ROOT: ScopeId = 0;

    /// Creates an arena whose root holds every reserved binding.
    pub fn new() -> Self {
        let mut arena = Self {
            nodes: vec![ScopeNode::default()],
            free: Vec::new(),
            retained: Vec::new(),
            collect_threshold: MIN_COLLECT_THRESHOLD,
        };
        for (name, kind, value) in reserved_bindings() {
            let node = &mut arena.nodes[Self::ROOT];
            node.index.insert(name.clone(), node.symbols.len());
            node.symbols.push(Symbol::new(name, kind, 0, Some(value)));
        }
        arena
    }

    pub fn child(&mut self, parent: ScopeId) -> ScopeId {
        let node = ScopeNode {
            parent: Some(parent),
            ..ScopeNode::default()
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.nodes.get(scope).and_then(|n| n.parent)
    }

    /// Records that `function` closes over its defining scope, so neither
    /// that scope nor any ancestor is recycled while the function lives.
    pub fn capture(&mut self, function: &Arc<FunctionValue>) {
        let weak = Arc::downgrade(function);
        let mut current = Some(function.closure);
        while let Some(id) = current {
            if id == Self::ROOT {
                break;
            }
            let Some(node) = self.nodes.get_mut(id) else { break };
            if node.closures.len() == node.closures.capacity() {
                node.closures.retain(|w| w.strong_count() > 0);
            }
            node.closures.push(weak.clone());
            current = node.parent;
        }
    }

    /// Called when the block that opened `scope` exits. The scope is recycled
    /// unless a live closure depending on it is held outside its own bindings.
    pub fn release(&mut self, scope: ScopeId) {
        if scope == Self::ROOT {
            return;
        }
        let Some(node) = self.nodes.get(scope) else { return };
        if node.state != ScopeState::Open {
            return;
        }
        if self.held_outside(scope) {
            self.nodes[scope].state = ScopeState::Retained;
            self.retained.push(scope);
            if self.retained.len() >= self.collect_threshold {
                self.collect();
            }
        } else {
            self.recycle(scope);
        }
    }

    /// True when some live closure recorded on `scope` has more strong
    /// references than the scope's own bindings account for.
    fn held_outside(&self, scope: ScopeId) -> bool {
        let node = &self.nodes[scope];
        let mut live = node.closures.iter().filter(|w| w.strong_count() > 0).peekable();
        if live.peek().is_none() {
            return false;
        }
        let mut own = HashMap::new();
        for symbol in &node.symbols {
            if let Some(value) = &symbol.value {
                count_functions(value, &mut own);
            }
        }
        live.any(|w| {
            let key = w.as_ptr() as usize;
            w.strong_count() > own.get(&key).copied().unwrap_or(0)
        })
    }

    fn recycle(&mut self, scope: ScopeId) {
        self.nodes[scope] = ScopeNode::vacant();
        self.free.push(scope);
    }

    /// Frees every retained scope that no open scope and no externally held
    /// closure can reach. References between retained scopes do not count.
    pub fn collect(&mut self) {
        let candidates: HashSet<ScopeId> = self.retained.iter().copied().collect();

        // References held by retained bindings, per closure.
        let mut internal = HashMap::new();
        for &id in &candidates {
            for symbol in &self.nodes[id].symbols {
                if let Some(value) = &symbol.value {
                    count_functions(value, &mut internal);
                }
            }
        }

        let mut pending: Vec<ScopeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.state == ScopeState::Open)
            .map(|(id, _)| id)
            .collect();
        for &id in &candidates {
            for weak in &self.nodes[id].closures {
                let key = weak.as_ptr() as usize;
                if weak.strong_count() > internal.get(&key).copied().unwrap_or(0) {
                    if let Some(function) = weak.upgrade() {
                        pending.push(function.closure);
                    }
                }
            }
        }

        let mut reachable = HashSet::new();
        while let Some(id) = pending.pop() {
            let Some(node) = self.nodes.get(id) else { continue };
            if node.state == ScopeState::Free || !reachable.insert(id) {
                continue;
            }
            pending.extend(node.parent);
            let mut functions = Vec::new();
            for symbol in &node.symbols {
                if let Some(value) = &symbol.value {
                    functions_in(value, &mut functions);
                }
            }
            pending.extend(functions.iter().map(|f| f.closure));
        }

        let retained = std::mem::take(&mut self.retained);
        for id in retained {
            if reachable.contains(&id) {
                self.retained.push(id);
            } else {
                self.recycle(id);
            }
        }
        self.collect_threshold = MIN_COLLECT_THRESHOLD.max(self.retained.len() * 2);
    }

    /// Declares `symbol` in `scope`. Fails on a duplicate in the same scope
    /// or on any name that resolves to a reserved binding.
    pub fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> Result<(), DeclareError> {
        if let Some((_, existing)) = self.resolve(scope, &symbol.name) {
            if existing.kind.is_reserved() {
                return Err(DeclareError::Reserved { kind: existing.kind });
            }
        }
        let node = &mut self.nodes[scope];
        if let Some(&i) = node.index.get(&symbol.name) {
            return Err(DeclareError::Duplicate { line: node.symbols[i].line });
        }
        node.index.insert(symbol.name.clone(), node.symbols.len());
        node.symbols.push(symbol);
        Ok(())
    }

    /// Finds `name` in `scope` or the nearest enclosing scope.
    pub fn resolve(&self, scope: ScopeId, name: &str) -> Option<(ScopeId, &Symbol)> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let node = self.nodes.get(id)?;
            if let Some(&i) = node.index.get(name) {
                return Some((id, &node.symbols[i]));
            }
            current = node.parent;
        }
        None
    }

    pub fn resolve_mut(&mut self, scope: ScopeId, name: &str) -> Option<&mut Symbol> {
        let (id, _) = self.resolve(scope, name)?;
        let node = &mut self.nodes[id];
        let i = *node.index.get(name)?;
        node.symbols.get_mut(i)
    }

    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<&Symbol> {
        let node = self.nodes.get(scope)?;
        node.index.get(name).map(|&i| &node.symbols[i])
    }

    /// Symbols of one scope, in declaration order.
    pub fn symbols(&self, scope: ScopeId) -> &[Symbol] {
        self.nodes.get(scope).map(|n| n.symbols.as_slice()).unwrap_or(&[])
    }

    /// Name → value map of one scope, for reporting.
    pub fn snapshot(&self, scope: ScopeId) -> BTreeMap<String, Value> {
        self.symbols(scope)
            .iter()
            .filter_map(|s| s.value.clone().map(|v| (s.name.clone(), v)))
            .collect()
    }

    /// Number of scopes currently allocated (open or retained).
    pub fn live_scopes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

impl Default for ScopeArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Every reserved name, its kind, and the value it is bound to.
pub fn reserved_bindings() -> Vec<(String, SymbolKind, Value)> {
    let mut bindings = Vec::new();
    for var in SystemVariable::ALL {
        bindings.push((var.name().to_string(), SymbolKind::System, Value::Namespace(Namespace::System(var))));
    }
    for ns in StaticNamespace::ALL {
        bindings.push((ns.name().to_string(), SymbolKind::Builtin, Value::Namespace(Namespace::Static(ns))));
    }
    for name in SERVICE_NAMESPACES {
        bindings.push((
            name.to_string(),
            SymbolKind::Builtin,
            Value::Namespace(Namespace::Service(name.to_string())),
        ));
    }
    for func in BuiltinFunction::ALL {
        bindings.push((func.name().to_string(), SymbolKind::Builtin, Value::Builtin(func)));
    }
    bindings
}
