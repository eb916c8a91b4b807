//! Syntax tree produced by the parser and walked by the interpreter.
//!
//! Every statement and expression carries the source line it started on.
//! Function and lambda declarations sit behind an [`Arc`] so closures can
//! share them without copying bodies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Program {
    pub statements: Vec<Statement>,
    /// `key: value` pairs from a leading `"""` block, if any.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    Let {
        name: String,
        value: Expression,
    },
    Const {
        name: String,
        value: Expression,
    },
    Assign {
        target: AssignTarget,
        op: AssignOp,
        value: Expression,
    },
    If {
        branches: Vec<ConditionalBranch>,
        else_block: Option<Vec<Statement>>,
    },
    When {
        subject: Option<Expression>,
        arms: Vec<WhenArm>,
        else_block: Option<Vec<Statement>>,
    },
    ForEach {
        first: String,
        second: Option<String>,
        iterable: Expression,
        body: Vec<Statement>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
    },
    Break,
    Continue,
    Function(Arc<FunctionDecl>),
    Return(Option<Expression>),
    Action(Action),
    Step {
        name: Expression,
        body: Vec<Statement>,
    },
    Import(Import),
    /// A bare call evaluated for its side effects.
    Expression(Expression),
}

#[derive(Debug, Clone)]
pub struct ConditionalBranch {
    pub condition: Expression,
    pub body: Vec<Statement>,
}

/// One arm of a `when` block. With a subject, the arm matches when any
/// pattern equals the subject; without one, when any pattern is truthy.
#[derive(Debug, Clone)]
pub struct WhenArm {
    pub patterns: Vec<Expression>,
    pub body: Vec<Statement>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Statement>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct LambdaDecl {
    pub params: Vec<String>,
    pub body: Expression,
    pub line: usize,
    pub column: usize,
}

impl LambdaDecl {
    /// Synthetic name used in call traces and error messages.
    pub fn display_name(&self) -> String {
        format!("<lambda@{}:{}>", self.line, self.column)
    }
}

/// The place an assignment writes to: a variable, optionally followed by
/// member and index steps (`user.tags[0] = "x"`).
#[derive(Debug, Clone)]
pub struct AssignTarget {
    pub root: String,
    pub path: Vec<Accessor>,
}

#[derive(Debug, Clone)]
pub enum Accessor {
    Member(String),
    Index(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    /// The binary operator a compound assignment applies.
    pub fn binary(&self) -> Option<BinaryOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        }
    }
}

/// Statements forwarded to the automation backend, plus `assert` and `log`
/// which the interpreter handles itself.
#[derive(Debug, Clone)]
pub enum Action {
    Navigate { url: Expression },
    Click { selector: Expression },
    Type { selector: Expression, text: Expression },
    Select { selector: Expression, value: Expression },
    Hover { selector: Expression },
    Wait { duration: Expression },
    WaitFor { selector: Expression, timeout: Option<Expression> },
    Extract { selector: Expression, name: String },
    Screenshot { name: Option<Expression> },
    Assert { condition: Expression, message: Option<Expression> },
    Log { values: Vec<Expression> },
}

#[derive(Debug, Clone)]
pub enum Import {
    /// `import alias from "petstore.json" [with {...}]`
    Resource {
        alias: String,
        path: String,
        options: Option<Expression>,
    },
    /// `import { a, b as c } from namespace`
    Members {
        members: Vec<ImportMember>,
        source: String,
    },
}

#[derive(Debug, Clone)]
pub struct ImportMember {
    pub name: String,
    pub alias: Option<String>,
}

impl ImportMember {
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    pub line: usize,
    pub column: usize,
}

impl Expression {
    pub fn new(kind: ExprKind, line: usize, column: usize) -> Self {
        Self { kind, line, column }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(String),
    System(SystemVariable),
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Member {
        object: Box<Expression>,
        name: String,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    MethodCall {
        object: Box<Expression>,
        method: String,
        args: Vec<Argument>,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Argument>,
    },
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
    Interpolated(Vec<InterpolationPart>),
    Lambda(Arc<LambdaDecl>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// A call argument, positional or `name: value`.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Expression,
}

#[derive(Debug, Clone)]
pub enum InterpolationPart {
    Text(String),
    Expr(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
}

/// Reserved, read-only runtime namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemVariable {
    Page,
    Env,
    Response,
    Browser,
    Context,
    Config,
}

impl SystemVariable {
    pub const ALL: [SystemVariable; 6] = [
        SystemVariable::Page,
        SystemVariable::Env,
        SystemVariable::Response,
        SystemVariable::Browser,
        SystemVariable::Context,
        SystemVariable::Config,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        SystemVariable::ALL.into_iter().find(|v| v.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemVariable::Page => "page",
            SystemVariable::Env => "env",
            SystemVariable::Response => "response",
            SystemVariable::Browser => "browser",
            SystemVariable::Context => "context",
            SystemVariable::Config => "config",
        }
    }
}
