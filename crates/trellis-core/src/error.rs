//! Error types for every stage of a script's life.
//!
//! Each stage has its own error type so callers can tell a malformed token
//! stream from a rejected program from a failed run:
//!
//! - [`LexicalError`] - raised by the tokenizer, before any parsing.
//! - [`ParserError`] - syntax errors and the static rules `VR-001`..`VR-004`.
//! - [`ExecutionError`] - anything that goes wrong while the script runs.
//!
//! [`TrellisError`] wraps all of them for APIs that cover several stages.
//! Every variant carries a stable code (see [`TrellisError::code`]) and a
//! 1-based source line.

use thiserror::Error;

/// Category of a [`LexicalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexicalErrorKind {
    IllegalCharacter,
    UnterminatedString,
    InconsistentIndentation,
    UnterminatedComment,
    TabIndentation,
    MalformedNumber,
}

impl LexicalErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            LexicalErrorKind::IllegalCharacter => "LEX-001",
            LexicalErrorKind::UnterminatedString => "LEX-002",
            LexicalErrorKind::InconsistentIndentation => "LEX-003",
            LexicalErrorKind::UnterminatedComment => "LEX-004",
            LexicalErrorKind::TabIndentation => "LEX-005",
            LexicalErrorKind::MalformedNumber => "LEX-006",
        }
    }
}

/// A malformed token stream.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Lexical error at line {line}, column {column}: {message} [{code}]", code = .kind.code())]
pub struct LexicalError {
    pub kind: LexicalErrorKind,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl LexicalError {
    pub fn new(kind: LexicalErrorKind, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
            column,
        }
    }
}

/// The rule a [`ParserError`] was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCode {
    /// `VR-001`: a name is read before it is declared.
    UndefinedReference,
    /// `VR-002`: a constant is the target of an assignment.
    ImmutableRebinding,
    /// `VR-003`: a name is declared twice in the same scope.
    DuplicateDeclaration,
    /// `VR-004`: a system variable or builtin is assigned or redeclared.
    ReservedBinding,
    /// `SYN-001`: unexpected token or malformed construct.
    Syntax,
    /// `SYN-002`: `break`/`continue` outside a loop.
    ControlFlow,
}

impl RuleCode {
    pub fn code(&self) -> &'static str {
        match self {
            RuleCode::UndefinedReference => "VR-001",
            RuleCode::ImmutableRebinding => "VR-002",
            RuleCode::DuplicateDeclaration => "VR-003",
            RuleCode::ReservedBinding => "VR-004",
            RuleCode::Syntax => "SYN-001",
            RuleCode::ControlFlow => "SYN-002",
        }
    }
}

/// A program rejected before execution.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Parse error at line {line}: {message} [{code}]", code = .rule.code())]
pub struct ParserError {
    pub rule: RuleCode,
    pub message: String,
    pub line: usize,
}

impl ParserError {
    pub fn new(rule: RuleCode, message: impl Into<String>, line: usize) -> Self {
        Self {
            rule,
            message: message.into(),
            line,
        }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::new(RuleCode::Syntax, message, line)
    }
}

/// Category of an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    UndefinedFunction,
    Arity,
    NotCallable,
    Recursion,
    Assertion,
    Type,
    Provider,
    Action,
    ControlFlow,
    Configuration,
    UndefinedName,
    IndexOutOfRange,
}

impl ExecutionErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionErrorKind::UndefinedFunction => "RT-001",
            ExecutionErrorKind::Arity => "RT-002",
            ExecutionErrorKind::NotCallable => "RT-003",
            ExecutionErrorKind::Recursion => "RT-004",
            ExecutionErrorKind::Assertion => "RT-005",
            ExecutionErrorKind::Type => "RT-006",
            ExecutionErrorKind::Provider => "RT-007",
            ExecutionErrorKind::Action => "RT-008",
            ExecutionErrorKind::ControlFlow => "RT-009",
            ExecutionErrorKind::Configuration => "RT-010",
            ExecutionErrorKind::UndefinedName => "RT-011",
            ExecutionErrorKind::IndexOutOfRange => "RT-012",
        }
    }
}

/// A failure while a script runs. Aborts the remaining script.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Runtime error at line {line}: {message} [{code}]", code = .kind.code())]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub line: usize,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
        }
    }

    pub fn type_error(message: impl Into<String>, line: usize) -> Self {
        Self::new(ExecutionErrorKind::Type, message, line)
    }

    /// Builds the assertion failure raised by a false `assert`.
    pub fn assertion(message: Option<String>, line: usize) -> Self {
        let message = match message {
            Some(m) => format!("Assertion failed: {}", m),
            None => "Assertion failed".to_string(),
        };
        Self::new(ExecutionErrorKind::Assertion, message, line)
    }
}

/// Umbrella error for APIs spanning several stages.
#[derive(Error, Debug)]
pub enum TrellisError {
    #[error(transparent)]
    Lexical(#[from] LexicalError),

    #[error(transparent)]
    Parse(#[from] ParserError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrellisError {
    /// Process exit code for this error, used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            TrellisError::Execution(_) => 1,
            TrellisError::Lexical(_) | TrellisError::Parse(_) => 2,
            TrellisError::Config(_) => 3,
            TrellisError::Io(_) => 4,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TrellisError::Lexical(e) => e.kind.code(),
            TrellisError::Parse(e) => e.rule.code(),
            TrellisError::Execution(e) => e.kind.code(),
            TrellisError::Config(_) => "CFG-001",
            TrellisError::Io(_) => "IO-001",
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            TrellisError::Lexical(e) => Some(e.line),
            TrellisError::Parse(e) => Some(e.line),
            TrellisError::Execution(e) => Some(e.line),
            TrellisError::Config(_) | TrellisError::Io(_) => None,
        }
    }

    /// The bare message, without location or code.
    pub fn message(&self) -> String {
        match self {
            TrellisError::Lexical(e) => e.message.clone(),
            TrellisError::Parse(e) => e.message.clone(),
            TrellisError::Execution(e) => e.message.clone(),
            TrellisError::Config(msg) => msg.clone(),
            TrellisError::Io(e) => e.to_string(),
        }
    }
}
