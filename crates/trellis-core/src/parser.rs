//! Recursive-descent parser with embedded static checks.
//!
//! The parser walks a [`ScopeArena`] while it builds the tree, so every
//! declaration and reference is checked in source order and the first
//! violation is returned:
//!
//! | code     | rule                                                        |
//! |----------|-------------------------------------------------------------|
//! | `VR-001` | a name is read before it is declared                        |
//! | `VR-002` | a constant (or function / import) is assigned to            |
//! | `VR-003` | a name is declared twice in one scope                       |
//! | `VR-004` | a reserved name is assigned to or declared                  |
//! | `SYN-001`| malformed syntax                                            |
//! | `SYN-002`| `break` / `continue` outside a loop                         |
//!
//! Expressions use one function per precedence level, lowest first:
//! `or`, `and`, `not`, comparison, additive, multiplicative, unary sign,
//! postfix, primary.

use std::sync::Arc;

use crate::ast::*;
use crate::error::{ParserError, RuleCode, TrellisError};
use crate::lexer::{script_metadata, tokenize, tokenize_fragment, StringPart, Token, TokenKind};
use crate::scope::{DeclareError, ScopeArena, ScopeId, Symbol, SymbolKind};
use crate::value::{Namespace, Value};

static EOF: TokenKind = TokenKind::Eof;

/// Tokenizes and parses a whole script.
pub fn parse(source: &str) -> Result<Program, TrellisError> {
    let tokens = tokenize(source)?;
    let mut program = Parser::new(tokens).parse_program()?;
    program.metadata = script_metadata(source);
    Ok(program)
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    scopes: ScopeArena,
    scope: ScopeId,
    /// Loops enclosing the current position within the current function.
    loop_depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let mut scopes = ScopeArena::new();
        let scope = scopes.child(ScopeArena::ROOT);
        Self {
            tokens,
            pos: 0,
            scopes,
            scope,
            loop_depth: 0,
        }
    }

    // ---- token cursor ----

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&EOF)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens.get(self.pos + offset).map(|t| &t.kind).unwrap_or(&EOF)
    }

    fn current_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn current_column(&self) -> usize {
        self.tokens.get(self.pos).map_or(1, |t| t.column)
    }

    fn advance(&mut self) -> Token {
        match self.tokens.get(self.pos) {
            Some(token) => {
                let token = token.clone();
                self.pos += 1;
                token
            }
            None => Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                line: self.current_line(),
                column: 1,
            },
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> ParserError {
        ParserError::syntax(
            format!("Expected {}, found {}", expected, self.peek().describe()),
            self.current_line(),
        )
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ParserError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String, ParserError> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    /// Accepts an identifier or a keyword used as a name (`.type`, `{step: 1}`).
    fn expect_name(&mut self, what: &str) -> Result<String, ParserError> {
        if let TokenKind::Identifier(name) = self.peek() {
            let name = name.clone();
            self.advance();
            return Ok(name);
        }
        match self.peek().keyword_text() {
            Some(text) => {
                self.advance();
                Ok(text.to_string())
            }
            None => Err(self.unexpected(what)),
        }
    }

    fn at_contextual(&self, word: &str) -> bool {
        matches!(self.peek(), TokenKind::Identifier(name) if name == word)
    }

    fn end_statement(&mut self) -> Result<(), ParserError> {
        match self.peek() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Dedent | TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    // ---- scopes ----

    fn declare(&mut self, name: &str, kind: SymbolKind, line: usize) -> Result<(), ParserError> {
        let symbol = Symbol::new(name, kind, line, None);
        self.scopes.declare(self.scope, symbol).map_err(|e| match e {
            DeclareError::Duplicate { line: previous } => ParserError::new(
                RuleCode::DuplicateDeclaration,
                format!("'{}' is already declared in this scope (line {})", name, previous),
                line,
            ),
            DeclareError::Reserved { kind } => ParserError::new(
                RuleCode::ReservedBinding,
                format!("Cannot redeclare {} '{}'", kind.describe(), name),
                line,
            ),
        })
    }

    fn resolve(&self, name: &str, line: usize) -> Result<&Symbol, ParserError> {
        self.scopes
            .resolve(self.scope, name)
            .map(|(_, symbol)| symbol)
            .ok_or_else(|| {
                ParserError::new(RuleCode::UndefinedReference, format!("Undefined variable '{}'", name), line)
            })
    }

    fn check_assignable(&self, name: &str, line: usize) -> Result<(), ParserError> {
        let symbol = self.resolve(name, line)?;
        match symbol.kind {
            SymbolKind::Mutable | SymbolKind::Parameter => Ok(()),
            SymbolKind::System | SymbolKind::Builtin => Err(ParserError::new(
                RuleCode::ReservedBinding,
                format!("Cannot assign to {} '{}'", symbol.kind.describe(), name),
                line,
            )),
            SymbolKind::Constant | SymbolKind::Function | SymbolKind::Imported => Err(ParserError::new(
                RuleCode::ImmutableRebinding,
                format!(
                    "Cannot assign to {} '{}' (declared at line {})",
                    symbol.kind.describe(),
                    name,
                    symbol.line
                ),
                line,
            )),
        }
    }

    fn enter_scope(&mut self) -> ScopeId {
        let scope = self.scopes.child(self.scope);
        std::mem::replace(&mut self.scope, scope)
    }

    fn leave_scope(&mut self, outer: ScopeId) {
        let inner = std::mem::replace(&mut self.scope, outer);
        self.scopes.release(inner);
    }

    // ---- statements ----

    pub fn parse_program(&mut self) -> Result<Program, ParserError> {
        let mut statements = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => {
                    return Err(ParserError::syntax("Unexpected indent", self.current_line()));
                }
                TokenKind::Dedent => {
                    self.advance();
                }
                _ => statements.push(self.parse_statement()?),
            }
        }
        Ok(Program {
            statements,
            metadata: Default::default(),
        })
    }

    fn parse_statement(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        let kind = match self.peek() {
            TokenKind::Let => self.parse_declaration(false)?,
            TokenKind::Const => self.parse_declaration(true)?,
            TokenKind::If => return self.parse_if(),
            TokenKind::When => return self.parse_when(),
            TokenKind::For => return self.parse_for(),
            TokenKind::While => return self.parse_while(),
            TokenKind::Function => return self.parse_function(),
            TokenKind::Step => return self.parse_step(),
            TokenKind::Break | TokenKind::Continue => {
                let keyword = self.advance();
                if self.loop_depth == 0 {
                    return Err(ParserError::new(
                        RuleCode::ControlFlow,
                        format!("'{}' outside of a loop", keyword.lexeme),
                        line,
                    ));
                }
                if keyword.kind == TokenKind::Break {
                    StatementKind::Break
                } else {
                    StatementKind::Continue
                }
            }
            TokenKind::Return => {
                self.advance();
                let value = match self.peek() {
                    TokenKind::Newline | TokenKind::Dedent | TokenKind::Eof => None,
                    _ => Some(self.parse_expression()?),
                };
                StatementKind::Return(value)
            }
            TokenKind::Import => self.parse_import()?,
            TokenKind::Navigate
            | TokenKind::Click
            | TokenKind::Type
            | TokenKind::Select
            | TokenKind::Hover
            | TokenKind::Wait
            | TokenKind::Extract
            | TokenKind::Screenshot
            | TokenKind::Assert
            | TokenKind::Log => StatementKind::Action(self.parse_action()?),
            TokenKind::Indent => return Err(ParserError::syntax("Unexpected indent", line)),
            _ => self.parse_expression_statement()?,
        };
        self.end_statement()?;
        Ok(Statement { kind, line })
    }

    fn parse_declaration(&mut self, constant: bool) -> Result<StatementKind, ParserError> {
        let line = self.current_line();
        self.advance();
        let name = self.expect_identifier("a variable name")?;
        self.expect(&TokenKind::Assign, "'='")?;
        let value = self.parse_expression()?;
        if constant {
            self.declare(&name, SymbolKind::Constant, line)?;
            Ok(StatementKind::Const { name, value })
        } else {
            self.declare(&name, SymbolKind::Mutable, line)?;
            Ok(StatementKind::Let { name, value })
        }
    }

    fn parse_expression_statement(&mut self) -> Result<StatementKind, ParserError> {
        let line = self.current_line();
        let expr = self.parse_expression()?;

        let op = match self.peek() {
            TokenKind::Assign => Some(AssignOp::Set),
            TokenKind::PlusAssign => Some(AssignOp::Add),
            TokenKind::MinusAssign => Some(AssignOp::Sub),
            TokenKind::StarAssign => Some(AssignOp::Mul),
            TokenKind::SlashAssign => Some(AssignOp::Div),
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let target = assign_target(expr)?;
            self.check_assignable(&target.root, line)?;
            let value = self.parse_expression()?;
            return Ok(StatementKind::Assign { target, op, value });
        }

        match expr.kind {
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } => Ok(StatementKind::Expression(expr)),
            _ => Err(ParserError::syntax("Only calls can be used as statements", line)),
        }
    }

    /// Parses `: NEWLINE INDENT statements DEDENT` into `scope`.
    fn parse_block_in(&mut self, scope: ScopeId) -> Result<Vec<Statement>, ParserError> {
        self.expect(&TokenKind::Colon, "':'")?;
        self.expect(&TokenKind::Newline, "end of line after ':'")?;
        if !self.check(&TokenKind::Indent) {
            return Err(ParserError::syntax("Expected an indented block", self.current_line()));
        }
        self.advance();

        let outer = std::mem::replace(&mut self.scope, scope);
        let mut statements = Vec::new();
        let result = loop {
            match self.peek() {
                TokenKind::Dedent => {
                    self.advance();
                    break Ok(());
                }
                TokenKind::Eof => break Ok(()),
                TokenKind::Newline => {
                    self.advance();
                }
                _ => match self.parse_statement() {
                    Ok(statement) => statements.push(statement),
                    Err(e) => break Err(e),
                },
            }
        };
        self.scope = outer;
        result.map(|_| statements)
    }

    fn parse_block(&mut self) -> Result<Vec<Statement>, ParserError> {
        let scope = self.scopes.child(self.scope);
        let block = self.parse_block_in(scope);
        self.scopes.release(scope);
        block
    }

    fn parse_if(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        self.advance();
        let mut branches = Vec::new();
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        branches.push(ConditionalBranch { condition, body });

        let mut else_block = None;
        while self.check(&TokenKind::Else) {
            self.advance();
            if self.eat(&TokenKind::If) {
                let condition = self.parse_expression()?;
                let body = self.parse_block()?;
                branches.push(ConditionalBranch { condition, body });
            } else {
                else_block = Some(self.parse_block()?);
                break;
            }
        }

        Ok(Statement {
            kind: StatementKind::If { branches, else_block },
            line,
        })
    }

    fn parse_when(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        self.advance();
        let subject = if self.check(&TokenKind::Colon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&TokenKind::Colon, "':'")?;
        self.expect(&TokenKind::Newline, "end of line after ':'")?;
        self.expect(&TokenKind::Indent, "an indented list of cases")?;

        let mut arms = Vec::new();
        let mut else_block = None;
        loop {
            match self.peek() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Else => {
                    if else_block.is_some() {
                        return Err(ParserError::syntax("Duplicate 'else' case in when", self.current_line()));
                    }
                    self.advance();
                    else_block = Some(self.parse_block()?);
                }
                _ => {
                    let arm_line = self.current_line();
                    if else_block.is_some() {
                        return Err(ParserError::syntax("'else' must be the last case in when", arm_line));
                    }
                    let mut patterns = vec![self.parse_expression()?];
                    while self.eat(&TokenKind::Comma) {
                        patterns.push(self.parse_expression()?);
                    }
                    let body = self.parse_block()?;
                    arms.push(WhenArm {
                        patterns,
                        body,
                        line: arm_line,
                    });
                }
            }
        }

        if arms.is_empty() && else_block.is_none() {
            return Err(ParserError::syntax("'when' needs at least one case", line));
        }
        Ok(Statement {
            kind: StatementKind::When { subject, arms, else_block },
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        self.advance();
        let first = self.expect_identifier("a loop variable")?;
        let second = if self.eat(&TokenKind::Comma) {
            Some(self.expect_identifier("a second loop variable")?)
        } else {
            None
        };
        self.expect(&TokenKind::In, "'in'")?;
        let iterable = self.parse_expression()?;

        let body_scope = self.scopes.child(self.scope);
        let outer = std::mem::replace(&mut self.scope, body_scope);
        let declared = self.declare(&first, SymbolKind::Mutable, line).and_then(|_| match &second {
            Some(name) => self.declare(name, SymbolKind::Mutable, line),
            None => Ok(()),
        });
        self.scope = outer;
        declared?;

        self.loop_depth += 1;
        let body = self.parse_block_in(body_scope);
        self.loop_depth -= 1;
        self.scopes.release(body_scope);

        Ok(Statement {
            kind: StatementKind::ForEach {
                first,
                second,
                iterable,
                body: body?,
            },
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        self.advance();
        let condition = self.parse_expression()?;
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        Ok(Statement {
            kind: StatementKind::While { condition, body: body? },
            line,
        })
    }

    fn parse_function(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        self.advance();
        let name = self.expect_identifier("a function name")?;
        self.expect(&TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_identifier("a parameter name")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;

        // Registered first so the body can refer to it.
        self.declare(&name, SymbolKind::Function, line)?;

        let outer = self.enter_scope();
        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        let result = (|| {
            for param in &params {
                self.declare(param, SymbolKind::Parameter, line)?;
            }
            let scope = self.scope;
            self.parse_block_in(scope)
        })();
        self.loop_depth = saved_loops;
        self.leave_scope(outer);

        Ok(Statement {
            kind: StatementKind::Function(Arc::new(FunctionDecl {
                name,
                params,
                body: result?,
                line,
            })),
            line,
        })
    }

    fn parse_step(&mut self) -> Result<Statement, ParserError> {
        let line = self.current_line();
        self.advance();
        let name = self.parse_expression()?;
        let body = self.parse_block()?;
        Ok(Statement {
            kind: StatementKind::Step { name, body },
            line,
        })
    }

    fn parse_import(&mut self) -> Result<StatementKind, ParserError> {
        let line = self.current_line();
        self.advance();

        if self.eat(&TokenKind::LBrace) {
            let mut members = Vec::new();
            while !self.check(&TokenKind::RBrace) {
                let name = self.expect_name("an imported member name")?;
                let alias = if self.at_contextual("as") {
                    self.advance();
                    Some(self.expect_identifier("an alias after 'as'")?)
                } else {
                    None
                };
                members.push(ImportMember { name, alias });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RBrace, "'}'")?;
            if members.is_empty() {
                return Err(ParserError::syntax("Import list is empty", line));
            }
            if !self.at_contextual("from") {
                return Err(self.unexpected("'from'"));
            }
            self.advance();
            let source = self.expect_identifier("a namespace to import from")?;
            let symbol = self.resolve(&source, line)?;
            let importable = match symbol.kind {
                SymbolKind::Imported => true,
                SymbolKind::Builtin => matches!(
                    symbol.value,
                    Some(Value::Namespace(Namespace::Service(_) | Namespace::Static(_)))
                ),
                _ => false,
            };
            if !importable {
                return Err(ParserError::syntax(format!("'{}' is not a namespace", source), line));
            }
            for member in &members {
                self.declare(member.binding(), SymbolKind::Imported, line)?;
            }
            return Ok(StatementKind::Import(Import::Members { members, source }));
        }

        let alias = self.expect_identifier("an import alias")?;
        if !self.at_contextual("from") {
            return Err(self.unexpected("'from'"));
        }
        self.advance();
        let path = match self.peek().clone() {
            TokenKind::String(path) => {
                self.advance();
                path
            }
            _ => return Err(self.unexpected("a quoted resource path")),
        };
        let options = if self.at_contextual("with") {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.declare(&alias, SymbolKind::Imported, line)?;
        Ok(StatementKind::Import(Import::Resource { alias, path, options }))
    }

    fn parse_action(&mut self) -> Result<Action, ParserError> {
        let keyword = self.advance();
        let action = match keyword.kind {
            TokenKind::Navigate => Action::Navigate {
                url: self.parse_expression()?,
            },
            TokenKind::Click => Action::Click {
                selector: self.parse_expression()?,
            },
            TokenKind::Hover => Action::Hover {
                selector: self.parse_expression()?,
            },
            TokenKind::Type => {
                let selector = self.parse_expression()?;
                self.expect(&TokenKind::Comma, "',' between selector and text")?;
                Action::Type {
                    selector,
                    text: self.parse_expression()?,
                }
            }
            TokenKind::Select => {
                let selector = self.parse_expression()?;
                self.expect(&TokenKind::Comma, "',' between selector and value")?;
                Action::Select {
                    selector,
                    value: self.parse_expression()?,
                }
            }
            TokenKind::Wait => {
                if self.eat(&TokenKind::For) {
                    let selector = self.parse_expression()?;
                    let timeout = if self.at_contextual("timeout") {
                        self.advance();
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    Action::WaitFor { selector, timeout }
                } else {
                    Action::Wait {
                        duration: self.parse_expression()?,
                    }
                }
            }
            TokenKind::Extract => {
                let selector = self.parse_expression()?;
                if !self.at_contextual("as") {
                    return Err(self.unexpected("'as'"));
                }
                self.advance();
                let name = self.expect_identifier("a variable name after 'as'")?;
                self.declare_extract_target(&name, keyword.line)?;
                Action::Extract { selector, name }
            }
            TokenKind::Screenshot => {
                let name = match self.peek() {
                    TokenKind::Newline | TokenKind::Dedent | TokenKind::Eof => None,
                    _ => Some(self.parse_expression()?),
                };
                Action::Screenshot { name }
            }
            TokenKind::Assert => {
                let condition = self.parse_expression()?;
                let message = if self.eat(&TokenKind::Comma) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                Action::Assert { condition, message }
            }
            TokenKind::Log => {
                let mut values = vec![self.parse_expression()?];
                while self.eat(&TokenKind::Comma) {
                    values.push(self.parse_expression()?);
                }
                Action::Log { values }
            }
            _ => return Err(ParserError::syntax("Expected an action", keyword.line)),
        };
        Ok(action)
    }

    /// `extract ... as name` reuses a mutable binding of the same scope and
    /// declares a new one otherwise.
    fn declare_extract_target(&mut self, name: &str, line: usize) -> Result<(), ParserError> {
        match self.scopes.lookup_local(self.scope, name).map(|s| s.kind) {
            Some(SymbolKind::Mutable) => Ok(()),
            Some(_) => self.check_assignable(name, line),
            None => self.declare(name, SymbolKind::Mutable, line),
        }
    }

    // ---- expressions ----

    pub fn parse_expression(&mut self) -> Result<Expression, ParserError> {
        self.parse_or()
    }

    fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
        let (line, column) = (left.line, left.column);
        Expression::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            line,
            column,
        )
    }

    fn parse_or(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), TokenKind::Or | TokenKind::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), TokenKind::And | TokenKind::AndAnd) {
            self.advance();
            let right = self.parse_not()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression, ParserError> {
        if matches!(self.peek(), TokenKind::Not | TokenKind::Bang) {
            let (line, column) = (self.current_line(), self.current_column());
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expression::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
                column,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEq => BinaryOp::LessEq,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEq => BinaryOp::GreaterEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParserError> {
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.parse_postfix(),
        };
        let (line, column) = (self.current_line(), self.current_column());
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expression::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
            column,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expression, ParserError> {
        let mut expr = self.parse_primary()?;
        loop {
            let (line, column) = (expr.line, expr.column);
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_name("a member name after '.'")?;
                    if self.check(&TokenKind::LParen) {
                        let args = self.parse_arguments()?;
                        expr = Expression::new(
                            ExprKind::MethodCall {
                                object: Box::new(expr),
                                method: name,
                                args,
                            },
                            line,
                            column,
                        );
                    } else {
                        expr = Expression::new(
                            ExprKind::Member {
                                object: Box::new(expr),
                                name,
                            },
                            line,
                            column,
                        );
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expression::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                        column,
                    );
                }
                TokenKind::LParen => {
                    let args = self.parse_arguments()?;
                    expr = Expression::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        line,
                        column,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_arguments(&mut self) -> Result<Vec<Argument>, ParserError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        let mut seen_named = false;
        while !self.check(&TokenKind::RParen) {
            let named = match (self.peek(), self.peek_at(1)) {
                (TokenKind::Identifier(name), TokenKind::Colon) => Some(name.clone()),
                _ => None,
            };
            match named {
                Some(name) => {
                    self.advance();
                    self.advance();
                    if args.iter().any(|a: &Argument| a.name.as_deref() == Some(name.as_str())) {
                        return Err(ParserError::syntax(
                            format!("Argument '{}' given more than once", name),
                            self.current_line(),
                        ));
                    }
                    seen_named = true;
                    args.push(Argument {
                        name: Some(name),
                        value: self.parse_expression()?,
                    });
                }
                None => {
                    if seen_named {
                        return Err(ParserError::syntax(
                            "Positional argument after named argument",
                            self.current_line(),
                        ));
                    }
                    args.push(Argument {
                        name: None,
                        value: self.parse_expression()?,
                    });
                }
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expression, ParserError> {
        let (line, column) = (self.current_line(), self.current_column());
        let literal = |kind: Literal| -> Result<Expression, ParserError> {
            Ok(Expression::new(ExprKind::Literal(kind), line, column))
        };

        match self.peek().clone() {
            TokenKind::Integer(n) => {
                self.advance();
                literal(Literal::Integer(n))
            }
            TokenKind::Float(n) => {
                self.advance();
                literal(Literal::Float(n))
            }
            TokenKind::String(s) => {
                self.advance();
                literal(Literal::String(s))
            }
            TokenKind::True => {
                self.advance();
                literal(Literal::Boolean(true))
            }
            TokenKind::False => {
                self.advance();
                literal(Literal::Boolean(false))
            }
            TokenKind::Null => {
                self.advance();
                literal(Literal::Null)
            }
            TokenKind::Interpolated(parts) => {
                self.advance();
                self.parse_interpolation(parts, line, column)
            }
            TokenKind::Identifier(name) => {
                if self.peek_at(1) == &TokenKind::Arrow {
                    self.advance();
                    self.advance();
                    return self.parse_lambda_body(vec![name], line, column);
                }
                self.advance();
                self.resolve(&name, line)?;
                match SystemVariable::from_name(&name) {
                    Some(var) => Ok(Expression::new(ExprKind::System(var), line, column)),
                    None => Ok(Expression::new(ExprKind::Identifier(name), line, column)),
                }
            }
            TokenKind::LParen => {
                if self.lambda_ahead() {
                    return self.parse_lambda(line, column);
                }
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_expression()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(Expression::new(ExprKind::Array(items), line, column))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries: Vec<(String, Expression)> = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = match self.peek().clone() {
                        TokenKind::String(key) => {
                            self.advance();
                            key
                        }
                        _ => self.expect_name("an object key")?,
                    };
                    self.expect(&TokenKind::Colon, "':' after object key")?;
                    let value = self.parse_expression()?;
                    entries.retain(|(k, _)| k != &key);
                    entries.push((key, value));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(Expression::new(ExprKind::Object(entries), line, column))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    /// True when the `(` under the cursor opens a lambda parameter list.
    fn lambda_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos;
        while let Some(token) = self.tokens.get(i) {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(self.tokens.get(i + 1).map(|t| &t.kind), Some(TokenKind::Arrow));
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    fn parse_lambda(&mut self, line: usize, column: usize) -> Result<Expression, ParserError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            params.push(self.expect_identifier("a lambda parameter")?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        self.expect(&TokenKind::Arrow, "'=>'")?;
        self.parse_lambda_body(params, line, column)
    }

    fn parse_lambda_body(&mut self, params: Vec<String>, line: usize, column: usize) -> Result<Expression, ParserError> {
        let outer = self.enter_scope();
        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        let result = (|| {
            for param in &params {
                self.declare(param, SymbolKind::Parameter, line)?;
            }
            self.parse_expression()
        })();
        self.loop_depth = saved_loops;
        self.leave_scope(outer);

        let body = result?;
        Ok(Expression::new(
            ExprKind::Lambda(Arc::new(LambdaDecl {
                params,
                body,
                line,
                column,
            })),
            line,
            column,
        ))
    }

    fn parse_interpolation(&mut self, parts: Vec<StringPart>, line: usize, column: usize) -> Result<Expression, ParserError> {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                StringPart::Literal(text) => out.push(InterpolationPart::Text(text)),
                StringPart::Expr { source, line, column } => {
                    let tokens = tokenize_fragment(&source, line, column)
                        .map_err(|e| ParserError::syntax(e.message, e.line))?;
                    let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
                    let saved_pos = std::mem::replace(&mut self.pos, 0);
                    let result = self.parse_fragment(line);
                    self.tokens = saved_tokens;
                    self.pos = saved_pos;
                    out.push(InterpolationPart::Expr(result?));
                }
            }
        }
        Ok(Expression::new(ExprKind::Interpolated(out), line, column))
    }

    fn parse_fragment(&mut self, line: usize) -> Result<Expression, ParserError> {
        if self.check(&TokenKind::Eof) {
            return Err(ParserError::syntax("Empty interpolation '{}' in string", line));
        }
        let expr = self.parse_expression()?;
        if !self.check(&TokenKind::Eof) {
            return Err(self.unexpected("'}' to close interpolation"));
        }
        Ok(expr)
    }
}

/// Turns the left side of an assignment into a place.
fn assign_target(expr: Expression) -> Result<AssignTarget, ParserError> {
    let line = expr.line;
    let mut path = Vec::new();
    let mut current = expr;
    loop {
        match current.kind {
            ExprKind::Identifier(root) => {
                path.reverse();
                return Ok(AssignTarget { root, path });
            }
            ExprKind::System(var) => {
                path.reverse();
                return Ok(AssignTarget {
                    root: var.name().to_string(),
                    path,
                });
            }
            ExprKind::Member { object, name } => {
                path.push(Accessor::Member(name));
                current = *object;
            }
            ExprKind::Index { object, index } => {
                path.push(Accessor::Index(*index));
                current = *object;
            }
            _ => return Err(ParserError::syntax("Invalid assignment target", line)),
        }
    }
}
