//! Indentation-aware tokenizer.
//!
//! Turns script source into a flat [`Token`] stream. Block structure is
//! carried by three structural tokens: [`TokenKind::Newline`] ends a logical
//! line, [`TokenKind::Indent`] and [`TokenKind::Dedent`] open and close a
//! block. They are produced from a stack of indentation widths:
//!
//! - a line indented deeper than the top of the stack pushes its width and
//!   emits one `Indent`;
//! - a shallower line pops until the top matches, emitting one `Dedent` per
//!   pop, and fails if no outer level matches;
//! - at end of input every open level is closed, so a well-formed script
//!   always has as many `Dedent`s as `Indent`s.
//!
//! Blank lines, `#` comments and `"""` block comments never touch the stack,
//! and neither does anything inside `()`, `[]` or `{}`.
//!
//! Double-quoted strings containing `{expr}` segments become a single
//! [`TokenKind::Interpolated`] token. The segment text is kept verbatim (with
//! its position) so the parser can tokenize and parse it as an expression.

use std::collections::BTreeMap;

use crate::error::{LexicalError, LexicalErrorKind};

/// A piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Literal(String),
    /// Source of an embedded `{...}` expression and where it starts.
    Expr { source: String, line: usize, column: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Integer(i64),
    Float(f64),
    String(String),
    Interpolated(Vec<StringPart>),
    True,
    False,
    Null,

    // Keywords
    Let,
    Const,
    If,
    Else,
    When,
    For,
    In,
    While,
    Break,
    Continue,
    Function,
    Return,
    Import,
    Step,
    And,
    Or,
    Not,

    // Automation keywords
    Navigate,
    Click,
    Type,
    Select,
    Hover,
    Wait,
    Extract,
    Screenshot,
    Assert,
    Log,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Arrow,
    Bang,
    AndAnd,
    OrOr,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,

    // Structure
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl TokenKind {
    fn keyword(ident: &str) -> Option<TokenKind> {
        let kind = match ident {
            "let" => TokenKind::Let,
            "const" => TokenKind::Const,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "when" => TokenKind::When,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "while" => TokenKind::While,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "function" => TokenKind::Function,
            "return" => TokenKind::Return,
            "import" => TokenKind::Import,
            "step" => TokenKind::Step,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "navigate" => TokenKind::Navigate,
            "click" => TokenKind::Click,
            "type" => TokenKind::Type,
            "select" => TokenKind::Select,
            "hover" => TokenKind::Hover,
            "wait" => TokenKind::Wait,
            "extract" => TokenKind::Extract,
            "screenshot" => TokenKind::Screenshot,
            "assert" => TokenKind::Assert,
            "log" => TokenKind::Log,
            _ => return None,
        };
        Some(kind)
    }

    /// Human-readable name used in parser diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::Integer(n) => format!("number {}", n),
            TokenKind::Float(n) => format!("number {}", n),
            TokenKind::String(_) | TokenKind::Interpolated(_) => "string".to_string(),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::Let => "let",
            TokenKind::Const => "const",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::When => "when",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::While => "while",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::Function => "function",
            TokenKind::Return => "return",
            TokenKind::Import => "import",
            TokenKind::Step => "step",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::Navigate => "navigate",
            TokenKind::Click => "click",
            TokenKind::Type => "type",
            TokenKind::Select => "select",
            TokenKind::Hover => "hover",
            TokenKind::Wait => "wait",
            TokenKind::Extract => "extract",
            TokenKind::Screenshot => "screenshot",
            TokenKind::Assert => "assert",
            TokenKind::Log => "log",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Assign => "=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Less => "<",
            TokenKind::LessEq => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEq => ">=",
            TokenKind::Arrow => "=>",
            TokenKind::Bang => "!",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Dot => ".",
            _ => "?",
        }
    }

    /// Keywords are still valid as member names and object keys.
    pub fn keyword_text(&self) -> Option<&'static str> {
        match self {
            TokenKind::Identifier(_)
            | TokenKind::Integer(_)
            | TokenKind::Float(_)
            | TokenKind::String(_)
            | TokenKind::Interpolated(_) => None,
            other => {
                let s = other.symbol();
                s.chars().next().filter(|c| c.is_ascii_alphabetic()).map(|_| s)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
    pub column: usize,
}

/// Tokenizes a whole script.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexicalError> {
    Lexer::new(source, 1, 1, false).run()
}

/// Tokenizes an expression fragment (an interpolation segment) whose first
/// character sits at `line`/`column` of the enclosing script. No structural
/// tokens are produced.
pub fn tokenize_fragment(source: &str, line: usize, column: usize) -> Result<Vec<Token>, LexicalError> {
    Lexer::new(source, line, column, true).run()
}

/// Reads the `key: value` lines of a leading `"""` metadata block.
///
/// Returns an empty map when the script does not start with one.
pub fn script_metadata(source: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let trimmed = source.trim_start();
    let Some(rest) = trimmed.strip_prefix("\"\"\"") else {
        return metadata;
    };
    let Some(end) = rest.find("\"\"\"") else {
        return metadata;
    };
    for line in rest[..end].lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() && !key.contains(' ') {
                metadata.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    metadata
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    nesting: usize,
    fragment: bool,
}

impl Lexer {
    fn new(source: &str, line: usize, column: usize, fragment: bool) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line,
            column,
            tokens: Vec::new(),
            indents: vec![0],
            nesting: 0,
            fragment,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, lexeme: impl Into<String>, line: usize, column: usize) {
        self.tokens.push(Token {
            kind,
            lexeme: lexeme.into(),
            line,
            column,
        });
    }

    fn run(mut self) -> Result<Vec<Token>, LexicalError> {
        let mut at_line_start = !self.fragment;

        loop {
            if at_line_start {
                at_line_start = false;
                self.begin_line()?;
            }
            let Some(ch) = self.peek() else { break };
            let (line, column) = (self.line, self.column);

            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    if self.nesting == 0 && !self.fragment {
                        self.push(TokenKind::Newline, "", line, column);
                        at_line_start = true;
                    }
                }
                '#' => self.skip_line_comment(),
                '"' if self.starts_block_comment() => self.skip_block_comment()?,
                '"' => self.lex_string(true)?,
                '\'' => self.lex_string(false)?,
                c if c.is_ascii_digit() => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_identifier(),
                _ => self.lex_operator()?,
            }
        }

        self.finish()
    }

    /// Skips blank and comment-only lines, then applies the indentation of
    /// the next line that has content.
    fn begin_line(&mut self) -> Result<(), LexicalError> {
        loop {
            let mut width = 0;
            let mut tab_column = None;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => width += 1,
                    '\t' => {
                        tab_column.get_or_insert(self.column);
                    }
                    _ => break,
                }
                self.advance();
            }

            match self.peek() {
                None => return Ok(()),
                Some('\n') | Some('\r') => {
                    self.advance();
                }
                Some('#') => self.skip_line_comment(),
                Some('"') if self.starts_block_comment() => {
                    let (line, column) = (self.line, self.column);
                    self.skip_block_comment()?;
                    if !self.rest_of_line_blank() {
                        return self.apply_indent(width, tab_column, line, column);
                    }
                }
                Some(_) => {
                    let (line, column) = (self.line, self.column);
                    return self.apply_indent(width, tab_column, line, column);
                }
            }
        }
    }

    fn apply_indent(
        &mut self,
        width: usize,
        tab_column: Option<usize>,
        line: usize,
        column: usize,
    ) -> Result<(), LexicalError> {
        if let Some(tab_column) = tab_column {
            return Err(LexicalError::new(
                LexicalErrorKind::TabIndentation,
                "Tab character in indentation, use spaces",
                line,
                tab_column,
            ));
        }

        let top = self.indents.last().copied().unwrap_or(0);
        if width > top {
            self.indents.push(width);
            self.push(TokenKind::Indent, "", line, 1);
        } else if width < top {
            while self.indents.last().is_some_and(|&level| level > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, "", line, 1);
            }
            if self.indents.last().copied().unwrap_or(0) != width {
                return Err(LexicalError::new(
                    LexicalErrorKind::InconsistentIndentation,
                    format!("Unindent to width {} does not match any outer indentation level", width),
                    line,
                    column,
                ));
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Token>, LexicalError> {
        let (line, column) = (self.line, self.column);
        if !self.fragment {
            let needs_newline = self
                .tokens
                .last()
                .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent));
            if needs_newline {
                self.push(TokenKind::Newline, "", line, column);
            }
            while self.indents.len() > 1 {
                self.indents.pop();
                self.push(TokenKind::Dedent, "", line, 1);
            }
        }
        self.push(TokenKind::Eof, "", line, column);
        Ok(self.tokens)
    }

    fn rest_of_line_blank(&self) -> bool {
        let mut i = self.pos;
        while let Some(&c) = self.chars.get(i) {
            match c {
                ' ' | '\t' | '\r' => i += 1,
                '\n' | '#' => return true,
                _ => return false,
            }
        }
        true
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn starts_block_comment(&self) -> bool {
        self.peek() == Some('"') && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"')
    }

    fn skip_block_comment(&mut self) -> Result<(), LexicalError> {
        let (line, column) = (self.line, self.column);
        for _ in 0..3 {
            self.advance();
        }
        while self.peek().is_some() {
            if self.starts_block_comment() {
                for _ in 0..3 {
                    self.advance();
                }
                return Ok(());
            }
            self.advance();
        }
        Err(LexicalError::new(
            LexicalErrorKind::UnterminatedComment,
            "Unterminated block comment",
            line,
            column,
        ))
    }

    fn lex_string(&mut self, interpolate: bool) -> Result<(), LexicalError> {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        let quote = self.advance().unwrap_or('"');
        let unterminated = || {
            LexicalError::new(LexicalErrorKind::UnterminatedString, "Unterminated string", line, column)
        };

        let mut parts = Vec::new();
        let mut buf = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(unterminated()),
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => buf.push('\n'),
                        Some('t') => buf.push('\t'),
                        Some('r') => buf.push('\r'),
                        Some('0') => buf.push('\0'),
                        Some(c @ ('\\' | '"' | '\'' | '{' | '}')) => buf.push(c),
                        Some('\n') | None => return Err(unterminated()),
                        Some(c) => {
                            buf.push('\\');
                            buf.push(c);
                        }
                    }
                }
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('{') if interpolate => {
                    self.advance();
                    let (expr_line, expr_column) = (self.line, self.column);
                    let source = self.interpolation_source(line, column)?;
                    tokenize_fragment(&source, expr_line, expr_column)?;
                    if !buf.is_empty() {
                        parts.push(StringPart::Literal(std::mem::take(&mut buf)));
                    }
                    parts.push(StringPart::Expr {
                        source,
                        line: expr_line,
                        column: expr_column,
                    });
                }
                Some(_) => {
                    if let Some(c) = self.advance() {
                        buf.push(c);
                    }
                }
            }
        }

        let lexeme: String = self.chars[start..self.pos].iter().collect();
        if parts.is_empty() {
            self.push(TokenKind::String(buf), lexeme, line, column);
        } else {
            if !buf.is_empty() {
                parts.push(StringPart::Literal(buf));
            }
            self.push(TokenKind::Interpolated(parts), lexeme, line, column);
        }
        Ok(())
    }

    /// Collects the text of a `{...}` segment up to its matching brace.
    /// Quoted strings inside the segment are copied through untouched.
    fn interpolation_source(&mut self, line: usize, column: usize) -> Result<String, LexicalError> {
        let unterminated = || {
            LexicalError::new(
                LexicalErrorKind::UnterminatedString,
                "Unterminated interpolation in string",
                line,
                column,
            )
        };
        let mut depth = 0usize;
        let mut out = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(unterminated()),
                Some('}') if depth == 0 => {
                    self.advance();
                    return Ok(out);
                }
                Some(q @ ('"' | '\'')) => {
                    out.push(q);
                    self.advance();
                    loop {
                        match self.advance() {
                            None | Some('\n') => return Err(unterminated()),
                            Some('\\') => {
                                out.push('\\');
                                match self.advance() {
                                    Some(c) if c != '\n' => out.push(c),
                                    _ => return Err(unterminated()),
                                }
                            }
                            Some(c) => {
                                out.push(c);
                                if c == q {
                                    break;
                                }
                            }
                        }
                    }
                }
                Some(c) => {
                    if c == '{' {
                        depth += 1;
                    } else if c == '}' {
                        depth -= 1;
                    }
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<(), LexicalError> {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit() || *c == '_') {
            if c != '_' {
                text.push(c);
            }
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.advance();
            while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
                text.push(c);
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let digit_at = if matches!(self.peek_at(1), Some('+') | Some('-')) { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..digit_at {
                    if let Some(c) = self.advance() {
                        text.push(c);
                    }
                }
                while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
                    text.push(c);
                    self.advance();
                }
            }
        }

        if self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            return Err(LexicalError::new(
                LexicalErrorKind::MalformedNumber,
                format!("Invalid number literal: {}{}", text, self.peek().unwrap_or_default()),
                line,
                column,
            ));
        }

        let kind = if is_float {
            text.parse::<f64>().map(TokenKind::Float).map_err(|_| {
                LexicalError::new(LexicalErrorKind::MalformedNumber, format!("Invalid number: {}", text), line, column)
            })?
        } else {
            text.parse::<i64>().map(TokenKind::Integer).map_err(|_| {
                LexicalError::new(
                    LexicalErrorKind::MalformedNumber,
                    format!("Integer literal out of range: {}", text),
                    line,
                    column,
                )
            })?
        };
        self.push(kind, text, line, column);
        Ok(())
    }

    fn lex_identifier(&mut self) {
        let (line, column) = (self.line, self.column);
        let mut ident = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_alphanumeric() || *c == '_') {
            ident.push(c);
            self.advance();
        }
        let kind = TokenKind::keyword(&ident).unwrap_or_else(|| TokenKind::Identifier(ident.clone()));
        self.push(kind, ident, line, column);
    }

    fn lex_operator(&mut self) -> Result<(), LexicalError> {
        let (line, column) = (self.line, self.column);
        let Some(ch) = self.advance() else { return Ok(()) };
        let next = self.peek();

        let (kind, width) = match (ch, next) {
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('=', Some('>')) => (TokenKind::Arrow, 2),
            ('=', _) => (TokenKind::Assign, 1),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('!', _) => (TokenKind::Bang, 1),
            ('<', Some('=')) => (TokenKind::LessEq, 2),
            ('<', _) => (TokenKind::Less, 1),
            ('>', Some('=')) => (TokenKind::GreaterEq, 2),
            ('>', _) => (TokenKind::Greater, 1),
            ('+', Some('=')) => (TokenKind::PlusAssign, 2),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', Some('=')) => (TokenKind::MinusAssign, 2),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', Some('=')) => (TokenKind::StarAssign, 2),
            ('*', _) => (TokenKind::Star, 1),
            ('/', Some('=')) => (TokenKind::SlashAssign, 2),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('&', Some('&')) => (TokenKind::AndAnd, 2),
            ('|', Some('|')) => (TokenKind::OrOr, 2),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('.', _) => (TokenKind::Dot, 1),
            _ => {
                return Err(LexicalError::new(
                    LexicalErrorKind::IllegalCharacter,
                    format!("Unexpected character: '{}'", ch),
                    line,
                    column,
                ))
            }
        };
        if width == 2 {
            self.advance();
        }

        match kind {
            TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => self.nesting += 1,
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                self.nesting = self.nesting.saturating_sub(1)
            }
            _ => {}
        }

        let lexeme = kind.symbol();
        self.push(kind, lexeme, line, column);
        Ok(())
    }
}
