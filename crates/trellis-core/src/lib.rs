//! # trellis-core
//!
//! Language engine for Trellis, an indentation-sensitive scripting language
//! for browser automation and API testing.
//!
//! A script goes through three stages: the [`lexer`] turns source into
//! tokens, the [`parser`] builds a syntax tree while enforcing the static
//! scoping rules, and the [`interpreter`] runs the tree against an
//! [`driver::AutomationDriver`] and a set of service providers.
//!
//! ## Modules
//!
//! - [`lexer`] - Tokenizer with `INDENT`/`DEDENT` synthesis
//! - [`parser`] - Recursive-descent parser and static rule checks
//! - [`ast`] - Syntax tree types
//! - [`scope`] - Scope arena shared by the parser and the interpreter
//! - [`value`] - Runtime values
//! - [`interpreter`] - Statement execution, calls and imports
//! - [`builtins`] - Global functions and the `math`, `date` and `json` namespaces
//! - [`provider`] - Service provider trait and registry
//! - [`random_data`] - The `random` namespace
//! - [`http`] - The `http` namespace and the transport trait
//! - [`openapi`] - Providers built from OpenAPI documents
//! - [`action`] - Action types and logging for automation operations
//! - [`executor`] - Action execution engine with result handling
//! - [`driver`] - Automation backend trait
//! - [`recording_driver`] - Dry-run backend
//! - [`session`] - Action log for a run
//! - [`config`] - Persistent configuration
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_core::interpreter::Interpreter;
//! use trellis_core::recording_driver::RecordingDriver;
//!
//! # async fn demo() -> Result<(), trellis_core::error::TrellisError> {
//! let source = "navigate \"https://example.com\"\nassert page.url == \"https://example.com\"";
//! let mut interpreter = Interpreter::new(Arc::new(RecordingDriver::new()));
//! let report = interpreter.run_source(source).await?;
//! println!("{} actions", report.actions.len());
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod ast;
pub mod builtins;
pub mod config;
pub mod driver;
pub mod error;
mod evaluator;
pub mod executor;
pub mod http;
pub mod interpreter;
pub mod lexer;
pub mod openapi;
pub mod parser;
pub mod provider;
pub mod random_data;
pub mod recording_driver;
pub mod scope;
pub mod session;
pub mod value;

pub use error::TrellisError;
pub use interpreter::{ExecutionReport, Interpreter};
pub use value::Value;
