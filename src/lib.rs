//! embedlisp - an embeddable Lisp with a bytecode compiler and stack VM
//!
//! This crate implements a small Lisp system designed for embedding: a
//! compiler that translates s-expressions into a linear bytecode, and a
//! stack-based virtual machine that executes that bytecode. The two halves
//! share an instruction set, a value model, and an environment
//! representation, and are composed by a [`context::Context`].
//!
//! ```text
//! source text --reader--> Value tree --compiler--> Closure --vm--> Value
//! ```
//!
//! Macros are expanded at compile time by recursively invoking the VM on
//! the macro's compiled body, so `defmacro` forms take effect for every
//! compilation that follows within the same context.
//!
//! ## Modules
//!
//! - `value`: tagged runtime values and cons/list utilities
//! - `symbol`: interned symbols and packages (globals + macro tables)
//! - `env`: chains of activation frames for lexical variables
//! - `vm`: instruction set, code registry, and the dispatch loop
//! - `compiler`: s-expression to bytecode translation and label assembly
//! - `macros`: compile-time macro records and expansion
//! - `builtins`: primitive function registry with arity checking
//! - `reader`: s-expression parsing from text
//! - `context`: process-wide composition of all of the above

use std::fmt;

/// Maximum parsing depth to prevent stack overflow on hostile input
pub const MAX_PARSE_DEPTH: usize = 64;

/// Maximum number of macro expansions performed for a single compilation.
/// A macro that expands into another application of itself would otherwise
/// keep the compiler busy forever.
pub const MAX_MACRO_EXPANSIONS: usize = 100;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
}

/// A structured error describing a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred
    pub context: Option<String>,
}

impl ParseError {
    /// Create a simple ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a ParseError with context extracted from the unconsumed input
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        remaining: &str,
    ) -> Self {
        const MAX_CONTEXT: usize = 40;
        let snippet: String = remaining.chars().take(MAX_CONTEXT).collect();
        let mut context = snippet.replace('\n', "\\n");
        if remaining.chars().count() > MAX_CONTEXT {
            context.push_str("[...]");
        }
        ParseError {
            kind,
            message: message.into(),
            context: Some(context),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\nNear: {context}")?;
        }
        Ok(())
    }
}

/// Top-level error type for the interpreter.
///
/// The core distinguishes two categories: compiler errors, raised
/// synchronously from a compile call, and runtime errors, raised while the
/// VM executes. Parse errors are a third category contributed by the
/// reader. None of them are retried inside the core; the embedder decides
/// presentation and continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Parse(ParseError),
    Compile(compiler::CompileError),
    Runtime(vm::RuntimeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Parse(e) => write!(f, "ParseError: {e}"),
            Error::Compile(e) => write!(f, "{e}"),
            Error::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

impl From<compiler::CompileError> for Error {
    fn from(e: compiler::CompileError) -> Self {
        Error::Compile(e)
    }
}

impl From<vm::RuntimeError> for Error {
    fn from(e: vm::RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

pub mod builtins;
pub mod compiler;
pub mod context;
pub mod env;
pub mod macros;
pub mod reader;
pub mod symbol;
pub mod value;
pub mod vm;

pub use context::Context;
pub use value::Value;
