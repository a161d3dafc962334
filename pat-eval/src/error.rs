//! The evaluator's error taxonomy: internal bug, math, variable, type,
//! placement, index, limit, attribute, function, control flow, memory,
//! builtin, in that order — `code()` below follows the same ordering so
//! the class list and the numbering stay in sync.

use pat_diagnostics::{Diagnostic, Location, Stage};
use pat_sections::IoError;
use pat_tree::CoercionError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("internal evaluator error: {message}")]
    Internal { message: String, location: Location },

    #[error("{message}")]
    Math { message: String, location: Location },

    #[error("undefined {what} `{name}`")]
    Undefined { what: &'static str, name: String, location: Location },

    #[error("{0}")]
    Type(#[source] CoercionError, Location),

    #[error("invalid placement: {message}")]
    Placement { message: String, location: Location },

    #[error("index {index} out of range (length {length})")]
    IndexOutOfRange { index: i128, length: u64, location: Location },

    #[error("{kind} limit of {limit} exceeded")]
    LimitExceeded { kind: &'static str, limit: u32, location: Location },

    #[error("invalid use of attribute `{name}`: {message}")]
    InvalidAttribute { name: String, message: String, location: Location },

    #[error("{message}")]
    FunctionCall { message: String, location: Location },

    #[error("{message}")]
    ControlFlow { message: String, location: Location },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("builtin function `{name}` failed: {message}")]
    Builtin { name: String, message: String, location: Location },
}

/// Wraps a [`pat_sections::IoError`] with the location of the access that
/// triggered it, so it still carries enough context for a diagnostic.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{source}")]
pub struct MemoryError {
    #[source]
    pub source: IoError,
    pub location: Location,
}

impl Error {
    pub fn memory(source: IoError, location: Location) -> Self {
        Error::Memory(MemoryError { source, location })
    }

    pub fn location(&self) -> Location {
        match self {
            Error::Internal { location, .. }
            | Error::Math { location, .. }
            | Error::Undefined { location, .. }
            | Error::Type(_, location)
            | Error::Placement { location, .. }
            | Error::IndexOutOfRange { location, .. }
            | Error::LimitExceeded { location, .. }
            | Error::InvalidAttribute { location, .. }
            | Error::FunctionCall { location, .. }
            | Error::ControlFlow { location, .. }
            | Error::Builtin { location, .. } => *location,
            Error::Memory(m) => m.location,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::Internal { .. } => 1,
            Error::Math { .. } => 2,
            Error::Undefined { .. } => 3,
            Error::Type(..) => 4,
            Error::Placement { .. } => 5,
            Error::IndexOutOfRange { .. } => 6,
            Error::LimitExceeded { .. } => 7,
            Error::InvalidAttribute { .. } => 8,
            Error::FunctionCall { .. } => 9,
            Error::ControlFlow { .. } => 10,
            Error::Memory(_) => 11,
            Error::Builtin { .. } => 12,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let location = self.location();
        let code = self.code();
        let title = title(code).to_string();
        Diagnostic::new(Stage::Evaluator, code, title, self.to_string(), location)
    }
}

fn title(code: u16) -> &'static str {
    match code {
        1 => "internal evaluator error",
        2 => "arithmetic error",
        3 => "undefined reference",
        4 => "type error",
        5 => "invalid placement",
        6 => "index out of range",
        7 => "limit exceeded",
        8 => "invalid attribute",
        9 => "function call error",
        10 => "control flow error",
        11 => "memory access error",
        12 => "builtin function error",
        _ => "evaluator error",
    }
}
