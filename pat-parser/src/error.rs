use pat_diagnostics::{Diagnostic, Location, Stage};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("P0001: unexpected token at {location}, expected {expected}")]
    UnexpectedToken { expected: String, location: Location },
    #[error("P0002: unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String, location: Location },
    #[error("P0003: unknown type `{name}` at {location}")]
    UnknownType { name: String, location: Location },
    #[error("P0004: invalid scope resolution `{path}` at {location}")]
    InvalidScopeResolution { path: String, location: Location },
    #[error("P0005: invalid cast to `{target}` at {location}")]
    InvalidCast { target: String, location: Location },
    #[error("P0006: invalid function declaration at {location}: {reason}")]
    InvalidFunctionDeclaration { reason: String, location: Location },
    #[error("P0007: invalid pointer declaration at {location}: {reason}")]
    InvalidPointerDeclaration { reason: String, location: Location },
    #[error("P0008: type `{name}` redefined at {location}, first declared at {first}")]
    TypeRedefinition { name: String, location: Location, first: Location },
    #[error("P0009: invalid template argument at {location}: {reason}")]
    InvalidTemplateArgument { reason: String, location: Location },
    #[error("P0010: invalid attribute `{name}` at {location}")]
    InvalidAttribute { name: String, location: Location },
    #[error("P0011: invalid array declaration at {location}: {reason}")]
    InvalidArrayDeclaration { reason: String, location: Location },
}

impl Error {
    pub fn location(&self) -> Location {
        match self {
            Error::UnexpectedToken { location, .. }
            | Error::UnexpectedEof { location, .. }
            | Error::UnknownType { location, .. }
            | Error::InvalidScopeResolution { location, .. }
            | Error::InvalidCast { location, .. }
            | Error::InvalidFunctionDeclaration { location, .. }
            | Error::InvalidPointerDeclaration { location, .. }
            | Error::TypeRedefinition { location, .. }
            | Error::InvalidTemplateArgument { location, .. }
            | Error::InvalidAttribute { location, .. }
            | Error::InvalidArrayDeclaration { location, .. } => *location,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::UnexpectedToken { .. } => 1,
            Error::UnexpectedEof { .. } => 2,
            Error::UnknownType { .. } => 3,
            Error::InvalidScopeResolution { .. } => 4,
            Error::InvalidCast { .. } => 5,
            Error::InvalidFunctionDeclaration { .. } => 6,
            Error::InvalidPointerDeclaration { .. } => 7,
            Error::TypeRedefinition { .. } => 8,
            Error::InvalidTemplateArgument { .. } => 9,
            Error::InvalidAttribute { .. } => 10,
            Error::InvalidArrayDeclaration { .. } => 11,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let location = self.location();
        let code = self.code();
        Diagnostic::new(Stage::Parser, code, title(code), self.to_string(), location)
    }
}

fn title(code: u16) -> &'static str {
    match code {
        1 => "unexpected token",
        2 => "unexpected end of input",
        3 => "unknown type",
        4 => "invalid scope resolution",
        5 => "invalid cast",
        6 => "invalid function declaration",
        7 => "invalid pointer declaration",
        8 => "type redefinition",
        9 => "invalid template argument",
        10 => "invalid attribute",
        11 => "invalid array declaration",
        _ => "parser error",
    }
}

/// Marks an unrecoverable parse failure: the caller should stop consuming
/// tokens and return the errors accumulated so far.
#[derive(Debug, Clone, Copy)]
pub struct Unrecoverable;
