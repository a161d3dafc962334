use pat_diagnostics::{Diagnostic, Location, Stage};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("M0001: unknown directive `#{name}` at {location}")]
    UnknownDirective { name: String, location: Location },
    #[error("M0002: could not resolve include `{path}` at {location}: {reason}")]
    IncludeNotFound { path: String, location: Location, reason: String },
    #[error("M0003: pragma `{key}` rejected value `{value}` at {location}")]
    PragmaFailed { key: String, value: String, location: Location },
    #[error("M0004: {message}")]
    UserError { message: String, location: Location },
}

impl Error {
    pub fn location(&self) -> Location {
        match self {
            Error::UnknownDirective { location, .. }
            | Error::IncludeNotFound { location, .. }
            | Error::PragmaFailed { location, .. }
            | Error::UserError { location, .. } => *location,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::UnknownDirective { .. } => 1,
            Error::IncludeNotFound { .. } => 2,
            Error::PragmaFailed { .. } => 3,
            Error::UserError { .. } => 4,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let location = self.location();
        let code = self.code();
        Diagnostic::new(Stage::Preprocessor, code, title(code), self.to_string(), location)
    }
}

fn title(code: u16) -> &'static str {
    match code {
        1 => "unknown directive",
        2 => "include not found",
        3 => "pragma rejected",
        4 => "user error",
        _ => "preprocessor error",
    }
}

pub fn lexer_diagnostic(err: pat_lexer::Error) -> Diagnostic {
    Diagnostic::new(Stage::Lexer, err.code(), lexer_title(&err), err.to_string(), err.location())
}

fn lexer_title(err: &pat_lexer::Error) -> &'static str {
    match err {
        pat_lexer::Error::InvalidCharacterLiteral { .. } => "invalid character literal",
        pat_lexer::Error::InvalidStringLiteral { .. } => "invalid string literal",
        pat_lexer::Error::InvalidIntegerLiteral { .. } => "invalid integer literal",
        pat_lexer::Error::UnknownSequence { .. } => "unknown token sequence",
    }
}
