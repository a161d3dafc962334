use pat_diagnostics::Location;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("L0001: invalid character literal at {location}")]
    InvalidCharacterLiteral { location: Location },
    #[error("L0002: invalid string literal at {location}")]
    InvalidStringLiteral { location: Location },
    #[error("L0003: invalid integer literal `{text}` at {location}")]
    InvalidIntegerLiteral { text: String, location: Location },
    #[error("L0004: unknown token sequence `{text}` at {location}")]
    UnknownSequence { text: String, location: Location },
}

impl Error {
    pub fn location(&self) -> Location {
        match self {
            Error::InvalidCharacterLiteral { location }
            | Error::InvalidStringLiteral { location }
            | Error::InvalidIntegerLiteral { location, .. }
            | Error::UnknownSequence { location, .. } => *location,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidCharacterLiteral { .. } => 1,
            Error::InvalidStringLiteral { .. } => 2,
            Error::InvalidIntegerLiteral { .. } => 3,
            Error::UnknownSequence { .. } => 4,
        }
    }
}
