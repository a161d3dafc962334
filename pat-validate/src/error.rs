use pat_diagnostics::{Diagnostic, Location, Stage};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("V0002: `{name}` redefined at {location}, first declared at {first}")]
    Redefinition { name: String, location: Location, first: Location },
    #[error("V0002: enum entry `{name}` duplicated at {location}, first declared at {first}")]
    DuplicateEnumEntry { name: String, location: Location, first: Location },
    #[error("V0003: type reference recursion exceeds depth {limit} at {location}")]
    RecursionLimit { limit: u32, location: Location },
    #[error("V0003: `{name}` cyclically references itself at {location}")]
    CyclicTypeReference { name: String, location: Location },
}

impl Error {
    pub fn location(&self) -> Location {
        match self {
            Error::Redefinition { location, .. }
            | Error::DuplicateEnumEntry { location, .. }
            | Error::RecursionLimit { location, .. }
            | Error::CyclicTypeReference { location, .. } => *location,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::Redefinition { .. } | Error::DuplicateEnumEntry { .. } => 2,
            Error::RecursionLimit { .. } | Error::CyclicTypeReference { .. } => 3,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let location = self.location();
        let code = self.code();
        Diagnostic::new(Stage::Validator, code, title(code), self.to_string(), location)
    }
}

fn title(code: u16) -> &'static str {
    match code {
        2 => "redefinition",
        3 => "recursion depth exceeded",
        _ => "validation error",
    }
}
