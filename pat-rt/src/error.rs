//! The runtime-level error surface: whichever [`Diagnostic`] stopped the
//! last `execute_*` call, regardless of which stage produced it.

use pat_diagnostics::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct RuntimeError(pub Diagnostic);

impl From<Diagnostic> for RuntimeError {
    fn from(diagnostic: Diagnostic) -> Self {
        RuntimeError(diagnostic)
    }
}

impl RuntimeError {
    pub fn diagnostic(&self) -> &Diagnostic {
        &self.0
    }
}
