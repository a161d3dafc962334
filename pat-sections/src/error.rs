use thiserror::Error;

/// I/O failure surfaced by a [`crate::Section`]. Carries enough context for
/// the evaluator to build an `E0004`/`E0005` diagnostic with a location.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IoError {
    #[error("read of {length} byte(s) at offset {offset} is out of bounds (section size {size})")]
    OutOfBounds { offset: u64, length: u64, size: u64 },
    #[error("write refused: section is read-only")]
    ReadOnly,
    #[error("write of {length} byte(s) at offset {offset} would grow the section past its {max_size} byte limit")]
    MaxSizeExceeded { offset: u64, length: u64, max_size: u64 },
    #[error("resize to {requested} bytes refused by this section kind")]
    ResizeRefused { requested: u64 },
    #[error("reentrant access to this section")]
    Reentrant,
    #[error("access at offset {offset} crosses an unmapped gap; nearest mapped span starts at {hint}")]
    UnmappedGap { offset: u64, hint: u64 },
}
