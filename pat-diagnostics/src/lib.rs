//! Source locations and the diagnostic triple (code, location, trace) shared
//! by every stage of the pipeline, from the preprocessor down to the
//! evaluator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a registered [`Source`](https://docs.rs/pat-source). `0` is the
/// sentinel "empty" source used by synthetic locations that don't originate
/// from user text.
pub type SourceId = u32;

pub const EMPTY_SOURCE: SourceId = 0;

/// A span of source text: `(source, line, column, length)`. Ordering is only
/// meaningful within a single source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub source: SourceId,
    pub line: u32,
    pub column: u32,
    pub length: u32,
}

impl Location {
    pub const fn new(source: SourceId, line: u32, column: u32, length: u32) -> Self {
        Self { source, line, column, length }
    }

    pub const fn empty() -> Self {
        Self::new(EMPTY_SOURCE, 0, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.source == EMPTY_SOURCE
    }

    /// A location spanning from the start of `self` to the end of `other`,
    /// when both are in the same source.
    pub fn merge(&self, other: &Location) -> Location {
        if self.source != other.source || self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        if self.line != other.line {
            // multi-line spans only track the starting position; length is
            // advisory for diagnostics rendering in that case.
            return *self;
        }
        let end = other.column + other.length;
        Location::new(self.source, self.line, self.column, end.saturating_sub(self.column))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::empty()
    }
}

/// One enclosing frame of a diagnostic trace: a function call, an `import`,
/// or an `#include`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub description: String,
    pub location: Location,
}

/// The stage a diagnostic code belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Preprocessor,
    Lexer,
    Parser,
    Validator,
    Evaluator,
}

impl Stage {
    pub fn prefix(&self) -> char {
        match self {
            Stage::Preprocessor => 'M',
            Stage::Lexer => 'L',
            Stage::Parser => 'P',
            Stage::Validator => 'V',
            Stage::Evaluator => 'E',
        }
    }
}

/// The (code, location, trace) triple every stage's error carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub code: u16,
    pub title: String,
    pub description: String,
    pub hint: Option<String>,
    pub location: Location,
    pub trace: Vec<TraceFrame>,
}

impl Diagnostic {
    pub fn new(
        stage: Stage,
        code: u16,
        title: impl Into<String>,
        description: impl Into<String>,
        location: Location,
    ) -> Self {
        Self {
            stage,
            code,
            title: title.into(),
            description: description.into(),
            hint: None,
            location,
            trace: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> Self {
        self.trace = trace;
        self
    }

    pub fn push_frame(&mut self, description: impl Into<String>, location: Location) {
        self.trace.push(TraceFrame { description: description.into(), location });
    }

    pub fn code_str(&self) -> String {
        format!("{}{:04}", self.stage.prefix(), self.code)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]: {}\n{}", self.code_str(), self.title, self.description)?;
        if let Some(hint) = &self.hint {
            write!(f, "\nhint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Renders the offending line of `source_text` with a caret under `location`,
/// clipping over-long lines with whitespace-aware context. This is the only
/// piece of formatting logic that core owns; richer (JSON/HTML) formatters
/// are external collaborators.
pub fn render_caret(source_text: &str, location: &Location) -> String {
    let line = source_text.lines().nth(location.line.saturating_sub(1) as usize).unwrap_or("");

    const MAX_LEN: usize = 120;
    const CONTEXT: usize = 40;

    let col = location.column.saturating_sub(1) as usize;
    let (clipped, caret_col) = if line.len() > MAX_LEN {
        let start = col.saturating_sub(CONTEXT);
        let start = line
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= start)
            .unwrap_or(0);
        let end = (start + MAX_LEN).min(line.len());
        (format!("...{}...", &line[start..end]), col.saturating_sub(start) + 3)
    } else {
        (line.to_string(), col)
    };

    let underline_len = (location.length.max(1)) as usize;
    let mut caret_line = " ".repeat(caret_col);
    caret_line.push('^');
    if underline_len > 1 {
        caret_line.push_str(&"~".repeat(underline_len - 1));
    }

    format!("{}\n{}", clipped, caret_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_str_pads_zero() {
        let d = Diagnostic::new(Stage::Lexer, 3, "bad", "desc", Location::new(1, 1, 1, 1));
        assert_eq!(d.code_str(), "L0003");
    }

    #[test]
    fn merge_same_line_extends_length() {
        let a = Location::new(1, 2, 5, 3);
        let b = Location::new(1, 2, 10, 4);
        let m = a.merge(&b);
        assert_eq!(m, Location::new(1, 2, 5, 9));
    }

    #[test]
    fn render_caret_points_at_column() {
        let src = "struct P { u8 a; }\n";
        let loc = Location::new(1, 1, 12, 2);
        let out = render_caret(src, &loc);
        let caret_line = out.lines().nth(1).unwrap();
        assert_eq!(caret_line.chars().filter(|&c| c == '^').count(), 1);
        assert_eq!(caret_line.find('^'), Some(11));
    }
}
