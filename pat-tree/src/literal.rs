//! The closed sum of runtime values shared by the AST, the evaluator and
//! the pattern tree's `value()`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pattern::Pattern;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoercionError {
    #[error("cannot convert {from} to {to}")]
    Impossible { from: &'static str, to: &'static str },
}

/// A value produced by evaluating an expression. Every variant exposes a
/// total coercion to every other kind; impossible conversions return
/// [`CoercionError`] rather than panicking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Literal {
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    Char(char),
    Boolean(bool),
    Str(String),
    Pattern(Pattern),
}

impl Literal {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Literal::Unsigned(_) => "unsigned",
            Literal::Signed(_) => "signed",
            Literal::Float(_) => "float",
            Literal::Char(_) => "char",
            Literal::Boolean(_) => "boolean",
            Literal::Str(_) => "string",
            Literal::Pattern(_) => "pattern",
        }
    }

    pub fn to_unsigned(&self) -> Result<u128, CoercionError> {
        match self {
            Literal::Unsigned(v) => Ok(*v),
            Literal::Signed(v) => Ok(*v as u128),
            Literal::Float(v) => Ok(*v as u128),
            Literal::Char(v) => Ok(*v as u128),
            Literal::Boolean(v) => Ok(*v as u128),
            _ => Err(CoercionError::Impossible { from: self.kind_name(), to: "unsigned" }),
        }
    }

    pub fn to_signed(&self) -> Result<i128, CoercionError> {
        match self {
            Literal::Unsigned(v) => Ok(*v as i128),
            Literal::Signed(v) => Ok(*v),
            Literal::Float(v) => Ok(*v as i128),
            Literal::Char(v) => Ok(*v as i128),
            Literal::Boolean(v) => Ok(*v as i128),
            _ => Err(CoercionError::Impossible { from: self.kind_name(), to: "signed" }),
        }
    }

    pub fn to_float(&self) -> Result<f64, CoercionError> {
        match self {
            Literal::Unsigned(v) => Ok(*v as f64),
            Literal::Signed(v) => Ok(*v as f64),
            Literal::Float(v) => Ok(*v),
            Literal::Boolean(v) => Ok(if *v { 1.0 } else { 0.0 }),
            _ => Err(CoercionError::Impossible { from: self.kind_name(), to: "float" }),
        }
    }

    pub fn to_boolean(&self) -> Result<bool, CoercionError> {
        match self {
            Literal::Unsigned(v) => Ok(*v != 0),
            Literal::Signed(v) => Ok(*v != 0),
            Literal::Float(v) => Ok(*v != 0.0),
            Literal::Boolean(v) => Ok(*v),
            Literal::Char(v) => Ok(*v as u32 != 0),
            _ => Err(CoercionError::Impossible { from: self.kind_name(), to: "boolean" }),
        }
    }

    pub fn to_pattern(&self) -> Result<Pattern, CoercionError> {
        match self {
            Literal::Pattern(p) => Ok(p.clone()),
            _ => Err(CoercionError::Impossible { from: self.kind_name(), to: "pattern" }),
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Literal::Unsigned(v) => v.to_string(),
            Literal::Signed(v) => v.to_string(),
            Literal::Float(v) => format!("{v}"),
            Literal::Char(v) => v.to_string(),
            Literal::Boolean(v) => v.to_string(),
            Literal::Str(v) => v.clone(),
            Literal::Pattern(p) => p.formatted_name(),
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Unsigned(a), Literal::Unsigned(b)) => a == b,
            (Literal::Signed(a), Literal::Signed(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a == b,
            (Literal::Char(a), Literal::Char(b)) => a == b,
            (Literal::Boolean(a), Literal::Boolean(b)) => a == b,
            (Literal::Str(a), Literal::Str(b)) => a == b,
            (Literal::Pattern(a), Literal::Pattern(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercions_round_trip() {
        let v = Literal::Signed(-4);
        assert_eq!(v.to_unsigned().unwrap(), (-4i128) as u128);
        assert_eq!(v.to_float().unwrap(), -4.0);
        assert_eq!(v.to_boolean().unwrap(), true);
    }

    #[test]
    fn string_has_no_numeric_coercion() {
        let v = Literal::Str("x".into());
        assert!(v.to_unsigned().is_err());
    }
}
