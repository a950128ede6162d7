//! Runtime and constant values.
//!
//! Locals in the model are abstract slots, so the value universe is kept
//! deliberately small. `Func` is the shape that flows through indirect-call
//! target slots.

use crate::program::FuncId;
use std::fmt;

/// A value held in a local slot, passed as an argument, or returned from
/// a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The unit value. Also the sentinel substituted for a call result
    /// while its frame is being unwound through.
    Unit,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Immutable string
    Str(String),
    /// A function reference (indirect-call target)
    Func(FuncId),
}

impl Value {
    /// The unit value.
    pub fn unit() -> Self {
        Value::Unit
    }

    /// Extract a boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract an integer, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract a float, if this is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Extract a function reference, if this is one.
    pub fn as_func(&self) -> Option<FuncId> {
        match self {
            Value::Func(f) => Some(*f),
            _ => None,
        }
    }

    /// Name of this value's shape, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Func(_) => "func",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Func(id) => write!(f, "<fn {}>", id.as_u32()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(3).as_int(), Some(3));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(3).as_bool(), None);
        assert_eq!(Value::Func(FuncId::from_u32(1)).as_func(), Some(FuncId::from_u32(1)));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Unit.type_name(), "unit");
        assert_eq!(Value::from("x").type_name(), "str");
    }
}
