use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{KernelError, Result};

/// A single cell value flowing through routing, execution and merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Text comparison rule shared by ORDER BY merge and group-key equality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collation {
    #[default]
    Binary,
    CaseInsensitive,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Compare two non-null values. Nulls are placed by the caller according
    /// to the NULLS ordering of the sort item.
    pub fn compare(&self, other: &Value, collation: Collation) -> Result<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Null, _) => Ok(Ordering::Less),
            (_, Value::Null) => Ok(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => compare_floats(*a, *b),
            (Value::Int(a), Value::Float(b)) => compare_floats(*a as f64, *b),
            (Value::Float(a), Value::Int(b)) => compare_floats(*a, *b as f64),
            (Value::Text(a), Value::Text(b)) => Ok(match collation {
                Collation::Binary => a.cmp(b),
                Collation::CaseInsensitive => a.to_lowercase().cmp(&b.to_lowercase()),
            }),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a.cmp(b)),
            (a, b) => Err(KernelError::Merge(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Equality under the collation, used for group keys
    pub fn equals(&self, other: &Value, collation: Collation) -> Result<bool> {
        Ok(self.compare(other, collation)? == Ordering::Equal)
    }

    /// Byte encoding of the value for hashing group keys. Case-insensitive
    /// collation folds text so that equal keys encode identically.
    pub(crate) fn encode_key(&self, collation: Collation, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Bool(v) => {
                out.push(1);
                out.push(*v as u8);
            }
            Value::Int(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            // integral floats encode as ints so 1 and 1.0 land in the same group
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                out.push(2);
                out.extend_from_slice(&(*v as i64).to_le_bytes());
            }
            Value::Float(v) => {
                out.push(5);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Text(v) => {
                out.push(3);
                let folded = match collation {
                    Collation::Binary => v.clone(),
                    Collation::CaseInsensitive => v.to_lowercase(),
                };
                out.extend_from_slice(&(folded.len() as u32).to_le_bytes());
                out.extend_from_slice(folded.as_bytes());
            }
            Value::Bytes(v) => {
                out.push(4);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
            }
        }
    }
}

fn compare_floats(a: f64, b: f64) -> Result<Ordering> {
    a.partial_cmp(&b)
        .ok_or_else(|| KernelError::Merge(format!("cannot order NaN ({} vs {})", a, b)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
