//! The typed value a [`crate::supervisor::StateVariable`] can hold (spec
//! §3). Dynamic attribute dictionaries in the original implementation
//! (`self.properties[name] = value`, any Python object) become this closed
//! sum type, keyed by a fixed string namespace at the call sites instead of
//! by dynamic attributes.

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};

/// One value a state variable can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Date(NaiveDate),
  Time(NaiveTime),
  Duration(Duration),
  FloatVec(Vec<f64>),
}

impl Value {
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Float(f) => Some(*f),
      Value::Int(i) => Some(*i as f64),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }
}

impl std::fmt::Display for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Bool(b) => write!(f, "{b}"),
      Value::Int(i) => write!(f, "{i}"),
      Value::Float(x) => write!(f, "{x}"),
      Value::Str(s) => write!(f, "{s}"),
      Value::Date(d) => write!(f, "{d}"),
      Value::Time(t) => write!(f, "{t}"),
      Value::Duration(d) => write!(f, "{:.3}", d.as_secs_f64()),
      Value::FloatVec(v) => write!(f, "{v:?}"),
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}
impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}
impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Value::Float(v)
  }
}
impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::Str(v)
  }
}
impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::Str(v.to_string())
  }
}
