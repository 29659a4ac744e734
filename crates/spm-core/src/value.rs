//! Argument values bound into command templates.

use serde::{Deserialize, Serialize};

/// A single named setting or command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Integer value (pixel counts, repetition index, ...)
    Int(i64),
    /// Floating-point value in SI units
    Float(f64),
    /// Free text (mode names, channel labels, ...)
    Text(String),
}

impl ArgValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(i) => Some(*i as f64),
            ArgValue::Float(f) => Some(*f),
            ArgValue::Text(_) => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(v) => write!(f, "{}", v),
            ArgValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<usize> for ArgValue {
    fn from(v: usize) -> Self {
        ArgValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Text(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Text(v)
    }
}

/// Ordered argument list for one logical command.
///
/// Named placeholders look arguments up by name; positional placeholders
/// (`${0}`, `${1}`, ...) index into insertion order. Binding the same name
/// twice replaces the earlier value in place, keeping its position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandArgs(Vec<(String, ArgValue)>);

impl CommandArgs {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Bind `name` to `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ArgValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Look up by position.
    pub fn get_index(&self, index: usize) -> Option<&ArgValue> {
        self.0.get(index).map(|(_, v)| v)
    }

    /// Number of bound arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for CommandArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = CommandArgs::new();
        for (k, v) in iter {
            args.set(k, v);
        }
        args
    }
}
