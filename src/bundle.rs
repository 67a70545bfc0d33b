//! Typed request argument bundles and argument expansion.
//!
//! A request enters the dispatcher as an [`ArgBundle`]: its position in the
//! input (`idx`) plus an ordered map of named [`ArgValue`] fields. Bundles are
//! opaque to the dispatcher; only workers interpret the fields.
//!
//! [`expand_args`] turns a caller-friendly mapping of "one list per varying
//! parameter plus scalar defaults" into the ordered bundle sequence the
//! dispatcher consumes.
//!
//! # Example
//!
//! ```
//! use swarmdl_core::bundle::{expand_args, ArgField, ArgValue};
//! use std::collections::BTreeMap;
//!
//! let mut arg_map = BTreeMap::new();
//! arg_map.insert(
//!     "code".to_string(),
//!     ArgField::per_request(["0000", "0001"]),
//! );
//! arg_map.insert("file_type".to_string(), ArgField::scalar("txt"));
//!
//! let bundles = expand_args(&arg_map);
//! assert_eq!(bundles.len(), 2);
//! assert_eq!(bundles[1].idx, 1);
//! assert_eq!(bundles[1].str_field("code"), Some("0001"));
//! assert_eq!(bundles[1].str_field("file_type"), Some("txt"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Recognized scalar types for bundle fields.
///
/// Fields a shorter per-request list did not cover are filled with `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Integer argument.
    Int(i64),
    /// Floating-point argument.
    Float(f64),
    /// Short string argument.
    Str(String),
    /// Absent value.
    Null,
}

impl ArgValue {
    /// Returns the contained string, if this value is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
            Self::Null => Ok(()),
        }
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// One request's inputs plus its index.
///
/// `idx` is assigned at expansion time, preserves input order, and is the
/// identity key across streams, the retry counter, and statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArgBundle {
    /// Unique non-negative request index.
    pub idx: usize,
    /// Named argument fields, in name order.
    #[serde(flatten)]
    pub fields: BTreeMap<String, ArgValue>,
}

impl ArgBundle {
    /// Creates an empty bundle for the given index.
    #[must_use]
    pub fn new(idx: usize) -> Self {
        Self {
            idx,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a named field, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&ArgValue> {
        self.fields.get(name)
    }

    /// Returns a named field as a string, if present and a string.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(ArgValue::as_str)
    }
}

/// A caller-supplied argument: one value for the whole run, or one per request.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgField {
    /// The same value for every request.
    Scalar(ArgValue),
    /// One value per request, in input order.
    PerRequest(Vec<ArgValue>),
}

impl ArgField {
    /// Creates a scalar field.
    pub fn scalar(value: impl Into<ArgValue>) -> Self {
        Self::Scalar(value.into())
    }

    /// Creates a per-request field from any iterable of convertible values.
    pub fn per_request<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ArgValue>,
    {
        Self::PerRequest(values.into_iter().map(Into::into).collect())
    }
}

/// Expands an argument mapping into an ordered, indexed bundle sequence.
///
/// The sequence length is the longest `PerRequest` list; shorter lists
/// contribute `Null` for the positions past their end, and `Scalar` fields
/// repeat on every bundle. A mapping with no `PerRequest` field expands to
/// an empty sequence.
#[must_use]
pub fn expand_args(arg_map: &BTreeMap<String, ArgField>) -> Vec<ArgBundle> {
    let longest = arg_map
        .values()
        .filter_map(|field| match field {
            ArgField::PerRequest(values) => Some(values.len()),
            ArgField::Scalar(_) => None,
        })
        .max()
        .unwrap_or(0);

    (0..longest)
        .map(|idx| {
            let mut bundle = ArgBundle::new(idx);
            for (name, field) in arg_map {
                let value = match field {
                    ArgField::Scalar(value) => value.clone(),
                    ArgField::PerRequest(values) => {
                        values.get(idx).cloned().unwrap_or(ArgValue::Null)
                    }
                };
                bundle.fields.insert(name.clone(), value);
            }
            bundle
        })
        .collect()
}
