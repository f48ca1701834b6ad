//! Redacted string wrapper for token material.
//!
//! Every access, refresh, and ID token that crosses the crate boundary flows
//! through [`Secret`], so that a token can never leak through a format
//! string, a debug dump, or a serialized log line.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;

/// The marker every textual representation of a [`Secret`] collapses to.
pub const REDACTED: &str = "[REDACTED]";

/// A string whose `Display`, `Debug`, and `Serialize` forms are all
/// `[REDACTED]`.
///
/// The raw value is only obtainable through [`Secret::value`] or
/// [`Secret::into_value`], whose names make the exposure explicit at the
/// call site.
///
/// Deserialization is intentionally asymmetric: a `Secret` deserializes from
/// a plain string, so IdP token responses parse directly into secret-typed
/// fields, while serializing one back out produces only the marker.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying value.
    pub fn value(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> String {
        self.0
    }

    /// Whether the wrapped value is empty, without exposing it.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Constant-time equality so the type is safe in verification contexts.
impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for Secret {}
