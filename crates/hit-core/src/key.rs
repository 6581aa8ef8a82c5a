//! Counter keys and counts.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Maximum length of a counter key in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// Name of a tracked resource (typically the URL a badge is embedded on).
///
/// Keys are validated on construction: non-empty, at most [`MAX_KEY_LEN`]
/// bytes, and free of whitespace and control characters so they can travel
/// inside a single protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CounterKey(String);

impl CounterKey {
    /// Creates a key, validating its contents.
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();

        if key.is_empty() {
            return Err(DomainError::InvalidKey {
                key,
                reason: "key is empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LEN {
            return Err(DomainError::InvalidKey {
                reason: format!("key is {} bytes (max: {MAX_KEY_LEN})", key.len()),
                key,
            });
        }

        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DomainError::InvalidKey {
                key,
                reason: "key contains whitespace or control characters".to_string(),
            });
        }

        Ok(Self(key))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the admission key used to rate-limit one visitor on this key.
    pub fn scoped_to(&self, visitor: &str) -> String {
        format!("{visitor}:{}", self.0)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CounterKey {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for CounterKey {
    type Error = DomainError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<CounterKey> for String {
    fn from(key: CounterKey) -> Self {
        key.0
    }
}

impl AsRef<str> for CounterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Value of a counter. Monotonically non-decreasing per key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Count(u64);

impl Count {
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next count, saturating at `u64::MAX`.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Formats the count for a badge.
    ///
    /// Uses K/M suffixes for large numbers.
    pub fn format(&self) -> String {
        if self.0 < 1_000 {
            format!("{}", self.0)
        } else if self.0 < 10_000 {
            // Truncated tenths so 9_999 stays "9.9K"
            format!("{}.{}K", self.0 / 1_000, self.0 % 1_000 / 100)
        } else if self.0 < 1_000_000 {
            format!("{}K", self.0 / 1_000)
        } else {
            let tenths = self.0 / 100_000;
            format!("{}.{}M", tenths / 10, tenths % 10)
        }
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Count {
    fn from(count: u64) -> Self {
        Self(count)
    }
}
