//! ContextId: Unique identifier for one execution context (a tab, a window,
//! a worker process) taking part in presence.
//!
//! Wraps a u64 internally so ids have a total order that every context agrees
//! on, and displays as a 16-character hex string.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextIdError {
    #[error("Context id must be 16 hex characters, got {0:?}")]
    Malformed(String),
}

/// A unique identifier for an execution context.
///
/// Ordering is numeric and is used as the secondary election key when two
/// contexts share a creation timestamp.
///
/// # Examples
/// ```
/// use presence_core::ContextId;
///
/// let id = ContextId::generate();
/// assert_ne!(id.as_u64(), 0);
///
/// let parsed: ContextId = "00000000000000ff".parse().unwrap();
/// assert_eq!(parsed, ContextId::from(255));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Random nonzero id.
    pub fn generate() -> Self {
        Self(rand::rng().random_range(1..=u64::MAX))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ContextId {
    type Err = ContextIdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = || ContextIdError::Malformed(text.to_string());
        if text.len() != 16 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        u64::from_str_radix(text, 16)
            .map(Self)
            .map_err(|_| malformed())
    }
}

impl From<u64> for ContextId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<ContextId> for u64 {
    fn from(id: ContextId) -> u64 {
        id.0
    }
}

// On the wire ids are hex strings, matching how they are logged
impl serde::Serialize for ContextId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ContextId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
