//! Identifier helpers: time-ordered UUIDs and order-independent pair ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Generate a new UUIDv7 identifier.
///
/// UUIDv7 embeds a millisecond timestamp, so audit rows and proposals sort
/// by creation time without an extra column.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Order-independent identifier of a concept pair.
///
/// Rendered as `"min|max"` over the string form of the two ids, so
/// `PairId::new(a, b) == PairId::new(b, a)` for every pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PairId {
    low: Uuid,
    high: Uuid,
}

impl PairId {
    /// Build the canonical pair id for two concepts.
    pub fn new(a: Uuid, b: Uuid) -> Self {
        // Hyphenated lowercase UUID strings order the same as their bytes.
        if a.to_string() <= b.to_string() {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// The lexicographically smaller id.
    pub fn low(&self) -> Uuid {
        self.low
    }

    /// The lexicographically larger id.
    pub fn high(&self) -> Uuid {
        self.high
    }

    /// Both ids, smaller first.
    pub fn ids(&self) -> (Uuid, Uuid) {
        (self.low, self.high)
    }

    /// Whether the pair involves the given concept.
    pub fn contains(&self, id: Uuid) -> bool {
        self.low == id || self.high == id
    }

    /// The other member of the pair, if `id` is one of them.
    pub fn other(&self, id: Uuid) -> Option<Uuid> {
        if self.low == id {
            Some(self.high)
        } else if self.high == id {
            Some(self.low)
        } else {
            None
        }
    }

    /// Parse the `"min|max"` form back into a pair id.
    pub fn parse(s: &str) -> Result<Self> {
        let (a, b) = s
            .split_once('|')
            .ok_or_else(|| Error::InvalidInput(format!("pair id without separator: {}", s)))?;
        let a = Uuid::parse_str(a)
            .map_err(|e| Error::InvalidInput(format!("bad pair id member {}: {}", a, e)))?;
        let b = Uuid::parse_str(b)
            .map_err(|e| Error::InvalidInput(format!("bad pair id member {}: {}", b, e)))?;
        Ok(Self::new(a, b))
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.low, self.high)
    }
}

impl FromStr for PairId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<PairId> for String {
    fn from(p: PairId) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for PairId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}
