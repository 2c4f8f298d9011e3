//! Key ranges and traversal direction.
//!
//! [`KeyRange`] is the one data format every adapter accepts identically. Its
//! serialized form is `{ lower?, lowerOpen?, upper?, upperOpen? }`.

use std::cmp::Ordering;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::{error::Result, Error, Key};

/// Traversal direction for cursors and bulk reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending key order (default).
    #[default]
    Next,
    /// Descending key order.
    Prev,
}

impl Direction {
    /// Whether this is descending order.
    pub fn is_reverse(self) -> bool {
        self == Direction::Prev
    }
}

/// An interval over key or index values. Absent bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<Key>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lower_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<Key>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub upper_open: bool,
}

impl KeyRange {
    /// The unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            lower_open: false,
            upper: Some(key),
            upper_open: false,
        }
    }

    /// All keys above `key` (exclusive when `open`).
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    /// All keys below `key` (exclusive when `open`).
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(key.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    /// Keys between `lower` and `upper`.
    ///
    /// Fails when `lower > upper`, or when they are equal and either side is
    /// open.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        let range = Self {
            lower: Some(lower.into()),
            lower_open,
            upper: Some(upper.into()),
            upper_open,
        };
        range.validate()?;
        Ok(range)
    }

    /// Check the `lower <= upper` invariant.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::DataError(format!(
                "invalid key range: lower bound {} is above upper bound {}",
                self.lower.as_ref().map(Key::to_string).unwrap_or_default(),
                self.upper.as_ref().map(Key::to_string).unwrap_or_default(),
            )));
        }
        Ok(())
    }

    /// Whether no key can fall inside this range.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => match lower.cmp(upper) {
                Ordering::Greater => true,
                Ordering::Equal => self.lower_open || self.upper_open,
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    /// Whether this range places no restriction at all.
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// Whether `key` falls inside this range.
    pub fn contains(&self, key: &Key) -> bool {
        let above_lower = match &self.lower {
            None => true,
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
        };
        let below_upper = match &self.upper {
            None => true,
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
        };
        above_lower && below_upper
    }

    /// Narrow this range so it also satisfies `other`.
    ///
    /// The result may be empty; it is never validated.
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        let (lower, lower_open) = tighter(
            (&self.lower, self.lower_open),
            (&other.lower, other.lower_open),
            Ordering::Greater,
        );
        let (upper, upper_open) = tighter(
            (&self.upper, self.upper_open),
            (&other.upper, other.upper_open),
            Ordering::Less,
        );
        KeyRange {
            lower,
            lower_open,
            upper,
            upper_open,
        }
    }

    /// The lower bound as a [`Bound`], for ordered maps.
    pub fn start_bound(&self) -> Bound<&Key> {
        match &self.lower {
            None => Bound::Unbounded,
            Some(key) if self.lower_open => Bound::Excluded(key),
            Some(key) => Bound::Included(key),
        }
    }

    /// The upper bound as a [`Bound`], for ordered maps.
    pub fn end_bound(&self) -> Bound<&Key> {
        match &self.upper {
            None => Bound::Unbounded,
            Some(key) if self.upper_open => Bound::Excluded(key),
            Some(key) => Bound::Included(key),
        }
    }
}

/// Pick the more restrictive of two bounds. `prefer` is the ordering that
/// makes a bound tighter (greater for lower bounds, less for upper bounds).
fn tighter(
    a: (&Option<Key>, bool),
    b: (&Option<Key>, bool),
    prefer: Ordering,
) -> (Option<Key>, bool) {
    match (a.0, b.0) {
        (None, None) => (None, false),
        (Some(key), None) => (Some(key.clone()), a.1),
        (None, Some(key)) => (Some(key.clone()), b.1),
        (Some(ka), Some(kb)) => match ka.cmp(kb) {
            Ordering::Equal => (Some(ka.clone()), a.1 || b.1),
            ord if ord == prefer => (Some(ka.clone()), a.1),
            _ => (Some(kb.clone()), b.1),
        },
    }
}
