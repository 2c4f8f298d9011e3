//! Keys - the orderable projection of record values.
//!
//! Primary keys and index values are both [`Key`]s. Every number sorts before
//! every string, numbers compare numerically and strings compare by byte
//! order. This is also the order SQLite applies to mixed INTEGER/REAL/TEXT
//! columns, so native SQL ordering and in-process ordering agree.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{error::Result, Error};

/// A primary key or index value.
#[derive(Debug, Clone)]
pub enum Key {
    /// A finite number. Integral values are kept as integers on output.
    Number(f64),
    /// A string.
    Text(String),
}

impl Key {
    /// Build a numeric key, rejecting NaN and infinities.
    pub fn number(n: f64) -> Option<Self> {
        if !n.is_finite() {
            return None;
        }
        // Normalize -0.0 so it is the same key as 0
        Some(Key::Number(if n == 0.0 { 0.0 } else { n }))
    }

    /// Project a JSON value onto a key. Returns `None` for values that are
    /// not valid keys (null, booleans, arrays, objects).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().and_then(Key::number),
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    /// Like [`Key::from_value`] but fails with a data error.
    pub fn try_from_value(value: &Value) -> Result<Self> {
        Key::from_value(value)
            .ok_or_else(|| Error::DataError(format!("{value} is not a valid key")))
    }

    /// Convert back to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => match self.as_integer() {
                Some(i) => Value::from(i),
                None => Value::from(*n),
            },
            Key::Text(s) => Value::String(s.clone()),
        }
    }

    /// The integer value of a numeric key, if it is integral.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Key::Number(n) if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 => {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    /// The string value of a text key.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Text(s) => Some(s),
            Key::Number(_) => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Text(_) => 1,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Key::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("{value} is not a valid key")))
    }
}

/// Largest key the auto-increment generator hands out (2^53).
pub const MAX_GENERATED_KEY: i64 = 1 << 53;

/// Generator value after a record with key `key` is stored.
///
/// Numeric keys at or past the current value push the generator beyond
/// them; anything at or above [`MAX_GENERATED_KEY`] exhausts it for good.
pub fn advance_generator(current: i64, key: &Key) -> i64 {
    match key {
        Key::Number(n) if *n >= current as f64 => {
            if *n >= MAX_GENERATED_KEY as f64 {
                MAX_GENERATED_KEY + 1
            } else {
                n.floor() as i64 + 1
            }
        }
        _ => current,
    }
}

/// The key an auto-increment store hands out next.
///
/// Fails with [`Error::Constraint`] once the generator is exhausted, so a
/// generated key can never collide with one already stored.
pub fn generated_key(store: &str, key_path: &str, next: i64) -> Result<Key> {
    if next > MAX_GENERATED_KEY {
        return Err(Error::Constraint {
            store: store.to_string(),
            index: key_path.to_string(),
            key: next.to_string(),
        });
    }
    Ok(Key::from(next))
}

/// Look up a (possibly dotted) field path inside a record.
pub fn field<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

/// Project the value at `path` onto a key, if it is one.
pub fn key_at(record: &Value, path: &str) -> Option<Key> {
    field(record, path).and_then(Key::from_value)
}

/// Write `key` into `record` at `path`, creating intermediate objects.
pub fn set_key(record: &mut Value, path: &str, key: &Key) -> Result<()> {
    let obj = record
        .as_object_mut()
        .ok_or_else(|| Error::DataError(format!("cannot set key path '{path}' on non-object")))?;
    match path.split_once('.') {
        None => {
            obj.insert(path.to_string(), key.to_value());
            Ok(())
        }
        Some((head, rest)) => {
            let child = obj
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            set_key(child, rest, key)
        }
    }
}
