//! Conflict resolution between two versions of a record.
//!
//! A conflict exists when the same key holds different values on the source
//! and target. A [`ConflictPolicy`] picks the value both sides should end up
//! with; resolution is deterministic for every policy except a caller's
//! `Manual` function.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{key, Key};

/// Caller-supplied merge: `(source, target) -> resolved`.
pub type Resolver = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// How conflicting values are resolved.
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    /// The source value wins (default)
    #[default]
    SourceWins,
    /// The target value wins
    TargetWins,
    /// The value with the greater timestamp field wins. A missing or
    /// non-comparable timestamp loses to any present one; ties keep the
    /// target.
    LastWriteWins { field: String },
    /// A caller function produces the resolved value
    Manual(Resolver),
}

impl ConflictPolicy {
    /// Last-write-wins on `field`.
    pub fn last_write_wins(field: impl Into<String>) -> Self {
        ConflictPolicy::LastWriteWins {
            field: field.into(),
        }
    }

    /// Resolve with a caller function.
    pub fn manual<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        ConflictPolicy::Manual(Arc::new(f))
    }

    /// Decide between `source` and `target`.
    pub fn resolve(&self, source: &Value, target: &Value) -> Resolution {
        match self {
            ConflictPolicy::SourceWins => Resolution::SourceWins,
            ConflictPolicy::TargetWins => Resolution::TargetWins,
            ConflictPolicy::LastWriteWins { field } => {
                let stamp = |v: &Value| key::key_at(v, field);
                // None orders below every Some
                if stamp(source) > stamp(target) {
                    Resolution::SourceWins
                } else {
                    Resolution::TargetWins
                }
            }
            ConflictPolicy::Manual(merge) => Resolution::Merged(merge(source, target)),
        }
    }
}

impl std::fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::SourceWins => f.write_str("SourceWins"),
            ConflictPolicy::TargetWins => f.write_str("TargetWins"),
            ConflictPolicy::LastWriteWins { field } => f
                .debug_struct("LastWriteWins")
                .field("field", field)
                .finish(),
            ConflictPolicy::Manual(_) => f.write_str("Manual(..)"),
        }
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Source value kept
    SourceWins,
    /// Target value kept
    TargetWins,
    /// A new value produced by a manual resolver
    Merged(Value),
}

impl Resolution {
    /// The value both sides should hold.
    pub fn winner<'a>(&'a self, source: &'a Value, target: &'a Value) -> &'a Value {
        match self {
            Resolution::SourceWins => source,
            Resolution::TargetWins => target,
            Resolution::Merged(value) => value,
        }
    }
}

/// A conflict found during a full reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Store the conflict was in
    pub store: String,
    /// Key both sides hold
    pub key: Key,
    /// How it was resolved
    pub resolution: Resolution,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fixed_policies() {
        let (a, b) = (json!({"v": 1}), json!({"v": 2}));
        assert_eq!(ConflictPolicy::SourceWins.resolve(&a, &b), Resolution::SourceWins);
        assert_eq!(ConflictPolicy::TargetWins.resolve(&a, &b), Resolution::TargetWins);
        assert_eq!(ConflictPolicy::default().resolve(&a, &b).winner(&a, &b), &a);
    }

    #[test]
    fn last_write_wins_compares_timestamps() {
        let policy = ConflictPolicy::last_write_wins("updatedAt");
        let older = json!({"id": 1, "updatedAt": 100});
        let newer = json!({"id": 1, "updatedAt": 200});
        assert_eq!(policy.resolve(&newer, &older), Resolution::SourceWins);
        assert_eq!(policy.resolve(&older, &newer), Resolution::TargetWins);
    }

    #[test]
    fn last_write_wins_missing_and_ties_keep_target() {
        let policy = ConflictPolicy::last_write_wins("updatedAt");
        let stamped = json!({"updatedAt": 1});
        let unstamped = json!({});
        assert_eq!(policy.resolve(&stamped, &unstamped), Resolution::SourceWins);
        assert_eq!(policy.resolve(&unstamped, &stamped), Resolution::TargetWins);
        assert_eq!(policy.resolve(&unstamped, &unstamped), Resolution::TargetWins);
        assert_eq!(policy.resolve(&stamped, &stamped), Resolution::TargetWins);
    }

    #[test]
    fn manual_merges() {
        let policy = ConflictPolicy::manual(|s, t| {
            json!({"v": s["v"].as_i64().unwrap_or(0) + t["v"].as_i64().unwrap_or(0)})
        });
        let (a, b) = (json!({"v": 1}), json!({"v": 2}));
        let resolution = policy.resolve(&a, &b);
        assert_eq!(resolution.winner(&a, &b), &json!({"v": 3}));
    }
}
