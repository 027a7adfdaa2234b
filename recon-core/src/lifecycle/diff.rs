//! Change detection and cross-field planning.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

/// Top-level attributes that differ between two flattened states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    fields: BTreeSet<String>,
}

impl ChangeSet {
    /// Compare two attribute objects key by key.
    ///
    /// A missing key and `null` are the same. String values of fields listed
    /// in `case_insensitive` are compared ignoring ASCII case.
    pub fn between(old: &Value, new: &Value, case_insensitive: &[&str]) -> Self {
        let empty = serde_json::Map::new();
        let old = old.as_object().unwrap_or(&empty);
        let new = new.as_object().unwrap_or(&empty);

        let fields = old
            .keys()
            .chain(new.keys())
            .filter(|key| {
                let a = old.get(*key).unwrap_or(&Value::Null);
                let b = new.get(*key).unwrap_or(&Value::Null);
                !same_value(key, a, b, case_insensitive)
            })
            .cloned()
            .collect();

        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn touches_any(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.contains(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.iter().collect();
        f.write_str(&fields.join(", "))
    }
}

fn same_value(key: &str, a: &Value, b: &Value, case_insensitive: &[&str]) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) if case_insensitive.contains(&key) => {
            a.eq_ignore_ascii_case(b)
        }
        _ => a == b,
    }
}

/// Outcome of a resource kind's cross-field checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffPlan {
    /// Delete and recreate instead of updating in place.
    pub requires_replace: bool,
    pub reasons: Vec<String>,
}

impl DiffPlan {
    pub fn replace(reason: impl Into<String>) -> Self {
        Self {
            requires_replace: true,
            reasons: vec![reason.into()],
        }
    }
}

/// A totally ordered service tier.
pub trait Tier: Copy + fmt::Display {
    /// Position in the order. Higher is more capable.
    fn rank(self) -> u8;
}

/// Whether moving from `old` to `new` lowers the tier.
pub fn is_downgrade<T: Tier>(old: T, new: T) -> bool {
    new.rank() < old.rank()
}

/// Check that `field` is set only on tiers at or above `required`.
pub fn validate_tier<T: Tier>(field: &str, required: T, actual: T) -> Result<(), String> {
    if actual.rank() >= required.rank() {
        Ok(())
    } else {
        Err(format!(
            "{} requires tier {} or higher, got {}",
            field, required, actual
        ))
    }
}
