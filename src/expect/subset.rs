//! Deep-subset containment over JSON values.
//!
//! Only keys present in the expected structure are checked. Nested objects
//! recurse; every other value, arrays included, must be equal as a whole.
//! A key holding `null` and a missing key are different mismatches.

use std::fmt;

use serde_json::Value;

/// Why a containment check failed.
#[derive(Debug, Clone, PartialEq)]
pub enum MismatchReason {
    /// The expected key is absent from the actual object.
    MissingKey,
    /// The expected value is an object but the actual one is not.
    NotAnObject { actual: Value },
    /// Leaf values differ (including `null` where a value was expected).
    Unequal { expected: Value, actual: Value },
}

/// First failing location of a containment check.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// JSON-path style location, `$` for the root.
    pub path: String,
    pub reason: MismatchReason,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            MismatchReason::MissingKey => write!(f, "at {}: key is missing", self.path),
            MismatchReason::NotAnObject { actual } => {
                write!(f, "at {}: expected an object, got {}", self.path, actual)
            }
            MismatchReason::Unequal { expected, actual } => {
                write!(f, "at {}: expected {}, got {}", self.path, expected, actual)
            }
        }
    }
}

/// Returns true if every key in `expected` is present in `actual` with an
/// equal (or, for objects, recursively contained) value.
pub fn contains_subset(actual: &Value, expected: &Value) -> bool {
    find_mismatch(actual, expected).is_none()
}

/// First mismatch found while checking `expected ⊆ actual`, if any.
pub fn find_mismatch(actual: &Value, expected: &Value) -> Option<Mismatch> {
    mismatch_at("$".to_string(), actual, expected)
}

fn mismatch_at(path: String, actual: &Value, expected: &Value) -> Option<Mismatch> {
    let Value::Object(wanted) = expected else {
        return (!values_equal(actual, expected)).then(|| Mismatch {
            path,
            reason: MismatchReason::Unequal {
                expected: expected.clone(),
                actual: actual.clone(),
            },
        });
    };

    let Value::Object(found) = actual else {
        return Some(Mismatch {
            path,
            reason: MismatchReason::NotAnObject {
                actual: actual.clone(),
            },
        });
    };

    wanted.iter().find_map(|(key, expected_value)| {
        let child = format!("{path}.{key}");
        match found.get(key) {
            None => Some(Mismatch {
                path: child,
                reason: MismatchReason::MissingKey,
            }),
            Some(actual_value) => mismatch_at(child, actual_value, expected_value),
        }
    })
}

/// Structural equality where numbers compare by value (`1` equals `1.0`).
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a == b
            } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                a == b
            } else {
                a.as_f64() == b.as_f64()
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, value)| b.get(key).is_some_and(|other| values_equal(value, other)))
        }
        _ => actual == expected,
    }
}
