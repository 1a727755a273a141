//! Fluent assertions over operation results.
//!
//! ```rust,ignore
//! expect(&result)
//!     .ok()
//!     .rows(2)
//!     .row_contains(json!({"name": "Alice"}))
//!     .duration_less_than(Duration::from_millis(50));
//! ```
//!
//! Every method re-reads the wrapped result and either returns the chain or
//! panics with a message naming expected and actual values.

use std::fmt::{Debug, Display};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorKind;
use crate::result::{CountPayload, ListPayload, OpResult, Outcome, QueryPayload, ValuePayload};

mod subset;

pub use subset::{contains_subset, find_mismatch, Mismatch, MismatchReason};

/// Collection-shaped view of a payload, used by cardinality and containment
/// assertions.
pub trait Inspect {
    /// Plural noun used in failure messages ("rows", "items").
    const NOUN: &'static str;

    fn item_count(&self) -> usize;

    /// JSON view of each item, for containment checks.
    fn items(&self) -> Vec<Value>;

    fn has_content(&self) -> bool {
        self.item_count() > 0
    }
}

/// Start an assertion chain on `result`.
pub fn expect<P>(result: &OpResult<P>) -> Expectation<'_, P> {
    Expectation { result }
}

/// Assertion chain borrowing one result.
pub struct Expectation<'a, P> {
    result: &'a OpResult<P>,
}

impl<P> Clone for Expectation<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Expectation<'_, P> {}

fn describe<P>(result: &OpResult<P>) -> String {
    match result.outcome() {
        Outcome::Success(_) => format!("ok {} result", result.kind()),
        Outcome::CheckFailed => format!("{} check failure", result.kind()),
        Outcome::Failure(error) => format!("{} error ({})", result.kind(), error),
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl<'a, P> Expectation<'a, P> {
    /// The wrapped result.
    pub fn result(&self) -> &'a OpResult<P> {
        self.result
    }

    /// Payload of a successful result.
    #[track_caller]
    pub fn payload(&self) -> &'a P {
        match self.result.payload() {
            Some(payload) => payload,
            None => panic!("Expected ok result, got {}", describe(self.result)),
        }
    }

    #[track_caller]
    pub fn ok(self) -> Self {
        if !self.result.ok() {
            panic!("Expected ok result, got {}", describe(self.result));
        }
        self
    }

    /// Passes for check failures and errors alike.
    #[track_caller]
    pub fn not_ok(self) -> Self {
        if self.result.ok() {
            panic!("Expected result not to be ok, got ok {} result", self.result.kind());
        }
        self
    }

    #[track_caller]
    pub fn check_failed(self) -> Self {
        if !self.result.is_check_failed() {
            panic!("Expected check failure, got {}", describe(self.result));
        }
        self
    }

    #[track_caller]
    pub fn error_kind(self, kind: ErrorKind) -> Self {
        match self.result.error() {
            Some(error) if error.kind() == kind => self,
            Some(error) => panic!("Expected error kind {}, got {}", kind, error.kind()),
            None => panic!("Expected error kind {}, got {}", kind, describe(self.result)),
        }
    }

    #[track_caller]
    pub fn error_contains(self, needle: &str) -> Self {
        match self.result.error() {
            Some(error) if error.message().contains(needle) => self,
            Some(error) => panic!(
                "Expected error message to contain {:?}, got {:?}",
                needle,
                error.message()
            ),
            None => panic!(
                "Expected error containing {:?}, got {}",
                needle,
                describe(self.result)
            ),
        }
    }

    #[track_caller]
    pub fn duration_less_than(self, limit: Duration) -> Self {
        if self.result.duration() >= limit {
            panic!(
                "Expected duration < {}ms, got {:.3}ms",
                limit.as_millis(),
                self.result.duration_ms()
            );
        }
        self
    }

    /// Hand the payload to a custom matcher; an `Err` fails the assertion
    /// with the matcher's message.
    #[track_caller]
    pub fn matches<F, E>(self, matcher: F) -> Self
    where
        F: FnOnce(&P) -> Result<(), E>,
        E: Display,
    {
        if let Err(err) = matcher(self.payload()) {
            panic!("{}", err);
        }
        self
    }
}

impl<'a, P: Inspect> Expectation<'a, P> {
    #[track_caller]
    pub fn count(self, expected: usize) -> Self {
        let actual = self.payload().item_count();
        if actual != expected {
            panic!("Expected {} {}, got {}", expected, P::NOUN, actual);
        }
        self
    }

    #[track_caller]
    pub fn count_at_least(self, min: usize) -> Self {
        let actual = self.payload().item_count();
        if actual < min {
            panic!("Expected at least {} {}, got {}", min, P::NOUN, actual);
        }
        self
    }

    #[track_caller]
    pub fn count_at_most(self, max: usize) -> Self {
        let actual = self.payload().item_count();
        if actual > max {
            panic!("Expected at most {} {}, got {}", max, P::NOUN, actual);
        }
        self
    }

    #[track_caller]
    pub fn has_content(self) -> Self {
        if !self.payload().has_content() {
            panic!("Expected content, got no {}", P::NOUN);
        }
        self
    }

    #[track_caller]
    pub fn no_content(self) -> Self {
        let payload = self.payload();
        if payload.has_content() {
            panic!(
                "Expected no content, got {} {}: {}",
                payload.item_count(),
                P::NOUN,
                Value::Array(payload.items())
            );
        }
        self
    }

    /// Passes if any item contains `expected` as a deep subset.
    #[track_caller]
    pub fn contains(self, expected: Value) -> Self {
        let items = self.payload().items();
        if items.iter().any(|item| contains_subset(item, &expected)) {
            return self;
        }
        match items.first() {
            None => panic!(
                "Expected {} containing {}, got no {}",
                P::NOUN,
                expected,
                P::NOUN
            ),
            Some(first) => {
                let closest = find_mismatch(first, &expected)
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                panic!(
                    "Expected {} containing {}, none of {} matched (first {})",
                    P::NOUN,
                    expected,
                    items.len(),
                    closest
                )
            }
        }
    }
}

// ============================================================================
// Shared payloads
// ============================================================================

impl Inspect for QueryPayload {
    const NOUN: &'static str = "rows";

    fn item_count(&self) -> usize {
        self.rows.len()
    }

    fn items(&self) -> Vec<Value> {
        self.rows.iter().cloned().map(Value::Object).collect()
    }
}

impl<T: Serialize> Inspect for ValuePayload<T> {
    const NOUN: &'static str = "values";

    fn item_count(&self) -> usize {
        usize::from(self.has_content())
    }

    fn items(&self) -> Vec<Value> {
        self.value.iter().map(to_json).collect()
    }

    fn has_content(&self) -> bool {
        self.value.as_ref().is_some_and(|value| !to_json(value).is_null())
    }
}

impl<T: Serialize> Inspect for ListPayload<T> {
    const NOUN: &'static str = "items";

    fn item_count(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> Vec<Value> {
        self.items.iter().map(to_json).collect()
    }
}

impl Expectation<'_, QueryPayload> {
    #[track_caller]
    pub fn rows(self, expected: usize) -> Self {
        self.count(expected)
    }

    #[track_caller]
    pub fn rows_at_least(self, min: usize) -> Self {
        self.count_at_least(min)
    }

    #[track_caller]
    pub fn rows_at_most(self, max: usize) -> Self {
        self.count_at_most(max)
    }

    #[track_caller]
    pub fn row_contains(self, expected: Value) -> Self {
        self.contains(expected)
    }

    /// Driver-reported row count (rows affected for writes).
    #[track_caller]
    pub fn row_count(self, expected: u64) -> Self {
        let actual = self.payload().row_count;
        if actual != expected {
            panic!("Expected row count {}, got {}", expected, actual);
        }
        self
    }
}

impl<T> Expectation<'_, ValuePayload<T>>
where
    T: Serialize + PartialEq + Debug,
{
    #[track_caller]
    pub fn value(self, expected: &T) -> Self {
        match &self.payload().value {
            Some(actual) if actual == expected => self,
            actual => panic!("Expected value {:?}, got {:?}", expected, actual),
        }
    }

    #[track_caller]
    pub fn value_contains(self, expected: Value) -> Self {
        let payload = self.payload();
        let actual = payload.value.as_ref().map(to_json).unwrap_or(Value::Null);
        if let Some(mismatch) = find_mismatch(&actual, &expected) {
            panic!("Expected value containing {}, {}", expected, mismatch);
        }
        self
    }

    #[track_caller]
    pub fn value_match<F, E>(self, matcher: F) -> Self
    where
        F: FnOnce(Option<&T>) -> Result<(), E>,
        E: Display,
    {
        if let Err(err) = matcher(self.payload().value.as_ref()) {
            panic!("{}", err);
        }
        self
    }
}

impl<T: Serialize> Expectation<'_, ListPayload<T>> {
    #[track_caller]
    pub fn items(self, expected: usize) -> Self {
        self.count(expected)
    }

    #[track_caller]
    pub fn item_contains(self, expected: Value) -> Self {
        self.contains(expected)
    }
}

impl Expectation<'_, CountPayload> {
    #[track_caller]
    pub fn affected(self, expected: i64) -> Self {
        let actual = self.payload().count;
        if actual != expected {
            panic!("Expected {} affected, got {}", expected, actual);
        }
        self
    }
}
