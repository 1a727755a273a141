//! Uniform operation-result envelope.
//!
//! Every adapter operation settles into an [`OpResult`]: the operation category
//! ([`ResultKind`]), the elapsed time from dispatch to settlement, and exactly
//! one [`Outcome`]. Payload and error can never both be present, and the kind
//! never changes once the result is built.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// Operation category, stable across success and failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Get,
    Set,
    Delete,
    Incr,
    List,
    Query,
    Execute,
    Request,
    Call,
    Publish,
    Consume,
    Declare,
    Purge,
    Atomic,
    Commit,
    Rollback,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Get => "get",
            ResultKind::Set => "set",
            ResultKind::Delete => "delete",
            ResultKind::Incr => "incr",
            ResultKind::List => "list",
            ResultKind::Query => "query",
            ResultKind::Execute => "execute",
            ResultKind::Request => "request",
            ResultKind::Call => "call",
            ResultKind::Publish => "publish",
            ResultKind::Consume => "consume",
            ResultKind::Declare => "declare",
            ResultKind::Purge => "purge",
            ResultKind::Atomic => "atomic",
            ResultKind::Commit => "commit",
            ResultKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operation settled.
///
/// `CheckFailed` is the expected, non-erroneous negative outcome of an
/// optimistic-concurrency check; it is distinct from `Failure`, which always
/// carries a classified [`Error`].
#[derive(Debug, Clone)]
pub enum Outcome<P> {
    Success(P),
    CheckFailed,
    Failure(Error),
}

/// Result of one adapter operation.
#[derive(Debug, Clone)]
pub struct OpResult<P> {
    kind: ResultKind,
    duration: Duration,
    outcome: Outcome<P>,
}

impl<P> OpResult<P> {
    /// Build a success result.
    pub fn success(kind: ResultKind, payload: P, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            outcome: Outcome::Success(payload),
        }
    }

    /// Build a failure result from an already classified error.
    pub fn failure(kind: ResultKind, error: Error, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            outcome: Outcome::Failure(error),
        }
    }

    /// Build a result for a version check that did not hold.
    pub fn check_failed(kind: ResultKind, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            outcome: Outcome::CheckFailed,
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// True only for [`Outcome::Success`].
    pub fn ok(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn is_check_failed(&self) -> bool {
        matches!(self.outcome, Outcome::CheckFailed)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Elapsed time in (fractional) milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }

    pub fn outcome(&self) -> &Outcome<P> {
        &self.outcome
    }

    pub fn payload(&self) -> Option<&P> {
        match &self.outcome {
            Outcome::Success(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<P> {
        match self.outcome {
            Outcome::Success(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_error(self) -> Option<Error> {
        match self.outcome {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Transform the payload, keeping kind, duration and any error.
    pub fn map<Q, F>(self, f: F) -> OpResult<Q>
    where
        F: FnOnce(P) -> Q,
    {
        let outcome = match self.outcome {
            Outcome::Success(payload) => Outcome::Success(f(payload)),
            Outcome::CheckFailed => Outcome::CheckFailed,
            Outcome::Failure(error) => Outcome::Failure(error),
        };
        OpResult {
            kind: self.kind,
            duration: self.duration,
            outcome,
        }
    }
}

// ============================================================================
// Shared payloads
// ============================================================================

/// Get-style payload: a single value that may legitimately be absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValuePayload<T> {
    pub value: Option<T>,
    /// Version token of the stored value, for backends that track one.
    pub version: Option<String>,
}

impl<T> ValuePayload<T> {
    pub fn new(value: Option<T>) -> Self {
        Self {
            value,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Count of affected or returned items (deleted keys, list length, receivers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountPayload {
    pub count: i64,
}

/// Ordered collection of items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListPayload<T> {
    pub items: Vec<T>,
}

/// Acknowledgement with an optional version token (writes, publishes, commits).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AckPayload {
    pub version: Option<String>,
}

/// One SQL row, keyed by column name.
pub type Row = Map<String, Value>;

/// Rows and counters returned by a SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryPayload {
    pub rows: Vec<Row>,
    /// Rows returned for reads, rows affected for writes.
    pub row_count: u64,
    pub last_insert_id: Option<i64>,
}

impl QueryPayload {
    /// Payload for a statement that returned rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            row_count: rows.len() as u64,
            rows,
            last_insert_id: None,
        }
    }

    /// Payload for a statement that only affected rows.
    pub fn affected(row_count: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows: Vec::new(),
            row_count,
            last_insert_id,
        }
    }

    /// First row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Values of one column across all rows (missing cells become `null`).
    pub fn column(&self, name: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| row.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Flat string map, used for headers and metadata.
pub type StringMap = BTreeMap<String, String>;
