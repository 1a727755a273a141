//! Canonical error taxonomy shared by every backend adapter.
//!
//! Every native failure is classified exactly once, at the boundary between a
//! driver call and result construction, into an [`Error`] carrying one
//! [`ErrorKind`] from a closed set. Higher layers (transactions, the assertion
//! engine) pass an `Error` through unchanged.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared, type-erased native error kept for diagnostics.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Native code attached to the "transaction already finished" error.
pub const TRANSACTION_FINISHED: &str = "TRANSACTION_FINISHED";

/// Backend-independent classification attached to every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The caller's timeout elapsed before the operation settled.
    Timeout,
    /// The caller's abort signal fired before the operation settled.
    Cancelled,
    /// The connection could not be established, was lost, or is no longer usable.
    Connection,
    /// The statement or request was malformed.
    QuerySyntax,
    /// A uniqueness, foreign-key, not-null or check constraint rejected the write.
    ConstraintViolation,
    /// The backend detected a deadlock and aborted this participant.
    Deadlock,
    /// A concurrent transaction invalidated this one (serialization failure).
    SerializationConflict,
    /// The addressed resource does not exist.
    NotFound,
    /// The caller is authenticated but not allowed to perform the operation.
    PermissionDenied,
    /// Quota, memory, connection or rate limits were exceeded.
    ResourceExhausted,
    /// Credentials were missing or rejected.
    Unauthenticated,
    /// The backend is temporarily unable to serve the request.
    Unavailable,
    /// The backend reported an internal fault or returned undecodable data.
    Internal,
    /// No classification rule matched.
    Unknown,
}

impl ErrorKind {
    /// Every canonical kind, in declaration order.
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::Timeout,
        ErrorKind::Cancelled,
        ErrorKind::Connection,
        ErrorKind::QuerySyntax,
        ErrorKind::ConstraintViolation,
        ErrorKind::Deadlock,
        ErrorKind::SerializationConflict,
        ErrorKind::NotFound,
        ErrorKind::PermissionDenied,
        ErrorKind::ResourceExhausted,
        ErrorKind::Unauthenticated,
        ErrorKind::Unavailable,
        ErrorKind::Internal,
        ErrorKind::Unknown,
    ];

    /// Stable kebab-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Connection => "connection",
            ErrorKind::QuerySyntax => "query-syntax",
            ErrorKind::ConstraintViolation => "constraint-violation",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::SerializationConflict => "serialization-conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether the kind represents the caller's own control decision.
    pub fn is_control(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Cancelled)
    }

    /// Whether re-running the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Deadlock
                | ErrorKind::SerializationConflict
                | ErrorKind::Unavailable
                | ErrorKind::ResourceExhausted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional backend-specific detail attached to an [`Error`].
///
/// These never widen [`ErrorKind`]; they only carry what the backend reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDetails {
    /// Native discriminant (SQLSTATE, errno, gRPC/Connect code, AMQP reply code).
    pub code: Option<String>,
    /// Name of the failed constraint, when the backend reports one.
    pub constraint: Option<String>,
    /// HTTP status code, for HTTP-borne failures.
    pub status: Option<u16>,
    /// Keys affected by the failure (e.g. KV check failures).
    pub keys: Vec<String>,
    /// Structured detail list (gRPC/Connect error details, response bodies).
    pub details: Vec<serde_json::Value>,
}

impl ErrorDetails {
    /// True when no detail field is populated.
    pub fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.constraint.is_none()
            && self.status.is_none()
            && self.keys.is_empty()
            && self.details.is_empty()
    }
}

/// Canonical error returned (or propagated) by every operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
    details: ErrorDetails,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            details: ErrorDetails::default(),
        }
    }

    /// Error produced when the caller's timeout elapsed.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    /// Error produced when the caller's abort signal fired.
    pub fn cancelled(reason: Option<&str>) -> Self {
        match reason {
            Some(reason) => Self::new(
                ErrorKind::Cancelled,
                format!("operation cancelled: {reason}"),
            ),
            None => Self::new(ErrorKind::Cancelled, "operation cancelled"),
        }
    }

    /// Error returned by any call on a committed or rolled-back transaction.
    pub fn transaction_finished(state: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::Connection,
            format!("transaction already {state}"),
        )
        .with_code(TRANSACTION_FINISHED)
    }

    /// Attach the native error this one was classified from.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attach an already shared native error.
    pub fn with_shared_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Attach the native discriminant.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.details.code = Some(code.into());
        self
    }

    /// Attach the failed constraint name.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.details.constraint = Some(constraint.into());
        self
    }

    /// Attach an HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.details.status = Some(status);
        self
    }

    /// Attach affected keys.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Append a structured detail entry.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.details.details.push(detail);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Native code, if the backend reported one.
    pub fn code(&self) -> Option<&str> {
        self.details.code.as_deref()
    }

    /// Returns true if this is the caller's timeout or cancellation.
    pub fn is_control(&self) -> bool {
        self.kind.is_control()
    }

    /// Returns true if this came from a call on a finished transaction.
    pub fn is_transaction_finished(&self) -> bool {
        self.code() == Some(TRANSACTION_FINISHED)
    }
}

/// Classification of a native error into the canonical taxonomy.
///
/// Implementations are total: they never panic and fall back to
/// [`ErrorKind::Unknown`] while keeping the native error as the cause.
pub trait Classify {
    fn classify(self) -> Error;
}

impl Classify for Error {
    fn classify(self) -> Error {
        self
    }
}

impl Classify for std::io::Error {
    fn classify(self) -> Error {
        Error::new(ErrorKind::Connection, self.to_string()).with_cause(self)
    }
}

impl Classify for std::convert::Infallible {
    fn classify(self) -> Error {
        match self {}
    }
}

/// Fallback for native errors no rule recognises.
pub fn unknown<E>(err: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::new(ErrorKind::Unknown, err.to_string()).with_cause(err)
}
