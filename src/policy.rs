//! Per-call options, option precedence, and the shared operation pipeline.
//!
//! Every option is resolved by the same explicit rule: the per-call value
//! wins, then the per-client default (from configuration), then the backend's
//! built-in default. `settle` runs one native call through cancellation
//! composition, classification and the throw policy.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::{race, AbortSignal, Failure};
use crate::error::{Classify, Error};
use crate::result::{OpResult, ResultKind};
use crate::utils::retry::RetryConfig;

/// Options accepted by every operation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
    pub throw_on_error: Option<bool>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }
}

/// Per-client defaults, typically built from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientDefaults {
    pub timeout: Option<Duration>,
    pub throw_on_error: Option<bool>,
    /// Accepted and exposed to callers; the toolkit never retries on its own.
    pub retry: Option<RetryConfig>,
}

impl ClientDefaults {
    /// Layer `over` on top of `self`; fields set in `over` win.
    pub fn overlay(&self, over: &ClientDefaults) -> ClientDefaults {
        ClientDefaults {
            timeout: resolve_optional(over.timeout, self.timeout),
            throw_on_error: resolve_optional(over.throw_on_error, self.throw_on_error),
            retry: over.retry.clone().or_else(|| self.retry.clone()),
        }
    }
}

/// First defined of per-call and per-client values, else the backend default.
pub fn resolve<T>(call: Option<T>, client: Option<T>, backend: T) -> T {
    call.or(client).unwrap_or(backend)
}

/// Like [`resolve`] for options without a backend default.
pub fn resolve_optional<T>(call: Option<T>, client: Option<T>) -> Option<T> {
    call.or(client)
}

/// Options after precedence resolution, ready for one call.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
    pub throw_on_error: bool,
}

impl Resolved {
    /// Resolve `call` against client defaults and the backend's throw default.
    ///
    /// - `timeout`: call, then client; no backend default (wait indefinitely).
    /// - `throw_on_error`: call, then client, then `backend_throws`.
    /// - `signal`: per-call only.
    pub fn new(call: &CallOptions, client: &ClientDefaults, backend_throws: bool) -> Self {
        Self {
            timeout: resolve_optional(call.timeout, client.timeout),
            signal: call.signal.clone(),
            throw_on_error: resolve(call.throw_on_error, client.throw_on_error, backend_throws),
        }
    }
}

/// Run one native operation through the full pipeline.
///
/// Returns `Err` for timeout/cancellation (always) and for classified backend
/// failures when the resolved policy throws; otherwise a failure result.
pub async fn settle<F, P, E>(kind: ResultKind, opts: &Resolved, op: F) -> Result<OpResult<P>, Error>
where
    F: Future<Output = Result<P, E>>,
    E: Classify,
{
    settle_checked(kind, opts, async move { op.await.map(Some) }).await
}

/// Like [`settle`] for operations with a version check: `Ok(None)` from the
/// native call means the check did not hold and yields a check-failed result.
pub async fn settle_checked<F, P, E>(
    kind: ResultKind,
    opts: &Resolved,
    op: F,
) -> Result<OpResult<P>, Error>
where
    F: Future<Output = Result<Option<P>, E>>,
    E: Classify,
{
    let started = Instant::now();
    let settled = race(op, opts.timeout, opts.signal.as_ref()).await;
    let duration = started.elapsed();
    let duration_ms = duration.as_millis() as u64;

    match settled {
        Ok(Some(payload)) => {
            debug!(kind = %kind, duration_ms, "operation succeeded");
            Ok(OpResult::success(kind, payload, duration))
        }
        Ok(None) => {
            debug!(kind = %kind, duration_ms, "operation check failed");
            Ok(OpResult::check_failed(kind, duration))
        }
        Err(Failure::Control(error)) => {
            debug!(kind = %kind, duration_ms, error = %error, "operation interrupted");
            Err(error)
        }
        Err(Failure::Native(native)) => {
            let error = native.classify();
            warn!(
                kind = %kind,
                duration_ms,
                error_kind = %error.kind(),
                error = %error.message(),
                "operation failed"
            );
            if opts.throw_on_error {
                Err(error)
            } else {
                Ok(OpResult::failure(kind, error, duration))
            }
        }
    }
}
