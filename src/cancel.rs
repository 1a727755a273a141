//! Cancellation composition: timeout and abort-signal handling around a
//! native in-flight operation.
//!
//! [`race`] settles exactly once. The native future, the timer and the abort
//! listener are all owned by the race; whichever loses is dropped before
//! `race` returns, so no timer or listener outlives the call. Dropping the
//! native future abandons it: whatever it would have produced is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Classify, Error};

/// Outcome of a raced operation that did not succeed.
#[derive(Debug)]
pub enum Failure<E> {
    /// Timeout or cancellation decided by the caller; already canonical.
    Control(Error),
    /// The native operation itself failed.
    Native(E),
}

impl<E: Classify> Classify for Failure<E> {
    fn classify(self) -> Error {
        match self {
            // Never reclassified: these did not originate from the backend.
            Failure::Control(error) => error,
            Failure::Native(native) => native.classify(),
        }
    }
}

// ============================================================================
// Abort signal
// ============================================================================

#[derive(Default)]
struct SignalState {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    listeners: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owner side of an abort signal.
#[derive(Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal handed to operations.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort without a reason.
    pub fn abort(&self) {
        self.signal.fire(None);
    }

    /// Abort with a human-readable reason carried into the `cancelled` error.
    pub fn abort_with(&self, reason: impl Into<String>) {
        self.signal.fire(Some(reason.into()));
    }
}

/// Observer side of an abort signal. Cheap to clone.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl AbortSignal {
    /// A signal that is already aborted.
    pub fn aborted(reason: impl Into<String>) -> Self {
        let signal = Self::default();
        signal.fire(Some(reason.into()));
        signal
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        lock(&self.state.reason).clone()
    }

    /// Number of live `on_abort` subscriptions.
    pub fn listener_count(&self) -> usize {
        lock(&self.state.listeners).len()
    }

    /// One-shot subscription resolving when the signal aborts.
    ///
    /// Subscribing to an already aborted signal resolves immediately. The
    /// subscription is removed when the returned listener is dropped.
    pub fn on_abort(&self) -> AbortListener {
        let (tx, rx) = oneshot::channel();
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = lock(&self.state.listeners);
            if self.is_aborted() {
                let _ = tx.send(());
            } else {
                listeners.insert(id, tx);
            }
        }
        AbortListener {
            state: Arc::clone(&self.state),
            id,
            rx,
        }
    }

    fn fire(&self, reason: Option<String>) {
        let drained: Vec<_> = {
            let mut listeners = lock(&self.state.listeners);
            if self.state.aborted.swap(true, Ordering::AcqRel) {
                return;
            }
            *lock(&self.state.reason) = reason;
            listeners.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(());
        }
    }
}

/// Pending `on_abort` subscription. Unregisters itself on drop.
pub struct AbortListener {
    state: Arc<SignalState>,
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl Future for AbortListener {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            // The sender lives in the registry until fired or until we drop.
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AbortListener {
    fn drop(&mut self) {
        lock(&self.state.listeners).remove(&self.id);
    }
}

// ============================================================================
// Race
// ============================================================================

/// Race a native operation against an optional timeout and abort signal.
///
/// - An already aborted signal fails immediately with `cancelled`; no timer
///   is started and the operation is never polled.
/// - Without timeout and signal this is a transparent pass-through.
/// - Otherwise the first of operation, timer and abort to settle wins.
pub async fn race<F, T, E>(
    op: F,
    timeout: Option<Duration>,
    signal: Option<&AbortSignal>,
) -> Result<T, Failure<E>>
where
    F: Future<Output = Result<T, E>>,
{
    if let Some(signal) = signal {
        if signal.is_aborted() {
            debug!("signal already aborted, operation not started");
            return Err(Failure::Control(Error::cancelled(
                signal.reason().as_deref(),
            )));
        }
    }

    if timeout.is_none() && signal.is_none() {
        return op.await.map_err(Failure::Native);
    }

    let aborted = async {
        match signal {
            Some(signal) => signal.on_abort().await,
            None => std::future::pending::<()>().await,
        }
    };
    let expired = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        settled = op => settled.map_err(Failure::Native),
        _ = aborted => {
            let reason = signal.and_then(AbortSignal::reason);
            debug!(reason = ?reason, "operation cancelled by signal");
            Err(Failure::Control(Error::cancelled(reason.as_deref())))
        }
        _ = expired => {
            let after = timeout.unwrap_or_default();
            debug!(timeout_ms = after.as_millis() as u64, "operation timed out");
            Err(Failure::Control(Error::timeout(after)))
        }
    }
}

#[cfg(test)]
mod tests;
