//! One-shot transaction state machine over a reserved backend connection.
//!
//! ```text
//! Active ──commit()──▶ Committed
//!    └────rollback()─▶ RolledBack
//! ```
//!
//! The transaction owns its connection exclusively until it reaches a
//! terminal state, at which point the connection is released exactly once.
//! Calls in a terminal state fail with [`Error::transaction_finished`]
//! without touching the (possibly reused) connection.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::race;
use crate::error::{Classify, Error};
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{AckPayload, OpResult, QueryPayload, ResultKind};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        })
    }
}

/// Isolation level requested when the transaction opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Standard SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options applied when a transaction opens.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation: Option<IsolationLevel>,
    /// Timeout and signal for reserving the connection and issuing `BEGIN`.
    pub call: CallOptions,
    /// Client defaults inherited by statements, commit and rollback.
    pub defaults: ClientDefaults,
    /// Backend built-in throw policy for statements.
    pub backend_throws: bool,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self {
            backend_throws: true,
            ..Self::default()
        }
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn call(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }
}

// ============================================================================
// Driver contracts
// ============================================================================

/// A single backend connection checked out for the duration of a transaction.
#[async_trait]
pub trait ReservedConnection: Send {
    type Error: Classify + Send;

    /// Open the transaction; the isolation level applies before any statement.
    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<(), Self::Error>;

    /// Execute one statement inside the open transaction.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryPayload, Self::Error>;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Hand the connection back to its pool or owner.
    fn release(&mut self);
}

/// Something that can reserve connections (typically a pool).
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    type Connection: ReservedConnection;

    async fn reserve(
        &self,
    ) -> Result<Self::Connection, <Self::Connection as ReservedConnection>::Error>;
}

// ============================================================================
// Transaction
// ============================================================================

/// Transaction handle bound to one reserved connection.
pub struct Transaction<C: ReservedConnection> {
    conn: Option<C>,
    state: TransactionState,
    defaults: ClientDefaults,
    backend_throws: bool,
}

impl<C: ReservedConnection> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("holds_connection", &self.conn.is_some())
            .finish()
    }
}

impl<C: ReservedConnection> Transaction<C> {
    /// Open a transaction on a reserved connection.
    ///
    /// If `BEGIN` fails the connection is released before the error returns.
    pub async fn begin(mut conn: C, options: &TransactionOptions) -> Result<Self, Error> {
        let opened = race(
            conn.begin(options.isolation),
            options.call.timeout,
            options.call.signal.as_ref(),
        )
        .await;

        if let Err(failure) = opened {
            conn.release();
            return Err(failure.classify());
        }

        debug!(isolation = ?options.isolation, "transaction opened");
        Ok(Self {
            conn: Some(conn),
            state: TransactionState::Active,
            defaults: options.defaults.clone(),
            backend_throws: options.backend_throws,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    fn active_conn(&mut self) -> Result<&mut C, Error> {
        match (self.state, self.conn.as_mut()) {
            (TransactionState::Active, Some(conn)) => Ok(conn),
            (state, _) => Err(Error::transaction_finished(state)),
        }
    }

    /// Execute a statement. Failures follow the throw policy and leave the
    /// transaction active.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        call: &CallOptions,
    ) -> Result<OpResult<QueryPayload>, Error> {
        let opts = Resolved::new(call, &self.defaults, self.backend_throws);
        let conn = self.active_conn()?;
        settle(ResultKind::Query, &opts, conn.execute(sql, params)).await
    }

    /// Commit and release the connection, bounded by the client defaults.
    ///
    /// The connection is released whether or not the commit succeeds; a failed
    /// commit leaves the transaction rolled back.
    pub async fn commit(&mut self) -> Result<OpResult<AckPayload>, Error> {
        self.commit_with(&CallOptions::new()).await
    }

    /// Commit under explicit call options. A timeout or abort still finishes
    /// the transaction; the backend discards the interrupted connection.
    pub async fn commit_with(
        &mut self,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        let opts = Resolved::new(call, &self.defaults, true);
        let started = Instant::now();
        let conn = self.active_conn()?;
        let committed = race(conn.commit(), opts.timeout, opts.signal.as_ref()).await;
        self.finish(match committed {
            Ok(()) => TransactionState::Committed,
            Err(_) => TransactionState::RolledBack,
        });
        committed.map_err(Classify::classify)?;
        Ok(OpResult::success(
            ResultKind::Commit,
            AckPayload::default(),
            started.elapsed(),
        ))
    }

    /// Roll back and release the connection, bounded by the client defaults.
    pub async fn rollback(&mut self) -> Result<OpResult<AckPayload>, Error> {
        self.rollback_with(&CallOptions::new()).await
    }

    pub async fn rollback_with(
        &mut self,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        let opts = Resolved::new(call, &self.defaults, true);
        let started = Instant::now();
        let conn = self.active_conn()?;
        let rolled_back = race(conn.rollback(), opts.timeout, opts.signal.as_ref()).await;
        self.finish(TransactionState::RolledBack);
        rolled_back.map_err(Classify::classify)?;
        Ok(OpResult::success(
            ResultKind::Rollback,
            AckPayload::default(),
            started.elapsed(),
        ))
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        if let Some(mut conn) = self.conn.take() {
            conn.release();
        }
        debug!(state = %state, "transaction finished");
    }
}

impl<C: ReservedConnection> Drop for Transaction<C> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            warn!("transaction dropped while active; releasing connection without commit");
            conn.release();
        }
    }
}

/// Run `f` inside a transaction: commit if it returns `Ok`, roll back if it
/// returns `Err`. The connection is released exactly once on either path.
///
/// ```rust,ignore
/// let total = run_in_transaction(&client, TransactionOptions::new(), |tx| {
///     Box::pin(async move {
///         tx.query("UPDATE accounts SET balance = balance - 10 WHERE id = 1", &[], &CallOptions::new()).await?;
///         tx.query("UPDATE accounts SET balance = balance + 10 WHERE id = 2", &[], &CallOptions::new()).await?;
///         Ok(2)
///     })
/// })
/// .await?;
/// ```
pub async fn run_in_transaction<S, T, F>(
    source: &S,
    options: TransactionOptions,
    f: F,
) -> Result<T, Error>
where
    S: ConnectionSource,
    F: for<'t> FnOnce(&'t mut Transaction<S::Connection>) -> BoxFuture<'t, Result<T, Error>>,
{
    let conn = race(
        source.reserve(),
        options.call.timeout,
        options.call.signal.as_ref(),
    )
    .await
    .map_err(Classify::classify)?;

    let mut tx = Transaction::begin(conn, &options).await?;

    match f(&mut tx).await {
        Ok(value) => {
            if tx.is_active() {
                tx.commit().await?;
            }
            Ok(value)
        }
        Err(error) => {
            if tx.is_active() {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "rollback after failed transaction body also failed");
                }
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests;
