//! Key-value store adapter with versionstamped entries and atomic batches.
//!
//! Drivers implement [`KvDriver`]; [`MemoryKv`] is the in-process driver.
//! Atomic operations are assembled with the by-value [`AtomicBuilder`] into an
//! immutable [`AtomicBatch`] that is committed in one call. A failed version
//! check settles as a check-failed result, not an error.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::policy::{settle, settle_checked, CallOptions, ClientDefaults, Resolved};
use crate::result::{AckPayload, ListPayload, OpResult, ResultKind, ValuePayload};

mod memory;

pub use memory::MemoryKv;

/// KV operations propagate failures by default.
pub const THROWS_BY_DEFAULT: bool = true;

/// Hierarchical key, ordered part by part.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct KvKey(pub Vec<String>);

impl KvKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// True when `prefix` is a strict prefix of this key.
    pub fn has_prefix(&self, prefix: &KvKey) -> bool {
        self.0.len() > prefix.0.len() && self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl<const N: usize> From<[&str; N]> for KvKey {
    fn from(parts: [&str; N]) -> Self {
        KvKey::new(parts)
    }
}

impl From<Vec<String>> for KvKey {
    fn from(parts: Vec<String>) -> Self {
        KvKey(parts)
    }
}

/// Opaque, monotonically increasing commit version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Versionstamp(pub String);

impl Versionstamp {
    /// 20 hex digits, zero padded, so lexical and numeric order agree.
    pub fn from_counter(counter: u64) -> Self {
        Versionstamp(format!("{:020x}", counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KvEntry {
    pub key: KvKey,
    pub value: Value,
    pub versionstamp: Versionstamp,
}

// ============================================================================
// Atomic batches
// ============================================================================

/// Version check: the key's current versionstamp must equal `versionstamp`
/// (`None` requires the key to be absent).
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicCheck {
    pub key: KvKey,
    pub versionstamp: Option<Versionstamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set { key: KvKey, value: Value },
    Delete { key: KvKey },
    /// Add `delta` to an integer value; an absent key counts as zero.
    Sum { key: KvKey, delta: i64 },
}

impl Mutation {
    pub fn key(&self) -> &KvKey {
        match self {
            Mutation::Set { key, .. } | Mutation::Delete { key } | Mutation::Sum { key, .. } => key,
        }
    }
}

/// Immutable, ordered set of checks and mutations committed as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomicBatch {
    checks: Vec<AtomicCheck>,
    mutations: Vec<Mutation>,
}

impl AtomicBatch {
    pub fn checks(&self) -> &[AtomicCheck] {
        &self.checks
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.mutations.is_empty()
    }
}

/// Builder for [`AtomicBatch`]; each step consumes and returns the builder.
///
/// ```rust,ignore
/// let batch = AtomicBuilder::new()
///     .check(["accounts", "a"], entry.versionstamp.clone())
///     .set(["accounts", "a"], json!(90))
///     .sum(["stats", "transfers"], 1)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct AtomicBuilder {
    batch: AtomicBatch,
}

impl AtomicBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(mut self, key: impl Into<KvKey>, versionstamp: Option<Versionstamp>) -> Self {
        self.batch.checks.push(AtomicCheck {
            key: key.into(),
            versionstamp,
        });
        self
    }

    pub fn set(mut self, key: impl Into<KvKey>, value: Value) -> Self {
        self.batch.mutations.push(Mutation::Set {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<KvKey>) -> Self {
        self.batch.mutations.push(Mutation::Delete { key: key.into() });
        self
    }

    pub fn sum(mut self, key: impl Into<KvKey>, delta: i64) -> Self {
        self.batch.mutations.push(Mutation::Sum {
            key: key.into(),
            delta,
        });
        self
    }

    pub fn build(self) -> AtomicBatch {
        self.batch
    }
}

// ============================================================================
// Driver contract
// ============================================================================

/// Storage primitives a KV backend provides.
#[async_trait]
pub trait KvDriver: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<KvEntry>, Error>;

    /// Entries strictly under `prefix`, in key order.
    async fn list(&self, prefix: &KvKey, limit: Option<usize>) -> Result<Vec<KvEntry>, Error>;

    /// Apply `batch` atomically.
    ///
    /// Returns `Ok(None)` without applying anything when a check fails.
    async fn commit(&self, batch: &AtomicBatch) -> Result<Option<Versionstamp>, Error>;
}

// ============================================================================
// Client
// ============================================================================

/// KV client over any driver.
#[derive(Clone)]
pub struct KvClient {
    driver: Arc<dyn KvDriver>,
    defaults: ClientDefaults,
}

impl fmt::Debug for KvClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvClient")
            .field("defaults", &self.defaults)
            .finish()
    }
}

fn ack(version: Versionstamp) -> AckPayload {
    AckPayload {
        version: Some(version.0),
    }
}

impl KvClient {
    pub fn new(driver: impl KvDriver + 'static, defaults: ClientDefaults) -> Self {
        Self {
            driver: Arc::new(driver),
            defaults,
        }
    }

    /// Client over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(MemoryKv::new(), ClientDefaults::default())
    }

    fn resolve(&self, call: &CallOptions) -> Resolved {
        Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT)
    }

    /// Read one key; the payload version is the entry's versionstamp.
    pub async fn get(
        &self,
        key: impl Into<KvKey>,
        call: &CallOptions,
    ) -> Result<OpResult<ValuePayload<Value>>, Error> {
        let key = key.into();
        settle(ResultKind::Get, &self.resolve(call), async {
            let entry = self.driver.get(&key).await?;
            Ok::<_, Error>(match entry {
                Some(entry) => ValuePayload::new(Some(entry.value)).with_version(entry.versionstamp.0),
                None => ValuePayload::new(None),
            })
        })
        .await
    }

    pub async fn set(
        &self,
        key: impl Into<KvKey>,
        value: Value,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        let batch = AtomicBuilder::new().set(key, value).build();
        self.commit_unchecked(ResultKind::Set, batch, call).await
    }

    pub async fn delete(
        &self,
        key: impl Into<KvKey>,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        let batch = AtomicBuilder::new().delete(key).build();
        self.commit_unchecked(ResultKind::Delete, batch, call).await
    }

    pub async fn list(
        &self,
        prefix: impl Into<KvKey>,
        limit: Option<usize>,
        call: &CallOptions,
    ) -> Result<OpResult<ListPayload<KvEntry>>, Error> {
        let prefix = prefix.into();
        settle(ResultKind::List, &self.resolve(call), async {
            let items = self.driver.list(&prefix, limit).await?;
            Ok::<_, Error>(ListPayload { items })
        })
        .await
    }

    /// Commit an atomic batch. A failed check yields a check-failed result.
    pub async fn atomic(
        &self,
        batch: &AtomicBatch,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        settle_checked(ResultKind::Atomic, &self.resolve(call), async {
            let committed = self.driver.commit(batch).await?;
            Ok::<_, Error>(committed.map(ack))
        })
        .await
    }

    async fn commit_unchecked(
        &self,
        kind: ResultKind,
        batch: AtomicBatch,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        settle_checked(kind, &self.resolve(call), async {
            let committed = self.driver.commit(&batch).await?;
            Ok::<_, Error>(committed.map(ack))
        })
        .await
    }
}
