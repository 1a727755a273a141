//! In-memory KV driver.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{AtomicBatch, KvDriver, KvEntry, KvKey, Mutation, Versionstamp};
use crate::error::{Error, ErrorKind};

#[derive(Debug, Default)]
struct Store {
    entries: BTreeMap<KvKey, (Value, Versionstamp)>,
    clock: u64,
}

/// In-process KV store; every commit advances a global versionstamp.
#[derive(Debug, Default)]
pub struct MemoryKv {
    store: RwLock<Store>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn entry(key: &KvKey, value: &Value, versionstamp: &Versionstamp) -> KvEntry {
    KvEntry {
        key: key.clone(),
        value: value.clone(),
        versionstamp: versionstamp.clone(),
    }
}

#[async_trait]
impl KvDriver for MemoryKv {
    async fn get(&self, key: &KvKey) -> Result<Option<KvEntry>, Error> {
        let store = self.store.read().await;
        Ok(store
            .entries
            .get(key)
            .map(|(value, versionstamp)| entry(key, value, versionstamp)))
    }

    async fn list(&self, prefix: &KvKey, limit: Option<usize>) -> Result<Vec<KvEntry>, Error> {
        let store = self.store.read().await;
        let matching = store
            .entries
            .range(prefix.clone()..)
            .skip_while(|(key, _)| *key == prefix)
            .take_while(|(key, _)| key.has_prefix(prefix))
            .map(|(key, (value, versionstamp))| entry(key, value, versionstamp));
        Ok(match limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn commit(&self, batch: &AtomicBatch) -> Result<Option<Versionstamp>, Error> {
        let mut store = self.store.write().await;

        let failed: Vec<String> = batch
            .checks()
            .iter()
            .filter(|check| {
                let current = store.entries.get(&check.key).map(|(_, v)| v);
                current != check.versionstamp.as_ref()
            })
            .map(|check| check.key.to_string())
            .collect();
        if !failed.is_empty() {
            debug!(keys = ?failed, "atomic check failed");
            return Ok(None);
        }

        // Stage every mutation first so a rejected sum leaves the store untouched.
        let mut staged: BTreeMap<KvKey, Option<Value>> = BTreeMap::new();
        for mutation in batch.mutations() {
            match mutation {
                Mutation::Set { key, value } => {
                    staged.insert(key.clone(), Some(value.clone()));
                }
                Mutation::Delete { key } => {
                    staged.insert(key.clone(), None);
                }
                Mutation::Sum { key, delta } => {
                    let current = match staged.get(key) {
                        Some(staged) => staged.clone(),
                        None => store.entries.get(key).map(|(value, _)| value.clone()),
                    };
                    let base = match current {
                        None => 0,
                        Some(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap_or_default(),
                        Some(other) => {
                            return Err(Error::new(
                                ErrorKind::ConstraintViolation,
                                format!("cannot sum into non-integer value {}", other),
                            )
                            .with_keys([key.to_string()]));
                        }
                    };
                    let total = base.checked_add(*delta).ok_or_else(|| {
                        Error::new(ErrorKind::ConstraintViolation, "sum overflows i64")
                            .with_keys([key.to_string()])
                    })?;
                    staged.insert(key.clone(), Some(Value::from(total)));
                }
            }
        }

        store.clock += 1;
        let versionstamp = Versionstamp::from_counter(store.clock);
        for (key, value) in staged {
            match value {
                Some(value) => {
                    store.entries.insert(key, (value, versionstamp.clone()));
                }
                None => {
                    store.entries.remove(&key);
                }
            }
        }

        Ok(Some(versionstamp))
    }
}
