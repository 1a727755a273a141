//! Atomic KV batch step definitions.

use cucumber::{given, then, when, World};
use serde_json::json;
use trialkit::backends::kv::{AtomicBuilder, KvClient, KvKey, Versionstamp};
use trialkit::{expect, AckPayload, CallOptions, OpResult};

/// Test context for atomic batch scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct KvWorld {
    kv: KvClient,
    read_version: Option<Versionstamp>,
    last_batch: Option<OpResult<AckPayload>>,
}

impl KvWorld {
    fn new() -> Self {
        Self {
            kv: KvClient::memory(),
            read_version: None,
            last_batch: None,
        }
    }

    fn batch(&self) -> &OpResult<AckPayload> {
        self.last_batch.as_ref().expect("No batch committed")
    }
}

fn key(path: &str) -> KvKey {
    KvKey::new(path.split('/'))
}

// --- Given steps ---

#[given(expr = "the key {string} holds {int}")]
async fn given_key_holds(world: &mut KvWorld, path: String, value: i64) {
    let result = world
        .kv
        .set(key(&path), json!(value), &CallOptions::new())
        .await
        .expect("Failed to seed key");
    expect(&result).ok();
}

// --- When steps ---

#[when(expr = "the key {string} is read")]
async fn when_key_read(world: &mut KvWorld, path: String) {
    let result = world
        .kv
        .get(key(&path), &CallOptions::new())
        .await
        .expect("Failed to read key");
    world.read_version = expect(&result).payload().version.clone().map(Versionstamp);
}

#[when(expr = "the key {string} is set to {int}")]
async fn when_key_set(world: &mut KvWorld, path: String, value: i64) {
    let result = world
        .kv
        .set(key(&path), json!(value), &CallOptions::new())
        .await
        .expect("Failed to set key");
    expect(&result).ok();
}

#[when(
    expr = "a batch checked against the read version sets {string} to {int} and adds {int} to {string}"
)]
async fn when_batch(world: &mut KvWorld, target: String, value: i64, delta: i64, counter: String) {
    let batch = AtomicBuilder::new()
        .check(key(&target), world.read_version.clone())
        .set(key(&target), json!(value))
        .sum(key(&counter), delta)
        .build();
    let result = world
        .kv
        .atomic(&batch, &CallOptions::new())
        .await
        .expect("Atomic commit errored");
    world.last_batch = Some(result);
}

// --- Then steps ---

#[then("the batch succeeded")]
async fn then_batch_succeeded(world: &mut KvWorld) {
    expect(world.batch()).ok();
}

#[then("the batch check failed")]
async fn then_batch_check_failed(world: &mut KvWorld) {
    expect(world.batch()).check_failed();
}

#[then(expr = "the key {string} holds {int}")]
async fn then_key_holds(world: &mut KvWorld, path: String, value: i64) {
    let result = world
        .kv
        .get(key(&path), &CallOptions::new())
        .await
        .expect("Failed to read key");
    expect(&result).ok().value(&json!(value));
}

#[then(expr = "the key {string} is absent")]
async fn then_key_absent(world: &mut KvWorld, path: String) {
    let result = world
        .kv
        .get(key(&path), &CallOptions::new())
        .await
        .expect("Failed to read key");
    expect(&result).ok().no_content();
}
