//! Redis client integration tests.
//!
//! Run with: cargo test --test storage_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::time::Duration;

use trialkit::backends::redis::RedisClient;
use trialkit::{expect, CallOptions, ClientDefaults, ErrorKind};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        &uuid::Uuid::new_v4().to_string().replace('-', "")[..8]
    )
}

async fn connect() -> RedisClient {
    println!("Connecting to: {}", redis_uri());
    RedisClient::connect(&redis_uri(), ClientDefaults::default())
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_strings_and_counters() {
    let client = connect().await;
    let prefix = test_prefix();
    let call = CallOptions::new();
    let key = format!("{}:greeting", prefix);
    let counter = format!("{}:counter", prefix);

    let missing = client.get(&key, &call).await.unwrap();
    expect(&missing).ok().no_content();

    expect(&client.set(&key, "hello", None, &call).await.unwrap()).ok();
    let found = client.get(&key, &call).await.unwrap();
    expect(&found).ok().value(&"hello".to_string());

    expect(&client.incr(&counter, 5, &call).await.unwrap())
        .ok()
        .value(&5);
    expect(&client.incr(&counter, -2, &call).await.unwrap())
        .ok()
        .value(&3);

    let deleted = client.del(&[&key, &counter, "never-set"], &call).await.unwrap();
    expect(&deleted).ok().affected(2);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_set_with_ttl_expires() {
    let client = connect().await;
    let key = format!("{}:ephemeral", test_prefix());
    let call = CallOptions::new();

    client
        .set(&key, "soon gone", Some(Duration::from_millis(100)), &call)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    expect(&client.get(&key, &call).await.unwrap()).ok().no_content();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_hashes_and_lists() {
    let client = connect().await;
    let prefix = test_prefix();
    let call = CallOptions::new();
    let hash = format!("{}:user", prefix);
    let list = format!("{}:queue", prefix);

    expect(&client.hset(&hash, "name", "Alice", &call).await.unwrap())
        .ok()
        .affected(1);
    expect(&client.hget(&hash, "name", &call).await.unwrap())
        .ok()
        .value(&"Alice".to_string());
    expect(&client.hgetall(&hash, &call).await.unwrap())
        .ok()
        .value_contains(serde_json::json!({"name": "Alice"}));

    expect(&client.rpush(&list, &["b", "c"], &call).await.unwrap())
        .ok()
        .affected(2);
    expect(&client.lpush(&list, &["a"], &call).await.unwrap())
        .ok()
        .affected(3);
    let items = client.lrange(&list, 0, -1, &call).await.unwrap();
    expect(&items).ok().items(3);
    assert_eq!(
        items.payload().unwrap().items,
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );

    client.del(&[&hash, &list], &call).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_wrong_type_is_failure_result() {
    let client = connect().await;
    let key = format!("{}:plain", test_prefix());
    let call = CallOptions::new();

    client.set(&key, "not a list", None, &call).await.unwrap();
    let result = client
        .lrange(&key, 0, -1, &CallOptions::new().throw_on_error(false))
        .await
        .unwrap();
    expect(&result).not_ok().error_contains("WRONGTYPE");

    let err = client.lrange(&key, 0, -1, &call).await.unwrap_err();
    assert_ne!(err.kind(), ErrorKind::Timeout);

    client.del(&[&key], &call).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_publish_reaches_subscriber() {
    let client = connect().await;
    let channel = format!("{}:events", test_prefix());
    let call = CallOptions::new().timeout(Duration::from_secs(5));

    let mut subscription = client.subscribe(&channel, &call).await.unwrap();

    let published = client.publish(&channel, "ping", &call).await.unwrap();
    expect(&published).ok().affected(1);

    let message = subscription
        .next_message(&call)
        .await
        .unwrap()
        .expect("subscription closed");
    assert_eq!(message.channel, channel);
    assert_eq!(message.payload, "ping");

    subscription.unsubscribe();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_subscriber_wait_times_out() {
    let client = connect().await;
    let channel = format!("{}:quiet", test_prefix());

    let mut subscription = client
        .subscribe(&channel, &CallOptions::new())
        .await
        .unwrap();
    let err = subscription
        .next_message(&CallOptions::new().timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}
