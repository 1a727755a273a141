//! Redis adapter.
//!
//! Commands go through a shared `ConnectionManager` (cloned per call);
//! subscriptions open a dedicated pub/sub connection each.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ToolkitConfig;
use crate::error::{Classify, Error, ErrorKind};
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{AckPayload, CountPayload, ListPayload, OpResult, ResultKind, ValuePayload};
use crate::subscription::Subscription;

/// Redis propagates failures by default.
pub const THROWS_BY_DEFAULT: bool = true;

/// Classify a Redis server error prefix (`WRONGTYPE`, `NOAUTH`, ...).
pub fn classify_redis_code(code: &str) -> ErrorKind {
    match code {
        "NOAUTH" | "WRONGPASS" => ErrorKind::Unauthenticated,
        "NOPERM" | "READONLY" => ErrorKind::PermissionDenied,
        "OOM" => ErrorKind::ResourceExhausted,
        "BUSY" | "LOADING" | "MASTERDOWN" | "TRYAGAIN" | "CLUSTERDOWN" => ErrorKind::Unavailable,
        "WRONGTYPE" | "ERR" => ErrorKind::QuerySyntax,
        "NOSCRIPT" => ErrorKind::NotFound,
        "EXECABORT" => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    }
}

impl Classify for RedisError {
    fn classify(self) -> Error {
        let kind = if self.is_timeout() {
            ErrorKind::Timeout
        } else if self.is_connection_refusal() || self.is_connection_dropped() || self.is_io_error()
        {
            ErrorKind::Connection
        } else {
            let by_code = self.code().map(classify_redis_code);
            match by_code {
                Some(kind) if kind != ErrorKind::Unknown => kind,
                _ => match self.kind() {
                    redis::ErrorKind::AuthenticationFailed => ErrorKind::Unauthenticated,
                    redis::ErrorKind::BusyLoadingError
                    | redis::ErrorKind::TryAgain
                    | redis::ErrorKind::ClusterDown
                    | redis::ErrorKind::MasterDown => ErrorKind::Unavailable,
                    redis::ErrorKind::ResponseError => ErrorKind::QuerySyntax,
                    redis::ErrorKind::NoScriptError => ErrorKind::NotFound,
                    redis::ErrorKind::ReadOnly => ErrorKind::PermissionDenied,
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::IoError => {
                        ErrorKind::Connection
                    }
                    redis::ErrorKind::TypeError | redis::ErrorKind::ParseError => {
                        ErrorKind::Internal
                    }
                    _ => ErrorKind::Unknown,
                },
            }
        };

        let mut error = Error::new(kind, self.to_string());
        if let Some(code) = self.code() {
            error = error.with_code(code);
        }
        error.with_cause(self)
    }
}

/// Message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedisMessage {
    pub channel: String,
    pub payload: String,
}

/// Redis client.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: ConnectionManager,
    defaults: ClientDefaults,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl RedisClient {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str, defaults: ClientDefaults) -> Result<Self, Error> {
        let client = Client::open(url).map_err(Classify::classify)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(Classify::classify)?;

        info!(url = %url, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            defaults,
        })
    }

    /// Connect using the `redis` section of the toolkit configuration.
    pub async fn from_config(config: &ToolkitConfig) -> Result<Self, Error> {
        let url = config
            .redis
            .url
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::Connection, "redis.url is not configured"))?;
        Self::connect(url, config.redis_defaults()).await
    }

    fn resolve(&self, call: &CallOptions) -> Resolved {
        Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT)
    }

    pub async fn get(
        &self,
        key: &str,
        call: &CallOptions,
    ) -> Result<OpResult<ValuePayload<String>>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Get, &self.resolve(call), async move {
            let value: Option<String> = conn.get(key).await?;
            Ok::<_, RedisError>(ValuePayload::new(value))
        })
        .await
    }

    /// `SET`, with an optional expiry.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Set, &self.resolve(call), async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok::<_, RedisError>(AckPayload::default())
        })
        .await
    }

    /// Delete keys; the payload counts keys that existed.
    pub async fn del(
        &self,
        keys: &[&str],
        call: &CallOptions,
    ) -> Result<OpResult<CountPayload>, Error> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        settle(ResultKind::Delete, &self.resolve(call), async move {
            let count: i64 = conn.del(keys).await?;
            Ok::<_, RedisError>(CountPayload { count })
        })
        .await
    }

    /// `INCRBY`; the payload holds the new value.
    pub async fn incr(
        &self,
        key: &str,
        by: i64,
        call: &CallOptions,
    ) -> Result<OpResult<ValuePayload<i64>>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Incr, &self.resolve(call), async move {
            let value: i64 = conn.incr(key, by).await?;
            Ok::<_, RedisError>(ValuePayload::new(Some(value)))
        })
        .await
    }

    /// `HSET` one field; the payload counts newly created fields.
    pub async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        call: &CallOptions,
    ) -> Result<OpResult<CountPayload>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Set, &self.resolve(call), async move {
            let count: i64 = conn.hset(key, field, value).await?;
            Ok::<_, RedisError>(CountPayload { count })
        })
        .await
    }

    pub async fn hget(
        &self,
        key: &str,
        field: &str,
        call: &CallOptions,
    ) -> Result<OpResult<ValuePayload<String>>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Get, &self.resolve(call), async move {
            let value: Option<String> = conn.hget(key, field).await?;
            Ok::<_, RedisError>(ValuePayload::new(value))
        })
        .await
    }

    /// `HGETALL`; a missing key yields an absent value.
    pub async fn hgetall(
        &self,
        key: &str,
        call: &CallOptions,
    ) -> Result<OpResult<ValuePayload<BTreeMap<String, String>>>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Get, &self.resolve(call), async move {
            let map: BTreeMap<String, String> = conn.hgetall(key).await?;
            let value = (!map.is_empty()).then_some(map);
            Ok::<_, RedisError>(ValuePayload::new(value))
        })
        .await
    }

    /// `LPUSH`; the payload holds the new list length.
    pub async fn lpush(
        &self,
        key: &str,
        values: &[&str],
        call: &CallOptions,
    ) -> Result<OpResult<CountPayload>, Error> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        settle(ResultKind::Set, &self.resolve(call), async move {
            let count: i64 = conn.lpush(key, values).await?;
            Ok::<_, RedisError>(CountPayload { count })
        })
        .await
    }

    /// `RPUSH`; the payload holds the new list length.
    pub async fn rpush(
        &self,
        key: &str,
        values: &[&str],
        call: &CallOptions,
    ) -> Result<OpResult<CountPayload>, Error> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        settle(ResultKind::Set, &self.resolve(call), async move {
            let count: i64 = conn.rpush(key, values).await?;
            Ok::<_, RedisError>(CountPayload { count })
        })
        .await
    }

    pub async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        call: &CallOptions,
    ) -> Result<OpResult<ListPayload<String>>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::List, &self.resolve(call), async move {
            let items: Vec<String> = conn.lrange(key, start, stop).await?;
            Ok::<_, RedisError>(ListPayload { items })
        })
        .await
    }

    /// `PUBLISH`; the payload counts receiving subscribers.
    pub async fn publish(
        &self,
        channel: &str,
        message: &str,
        call: &CallOptions,
    ) -> Result<OpResult<CountPayload>, Error> {
        let mut conn = self.conn.clone();
        settle(ResultKind::Publish, &self.resolve(call), async move {
            let count: i64 = conn.publish(channel, message).await?;
            Ok::<_, RedisError>(CountPayload { count })
        })
        .await
    }

    /// Subscribe to a channel on a dedicated connection.
    ///
    /// The subscription is active when this returns; dropping it closes the
    /// pub/sub connection.
    pub async fn subscribe(
        &self,
        channel: &str,
        call: &CallOptions,
    ) -> Result<Subscription<RedisMessage>, Error> {
        let opts = self.resolve(call);
        let client = self.client.clone();
        let pubsub = crate::cancel::race(
            async move {
                let mut pubsub = client.get_async_pubsub().await?;
                pubsub.subscribe(channel).await?;
                Ok::<_, RedisError>(pubsub)
            },
            opts.timeout,
            opts.signal.as_ref(),
        )
        .await
        .map_err(Classify::classify)?;

        debug!(channel = %channel, "subscribed to Redis channel");
        let messages = pubsub.into_on_message().map(|msg| {
            let payload: String = msg.get_payload()?;
            Ok::<_, RedisError>(RedisMessage {
                channel: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(Subscription::from_stream(channel, messages))
    }
}
