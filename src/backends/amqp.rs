//! AMQP (RabbitMQ) adapter.
//!
//! Connections come from a deadpool-lapin pool; each operation opens a fresh
//! channel. Publishes run in confirm mode and wait for the broker's ack.

use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ToolkitConfig;
use crate::error::{Classify, Error, ErrorKind};
use crate::expect::Expectation;
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{AckPayload, CountPayload, OpResult, ResultKind, ValuePayload};
use crate::subscription::Subscription;

/// AMQP propagates failures by default.
pub const THROWS_BY_DEFAULT: bool = true;

/// Classify an AMQP 0-9-1 reply code.
pub fn classify_amqp_reply_code(code: u16) -> ErrorKind {
    match code {
        311 | 506 => ErrorKind::ResourceExhausted,
        312 | 402 | 404 => ErrorKind::NotFound,
        313 | 405 => ErrorKind::Unavailable,
        320 => ErrorKind::Connection,
        403 | 530 => ErrorKind::PermissionDenied,
        406 => ErrorKind::ConstraintViolation,
        502 => ErrorKind::QuerySyntax,
        501 | 503 | 504 | 505 | 540 | 541 => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    }
}

impl Classify for lapin::Error {
    fn classify(self) -> Error {
        let message = self.to_string();
        match &self {
            lapin::Error::ProtocolError(amqp) => {
                let code = amqp.get_id();
                Error::new(classify_amqp_reply_code(code), message)
                    .with_code(code.to_string())
                    .with_cause(self)
            }
            lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidChannel(_)
            | lapin::Error::MissingHeartbeatError => {
                Error::new(ErrorKind::Connection, message).with_cause(self)
            }
            lapin::Error::ChannelsLimitReached => {
                Error::new(ErrorKind::ResourceExhausted, message).with_cause(self)
            }
            lapin::Error::ParsingError(_)
            | lapin::Error::SerialisationError(_)
            | lapin::Error::InvalidProtocolVersion(_) => {
                Error::new(ErrorKind::Internal, message).with_cause(self)
            }
            _ => Error::new(ErrorKind::Unknown, message).with_cause(self),
        }
    }
}

/// Native failure of one AMQP operation.
#[derive(Debug, thiserror::Error)]
pub enum AmqpFailure {
    #[error("connection pool: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),

    #[error("broker rejected publish to {exchange:?} with routing key {routing_key:?}")]
    Nacked {
        exchange: String,
        routing_key: String,
    },
}

impl Classify for AmqpFailure {
    fn classify(self) -> Error {
        match self {
            AmqpFailure::Amqp(err) => err.classify(),
            AmqpFailure::Pool(PoolError::Backend(err)) => err.classify(),
            AmqpFailure::Pool(PoolError::Timeout(_)) => {
                let message = self.to_string();
                Error::new(ErrorKind::ResourceExhausted, message).with_cause(self)
            }
            AmqpFailure::Pool(_) => {
                let message = self.to_string();
                Error::new(ErrorKind::Connection, message).with_cause(self)
            }
            AmqpFailure::Nacked { .. } => {
                let message = self.to_string();
                Error::new(ErrorKind::Unavailable, message).with_cause(self)
            }
        }
    }
}

/// Delivered message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmqpMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub redelivered: bool,
}

impl AmqpMessage {
    fn from_delivery(delivery: &lapin::message::Delivery) -> Self {
        Self {
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            content: delivery.data.clone(),
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string()),
            redelivered: delivery.redelivered,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.content).ok()
    }
}

/// Declared queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// AMQP client over a connection pool.
#[derive(Clone)]
pub struct AmqpClient {
    pool: Pool,
    defaults: ClientDefaults,
}

impl std::fmt::Debug for AmqpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpClient")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl AmqpClient {
    /// Create a pool for `url` and verify one connection.
    pub async fn connect(url: &str, pool_size: usize, defaults: ClientDefaults) -> Result<Self, Error> {
        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| Error::new(ErrorKind::Connection, format!("failed to create pool: {}", e)))?;

        pool.get()
            .await
            .map_err(|e| AmqpFailure::from(e).classify())?;

        info!(url = %url, pool_size, "Connected to AMQP");
        Ok(Self { pool, defaults })
    }

    /// Connect using the `amqp` section of the toolkit configuration.
    pub async fn from_config(config: &ToolkitConfig) -> Result<Self, Error> {
        let url = config
            .amqp
            .url
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::Connection, "amqp.url is not configured"))?;
        Self::connect(url, config.amqp.pool_size, config.amqp_defaults()).await
    }

    fn resolve(&self, call: &CallOptions) -> Resolved {
        Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT)
    }

    async fn channel(pool: &Pool) -> Result<Channel, AmqpFailure> {
        let conn = pool.get().await?;
        Ok(conn.create_channel().await?)
    }

    pub async fn declare_queue(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        call: &CallOptions,
    ) -> Result<OpResult<QueueInfo>, Error> {
        let pool = self.pool.clone();
        settle(ResultKind::Declare, &self.resolve(call), async move {
            let channel = Self::channel(&pool).await?;
            let declared = channel
                .queue_declare(queue, options, FieldTable::default())
                .await?;
            Ok::<_, AmqpFailure>(QueueInfo {
                name: declared.name().as_str().to_string(),
                message_count: declared.message_count(),
                consumer_count: declared.consumer_count(),
            })
        })
        .await
    }

    /// Publish and wait for the broker's confirm.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        let pool = self.pool.clone();
        settle(ResultKind::Publish, &self.resolve(call), async move {
            let channel = Self::channel(&pool).await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            let confirmation = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    BasicProperties::default(),
                )
                .await?
                .await?;
            if confirmation.is_nack() {
                return Err(AmqpFailure::Nacked {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            debug!(exchange = %exchange, routing_key = %routing_key, "published message");
            Ok::<_, AmqpFailure>(AckPayload::default())
        })
        .await
    }

    /// Publish through the default exchange straight to `queue`.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        call: &CallOptions,
    ) -> Result<OpResult<AckPayload>, Error> {
        self.publish("", queue, body, call).await
    }

    /// Fetch one message (auto-acked); an empty queue yields no content.
    pub async fn get(
        &self,
        queue: &str,
        call: &CallOptions,
    ) -> Result<OpResult<ValuePayload<AmqpMessage>>, Error> {
        let pool = self.pool.clone();
        settle(ResultKind::Consume, &self.resolve(call), async move {
            let channel = Self::channel(&pool).await?;
            let message = channel
                .basic_get(queue, BasicGetOptions { no_ack: true })
                .await?;
            Ok::<_, AmqpFailure>(ValuePayload::new(
                message.map(|message| AmqpMessage::from_delivery(&message.delivery)),
            ))
        })
        .await
    }

    /// Purge a queue; the payload counts removed messages.
    pub async fn purge(&self, queue: &str, call: &CallOptions) -> Result<OpResult<CountPayload>, Error> {
        let pool = self.pool.clone();
        settle(ResultKind::Purge, &self.resolve(call), async move {
            let channel = Self::channel(&pool).await?;
            let purged = channel
                .queue_purge(queue, QueuePurgeOptions::default())
                .await?;
            Ok::<_, AmqpFailure>(CountPayload {
                count: i64::from(purged),
            })
        })
        .await
    }

    /// Start an auto-ack consumer on `queue`.
    pub async fn consume(&self, queue: &str, call: &CallOptions) -> Result<Subscription<AmqpMessage>, Error> {
        let opts = self.resolve(call);
        let pool = self.pool.clone();
        let tag = format!("trialkit-{}", uuid::Uuid::new_v4());

        let (channel, consumer) = crate::cancel::race(
            async {
                let channel = Self::channel(&pool).await?;
                let consumer = channel
                    .basic_consume(
                        queue,
                        &tag,
                        BasicConsumeOptions {
                            no_ack: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                Ok::<_, AmqpFailure>((channel, consumer))
            },
            opts.timeout,
            opts.signal.as_ref(),
        )
        .await
        .map_err(Classify::classify)?;

        debug!(queue = %queue, consumer_tag = %tag, "started AMQP consumer");
        let messages = consumer.map(move |delivery| {
            // The channel lives as long as the stream.
            let _channel = &channel;
            delivery.map(|delivery| AmqpMessage::from_delivery(&delivery))
        });
        Ok(Subscription::from_stream(queue, messages))
    }
}

impl Expectation<'_, ValuePayload<AmqpMessage>> {
    #[track_caller]
    pub fn content_contains(self, needle: &str) -> Self {
        match &self.payload().value {
            Some(message) if message.text().contains(needle) => self,
            Some(message) => panic!(
                "Expected message content to contain {:?}, got {:?}",
                needle,
                message.text()
            ),
            None => panic!("Expected message content to contain {:?}, got no message", needle),
        }
    }

    #[track_caller]
    pub fn routing_key(self, expected: &str) -> Self {
        match &self.payload().value {
            Some(message) if message.routing_key == expected => self,
            Some(message) => panic!(
                "Expected routing key {:?}, got {:?}",
                expected, message.routing_key
            ),
            None => panic!("Expected routing key {:?}, got no message", expected),
        }
    }
}
