// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber
//!
//! Provisions a queue, attaches a manually-acknowledged consumer with a
//! prefetch of one and spawns a task that feeds every delivery through the
//! handler. Each subscription owns its channel and its task; the connection
//! is shared.
//!
//! The consumer loop runs until the delivery stream ends, which happens when
//! the channel or connection is closed. There is no reconnect.

use crate::{
    broker::BrokerConnection,
    codec::{BincodeCodec, Codec, JsonCodec},
    consumer::{MessageConsumer, RequeuePolicy},
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::{QueueDescriptor, QueueLifecycle},
    topology::declare_and_bind,
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Tuning for a single subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub requeue_policy: RequeuePolicy,
    /// Consumer tag announced to the broker. Generated from the queue name
    /// when absent.
    pub consumer_tag: Option<String>,
}

/// A running subscription.
#[derive(Debug)]
pub struct Subscription {
    queue: QueueDescriptor,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// The queue as reported by the broker when it was declared.
    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    /// Whether the consumer loop has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the consumer loop to end.
    pub async fn join(self) -> Result<(), AmqpError> {
        self.handle.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failure");
            AmqpError::InternalError
        })
    }
}

/// Subscribes `handler` to messages encoded with codec `C`, using the
/// default [`SubscribeOptions`].
pub async fn subscribe<C, T, H>(
    conn: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    lifecycle: QueueLifecycle,
    handler: H,
) -> Result<Subscription, AmqpError>
where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    subscribe_with::<C, T, H>(
        conn,
        exchange,
        queue_name,
        routing_key,
        lifecycle,
        handler,
        SubscribeOptions::default(),
    )
    .await
}

/// Like [`subscribe`], with explicit options.
pub async fn subscribe_with<C, T, H>(
    conn: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    lifecycle: QueueLifecycle,
    handler: H,
    opts: SubscribeOptions,
) -> Result<Subscription, AmqpError>
where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    let (channel, queue) =
        declare_and_bind(conn, exchange, queue_name, routing_key, lifecycle).await?;

    channel.basic_qos(PREFETCH_COUNT).await.map_err(|err| {
        error!(error = err.to_string(), "error to configure qos");
        err
    })?;

    let tag = opts
        .consumer_tag
        .unwrap_or_else(|| format!("{}-{}", queue.name, Uuid::new_v4()));

    let mut deliveries = match channel.basic_consume(&queue.name, &tag).await {
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            Err(err)
        }
        Ok(stream) => Ok(stream),
    }?;

    debug!("consuming queue: {} with tag: {}", queue.name, tag);

    let mut consumer = MessageConsumer::<C, T, H>::new(handler, opts.requeue_policy);
    let queue_name = queue.name.clone();

    let handle = tokio::spawn(async move {
        // the channel stays open for as long as the loop runs
        let _channel = channel;
        let tracer = global::tracer("amqp consumer");

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = consumer.consume(&tracer, &delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!("consumer for queue: {} finished", queue_name);
    });

    Ok(Subscription { queue, handle })
}

/// Subscribes a handler to JSON payloads.
pub async fn subscribe_json<T, H>(
    conn: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    lifecycle: QueueLifecycle,
    handler: H,
) -> Result<Subscription, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    subscribe::<JsonCodec, T, H>(conn, exchange, queue_name, routing_key, lifecycle, handler)
        .await
}

/// Subscribes a handler to bincode payloads.
pub async fn subscribe_bincode<T, H>(
    conn: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    lifecycle: QueueLifecycle,
    handler: H,
) -> Result<Subscription, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    subscribe::<BincodeCodec, T, H>(conn, exchange, queue_name, routing_key, lifecycle, handler)
        .await
}
