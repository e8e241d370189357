// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The traits in this module are the seam between the pub/sub layer and an
//! AMQP client. A connection owns channels; each publisher or consumer holds
//! its own channel handle. Two implementations ship with the crate: the
//! lapin-backed one in [`crate::channel`] and the in-process broker in
//! [`crate::memory`].

use crate::{
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// String-valued message headers, also used as the trace propagation carrier.
pub type Headers = BTreeMap<String, String>;

/// Stream of deliveries produced by [`BrokerChannel::basic_consume`].
///
/// The stream ends when the owning channel or connection is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Metadata carried alongside a message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
}

/// A message ready to be handed to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub mandatory: bool,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered to a consumer, pending acknowledgment.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    /// Acknowledges the delivery, removing the message from its queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    ///
    /// With `requeue` the broker puts the message back on its queue; without
    /// it the message is dead-lettered if the queue has a dead-letter exchange.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

/// Operations available on an open AMQP channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue, returning the broker's view of it.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError>;

    /// Binds a queue to an exchange under a routing key.
    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries per consumer.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Hands a message to an exchange without waiting for confirms.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), AmqpError>;

    /// Starts a manually-acknowledged consumer on a queue.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;
}

/// A connection to the broker, shared process-wide.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> Result<(), AmqpError>;
}
