// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! lapin-backed implementations of [`BrokerConnection`], [`BrokerChannel`]
//! and [`DeliveryAcker`]. One [`LapinConnection`] is shared by the process;
//! every publisher and subscriber opens its own channel on it.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Delivery, DeliveryAcker, DeliveryStream, Headers,
        MessageProperties, OutboundMessage,
    },
    config::Configs,
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Reply code sent to the broker on a normal connection close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ connection backed by lapin.
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    /// Connects to RabbitMQ using the address and credentials in `cfg`.
    ///
    /// The application name is used as the connection name shown by the
    /// broker's management tools.
    pub async fn connect(cfg: &Configs) -> Result<LapinConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app.name.clone()));

        let conn = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(LapinConnection { conn })
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing connection")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError
            })
    }
}

/// RabbitMQ channel backed by lapin.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    /// Wraps an open lapin channel.
    pub fn new(channel: Channel) -> LapinChannel {
        LapinChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let args: BTreeMap<ShortString, AMQPValue> = def
            .arguments()
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect();

        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(
                    def.name().to_owned(),
                    err.to_string(),
                ))
            }
            Ok(queue) => Ok(QueueDescriptor {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.routing_key_pattern(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    immediate: false,
                },
                &message.data,
                to_amqp_properties(&message.properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(from_lapin_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_amqp_properties(&delivery.properties),
        data: delivery.data,
        acker: Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut amqp = BasicProperties::default().with_headers(FieldTable::from(headers));
    if let Some(content_type) = &props.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &props.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id.clone()));
    }
    amqp
}

fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = Headers::new();

    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                _ => continue,
            };
            headers.insert(key.to_string(), value);
        }
    }

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        headers,
    }
}
