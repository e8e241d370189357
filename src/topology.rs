// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Provisioning
//!
//! Declares queues and binds them to pre-existing exchanges. Every queue is
//! declared with the well-known dead-letter exchange so that rejected
//! messages always end in the same poison-message sink.
//!
//! Provisioning is a one-shot call without retries: failures to open a
//! channel, declare or bind are returned unchanged. Re-running it against an
//! already provisioned broker is a no-op, so every process can provision at
//! startup.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor, QueueLifecycle},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Exchange configured as dead-letter target on every declared queue
pub const DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// Queues and bindings to install on one channel.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology installed through `channel`.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares every queue, then creates every binding.
    ///
    /// Returns the descriptors of the declared queues in registration order.
    pub async fn install(&self) -> Result<Vec<QueueDescriptor>, AmqpError> {
        let descriptors = self.install_queues().await?;
        self.binding_queues().await?;
        Ok(descriptors)
    }

    async fn install_queues(&self) -> Result<Vec<QueueDescriptor>, AmqpError> {
        let mut descriptors = Vec::with_capacity(self.queues.len());

        for def in &self.queues {
            debug!("creating queue: {}", def.name());

            let descriptor = match self.channel.queue_declare(def).await {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = def.name(),
                        "error to declare the queue"
                    );
                    Err(err)
                }
                Ok(descriptor) => Ok(descriptor),
            }?;

            debug!("queue: {} was created", descriptor.name);
            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.routing_key_pattern()
            );

            if let Err(err) = self.channel.queue_bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        Ok(())
    }
}

/// Opens a channel, declares `queue_name` with the given lifecycle and the
/// dead-letter exchange, and binds it to `exchange` under `routing_key`.
///
/// The returned channel is the one the queue was declared on; subscribers
/// consume from it.
pub async fn declare_and_bind(
    conn: &dyn BrokerConnection,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    lifecycle: QueueLifecycle,
) -> Result<(Arc<dyn BrokerChannel>, QueueDescriptor), AmqpError> {
    let channel = conn.create_channel().await?;

    let def = QueueDefinition::with_lifecycle(queue_name, lifecycle)
        .dead_letter_exchange(DEAD_LETTER_EXCHANGE);
    let binding = QueueBinding::new(queue_name)
        .exchange(exchange)
        .routing_key(routing_key);

    let mut descriptors = AmqpTopology::new(Arc::clone(&channel))
        .queue(def)
        .queue_binding(binding)
        .install()
        .await?;

    let descriptor = descriptors.pop().ok_or(AmqpError::InternalError)?;
    Ok((channel, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerChannel, MockBrokerConnection};
    use mockall::{predicate::eq, Sequence};

    fn descriptor(name: &str) -> QueueDescriptor {
        QueueDescriptor {
            name: name.to_owned(),
            message_count: 0,
            consumer_count: 0,
        }
    }

    fn connection_with(channel: MockBrokerChannel) -> MockBrokerConnection {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut conn = MockBrokerConnection::new();
        conn.expect_create_channel()
            .times(1)
            .returning(move || Ok(Arc::clone(&channel)));
        conn
    }

    #[tokio::test]
    async fn durable_queue_is_declared_then_bound() {
        let mut seq = Sequence::new();
        let mut channel = MockBrokerChannel::new();

        let expected_def = QueueDefinition::new("game_logs")
            .durable()
            .dead_letter_exchange(DEAD_LETTER_EXCHANGE);
        channel
            .expect_queue_declare()
            .with(eq(expected_def))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(descriptor(def.name())));

        let expected_binding = QueueBinding::new("game_logs")
            .exchange("peril_topic")
            .routing_key("game_logs.*");
        channel
            .expect_queue_bind()
            .with(eq(expected_binding))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let conn = connection_with(channel);
        let (_, queue) = declare_and_bind(
            &conn,
            "peril_topic",
            "game_logs",
            "game_logs.*",
            QueueLifecycle::Durable,
        )
        .await
        .unwrap();

        assert_eq!(queue, descriptor("game_logs"));
    }

    #[tokio::test]
    async fn transient_queue_carries_dead_letter_exchange() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_declare()
            .withf(|def| {
                def.is_exclusive()
                    && def.is_auto_delete()
                    && !def.is_durable()
                    && def.dead_letter_exchange_name() == Some(DEAD_LETTER_EXCHANGE)
            })
            .returning(|def| Ok(descriptor(def.name())));
        channel.expect_queue_bind().returning(|_| Ok(()));

        let conn = connection_with(channel);
        let result = declare_and_bind(
            &conn,
            "peril_direct",
            "pause.alice",
            "pause",
            QueueLifecycle::Transient,
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn declare_error_is_returned_unchanged_and_nothing_is_bound() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_queue_declare().times(1).returning(|def| {
            Err(AmqpError::DeclareQueueError(
                def.name().to_owned(),
                "PRECONDITION_FAILED".to_owned(),
            ))
        });
        channel.expect_queue_bind().never();

        let conn = connection_with(channel);
        let result =
            declare_and_bind(&conn, "peril_topic", "war", "war.*", QueueLifecycle::Durable).await;

        assert_eq!(
            result.err(),
            Some(AmqpError::DeclareQueueError(
                "war".to_owned(),
                "PRECONDITION_FAILED".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn bind_error_is_returned_unchanged() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_declare()
            .returning(|def| Ok(descriptor(def.name())));
        channel.expect_queue_bind().returning(|b| {
            Err(AmqpError::BindingExchangeToQueueError(
                b.exchange_name().to_owned(),
                b.queue_name().to_owned(),
            ))
        });

        let conn = connection_with(channel);
        let result =
            declare_and_bind(&conn, "missing", "war", "war.*", QueueLifecycle::Durable).await;

        assert_eq!(
            result.err(),
            Some(AmqpError::BindingExchangeToQueueError(
                "missing".to_owned(),
                "war".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn channel_error_is_returned_unchanged() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_create_channel()
            .returning(|| Err(AmqpError::ChannelError));

        let result = declare_and_bind(
            &conn,
            "peril_direct",
            "pause.bob",
            "pause",
            QueueLifecycle::Transient,
        )
        .await;

        assert_eq!(result.err(), Some(AmqpError::ChannelError));
    }
}
