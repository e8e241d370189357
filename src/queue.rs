// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing how a queue is declared and bound. A queue is declared
//! with one of two lifecycle profiles: durable queues survive broker restarts
//! and are shared by name, transient queues belong to the declaring
//! connection and disappear with it.

use std::collections::BTreeMap;

/// Queue argument naming the exchange that receives rejected messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Durability and lifetime of a declared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLifecycle {
    /// `durable=true`, `auto_delete=false`, `exclusive=false`
    Durable,
    /// `durable=false`, `auto_delete=true`, `exclusive=true`
    Transient,
}

/// Definition of a queue with its declaration parameters.
///
/// Two definitions are equivalent, and redeclaring one over the other is a
/// no-op, only when every flag and argument matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: BTreeMap<String, String>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition with no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Creates a definition with the flags of the given lifecycle profile.
    pub fn with_lifecycle(name: &str, lifecycle: QueueLifecycle) -> QueueDefinition {
        let def = QueueDefinition::new(name);
        match lifecycle {
            QueueLifecycle::Durable => def.durable(),
            QueueLifecycle::Transient => def.delete().exclusive(),
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Routes rejected messages to `exchange` instead of dropping them.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            exchange.to_owned(),
        );
        self
    }

    /// Overrides the routing key used for dead-lettered messages.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
            key.to_owned(),
        );
        self
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the queue is deleted once it is no longer used.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// Whether the queue belongs to the declaring connection only.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Extra declaration arguments, such as dead-letter settings.
    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    /// Exchange receiving messages rejected without requeue, if any.
    pub fn dead_letter_exchange_name(&self) -> Option<&str> {
        self.arguments
            .get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
            .map(String::as_str)
    }

    /// Routing key override used when dead-lettering, if any.
    pub fn dead_letter_routing_key_name(&self) -> Option<&str> {
        self.arguments
            .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .map(String::as_str)
    }
}

/// Binding of a queue to an exchange under a routing key.
///
/// Routing keys may carry wildcard segments only when the exchange is a
/// topic exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`; exchange and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange the queue is bound to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the binding key, a pattern on topic exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Name of the bound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Name of the exchange the queue is bound to.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Binding key matched against routing keys on publish.
    pub fn routing_key_pattern(&self) -> &str {
        &self.routing_key
    }
}

/// The broker's answer to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
