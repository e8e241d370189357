// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living inside the process, implementing the same
//! [`BrokerConnection`] / [`BrokerChannel`] seams as the lapin client. It
//! follows RabbitMQ semantics closely enough to exercise the pub/sub layer
//! without a server:
//!
//! - direct, topic and fanout routing through declared exchanges, plus the
//!   default exchange that routes by queue name
//! - idempotent queue declaration, with conflicting redeclaration rejected
//! - exclusive queues locked to their connection and deleted when it closes
//! - auto-delete queues removed once their last consumer is gone; a consumer
//!   whose stream was dropped is noticed on the next dispatch to it
//! - prefetch-bounded, round-robin dispatch to manual-ack consumers
//! - requeue on nack, dead-lettering through `x-dead-letter-exchange`
//! - closing a connection ends its consumer streams and requeues their
//!   unacknowledged deliveries
//!
//! Exchanges are not part of the channel API and must be created up front
//! with [`MemoryBroker::declare_exchange`].

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Delivery, DeliveryAcker, DeliveryStream,
        MessageProperties, OutboundMessage,
    },
    errors::AmqpError,
    exchange::ExchangeKind,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::debug;

/// Header recording the queue a message was first dead-lettered from
pub const HEADER_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Header recording why a message was first dead-lettered
pub const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";
/// Header recording the exchange a dead-lettered message was published to
pub const HEADER_FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";

/// A message held by a queue of the in-process broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

type SharedState = Arc<Mutex<BrokerState>>;
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

struct ConsumerState {
    id: u64,
    connection_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: DeliverySender,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer_id: u64,
    message: BrokerMessage,
}

struct QueueState {
    def: QueueDefinition,
    owner: Option<u64>,
    ready: VecDeque<BrokerMessage>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    had_consumers: bool,
}

impl QueueState {
    fn new(def: QueueDefinition, connection_id: u64) -> QueueState {
        let owner = def.is_exclusive().then_some(connection_id);
        QueueState {
            def,
            owner,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumers: vec![],
            cursor: 0,
            had_consumers: false,
        }
    }

    fn descriptor(&self) -> QueueDescriptor {
        QueueDescriptor {
            name: self.def.name().to_owned(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn accessible_by(&self, connection_id: u64) -> bool {
        self.owner.map_or(true, |owner| owner == connection_id)
    }

    fn next_available_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % count;
                return Some(idx);
            }
        }
        None
    }

    /// Removes a consumer and puts its unacknowledged messages back at the
    /// head of the queue in their original order.
    fn drop_consumer(&mut self, consumer_id: u64) {
        self.consumers.retain(|c| c.id != consumer_id);
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer_id == consumer_id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    next_connection_id: u64,
    next_consumer_id: u64,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn declare_queue(
        &mut self,
        connection_id: u64,
        def: &QueueDefinition,
    ) -> Result<QueueDescriptor, AmqpError> {
        if let Some(queue) = self.queues.get(def.name()) {
            if !queue.accessible_by(connection_id) {
                return Err(AmqpError::DeclareQueueError(
                    def.name().to_owned(),
                    "RESOURCE_LOCKED - queue is exclusive to another connection".to_owned(),
                ));
            }
            if &queue.def != def {
                return Err(AmqpError::DeclareQueueError(
                    def.name().to_owned(),
                    "PRECONDITION_FAILED - inequivalent queue parameters".to_owned(),
                ));
            }
            return Ok(queue.descriptor());
        }

        let queue = QueueState::new(def.clone(), connection_id);
        let descriptor = queue.descriptor();
        self.queues.insert(def.name().to_owned(), queue);
        debug!("queue: {} was created", def.name());

        Ok(descriptor)
    }

    fn bind_queue(&mut self, connection_id: u64, binding: &QueueBinding) -> Result<(), AmqpError> {
        let queue_ok = self
            .queues
            .get(binding.queue_name())
            .is_some_and(|q| q.accessible_by(connection_id));
        let exchange_ok = self.exchanges.contains_key(binding.exchange_name());

        if !queue_ok || !exchange_ok {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        if !self.bindings.contains(binding) {
            self.bindings.push(binding.clone());
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::PublishingError(exchange.to_owned()))?;

        let mut targets: Vec<String> = vec![];
        for binding in &self.bindings {
            if binding.exchange_name() == exchange
                && kind.matches(binding.routing_key_pattern(), routing_key)
                && !targets.iter().any(|t| t == binding.queue_name())
            {
                targets.push(binding.queue_name().to_owned());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, shared: &SharedState, message: BrokerMessage) -> Result<usize, AmqpError> {
        let targets = self.route(&message.exchange, &message.routing_key)?;
        if targets.is_empty() {
            debug!(
                exchange = message.exchange.as_str(),
                routing_key = message.routing_key.as_str(),
                "message unroutable, dropped"
            );
        }

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
        for name in &targets {
            self.dispatch(shared, name);
        }

        Ok(targets.len())
    }

    fn dispatch(&mut self, shared: &SharedState, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }
            let Some(idx) = queue.next_available_consumer() else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
                properties: message.properties.clone(),
                acker: Arc::new(MemoryAcker {
                    shared: Arc::clone(shared),
                    queue: queue_name.to_owned(),
                    delivery_tag: tag,
                }),
            };

            let consumer = &mut queue.consumers[idx];
            let consumer_id = consumer.id;
            if consumer.sender.send(Ok(delivery)).is_err() {
                // the stream was dropped; treat it as a cancelled consumer
                queue.ready.push_front(message);
                queue.drop_consumer(consumer_id);
                if queue.def.is_auto_delete() && queue.consumers.is_empty() {
                    self.delete_queue(queue_name);
                    return;
                }
                continue;
            }

            consumer.in_flight += 1;
            queue.unacked.insert(
                tag,
                Unacked {
                    consumer_id,
                    message,
                },
            );
        }
    }

    fn settle(
        &mut self,
        shared: &SharedState,
        queue_name: &str,
        tag: u64,
        settlement: Settlement,
    ) -> Result<(), ()> {
        let queue = self.queues.get_mut(queue_name).ok_or(())?;
        let unacked = queue.unacked.remove(&tag).ok_or(())?;

        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|c| c.id == unacked.consumer_id)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut dead_letter = None;
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settlement::DeadLetter => {
                if let Some(dlx) = queue.def.dead_letter_exchange_name() {
                    let mut message = unacked.message;
                    let headers = &mut message.properties.headers;
                    headers
                        .entry(HEADER_FIRST_DEATH_QUEUE.to_owned())
                        .or_insert_with(|| queue_name.to_owned());
                    headers
                        .entry(HEADER_FIRST_DEATH_REASON.to_owned())
                        .or_insert_with(|| "rejected".to_owned());
                    headers
                        .entry(HEADER_FIRST_DEATH_EXCHANGE.to_owned())
                        .or_insert_with(|| message.exchange.clone());

                    if let Some(key) = queue.def.dead_letter_routing_key_name() {
                        message.routing_key = key.to_owned();
                    }
                    message.exchange = dlx.to_owned();
                    message.redelivered = false;
                    dead_letter = Some(message);
                }
            }
        }

        if let Some(message) = dead_letter {
            if let Err(err) = self.enqueue(shared, message) {
                debug!(error = err.to_string(), "dead-letter exchange missing, message dropped");
            }
        }

        self.dispatch(shared, queue_name);
        Ok(())
    }

    fn add_consumer(
        &mut self,
        connection_id: u64,
        queue_name: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<Result<Delivery, AmqpError>>, AmqpError> {
        self.next_consumer_id += 1;
        let id = self.next_consumer_id;

        let queue = self
            .queues
            .get_mut(queue_name)
            .filter(|q| q.accessible_by(connection_id))
            .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue_name.to_owned()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerState {
            id,
            connection_id,
            prefetch,
            in_flight: 0,
            sender,
        });
        queue.had_consumers = true;

        Ok(receiver)
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            self.bindings.retain(|b| b.queue_name() != name);
            debug!("queue: {} was deleted", name);
        }
    }

    fn close_connection(&mut self, shared: &SharedState, connection_id: u64) {
        for queue in self.queues.values_mut() {
            let closing: Vec<u64> = queue
                .consumers
                .iter()
                .filter(|c| c.connection_id == connection_id)
                .map(|c| c.id)
                .collect();
            for id in closing {
                queue.drop_consumer(id);
            }
        }

        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| {
                q.owner == Some(connection_id)
                    || (q.def.is_auto_delete() && q.had_consumers && q.consumers.is_empty())
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &doomed {
            self.delete_queue(name);
        }

        let remaining: Vec<String> = self.queues.keys().cloned().collect();
        for name in remaining {
            self.dispatch(shared, &name);
        }
    }
}

fn lock(shared: &SharedState) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: SharedState,
}

impl MemoryBroker {
    /// Creates an empty broker with no exchanges or queues.
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Creates an exchange, or leaves an existing one untouched.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        lock(&self.shared)
            .exchanges
            .entry(name.to_owned())
            .or_insert(kind);
    }

    /// Opens a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let mut state = lock(&self.shared);
        state.next_connection_id += 1;

        MemoryConnection {
            id: state.next_connection_id,
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a queue with this name is currently declared.
    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.shared).queues.contains_key(name)
    }

    /// Number of messages waiting for delivery on a queue.
    pub fn queue_messages(&self, name: &str) -> Option<usize> {
        lock(&self.shared).queues.get(name).map(|q| q.ready.len())
    }

    /// Number of delivered but not yet settled messages on a queue.
    pub fn queue_unacked(&self, name: &str) -> Option<usize> {
        lock(&self.shared).queues.get(name).map(|q| q.unacked.len())
    }

    /// Number of consumers attached to a queue.
    pub fn queue_consumers(&self, name: &str) -> Option<usize> {
        lock(&self.shared).queues.get(name).map(|q| q.consumers.len())
    }

    /// Removes and returns every ready message of a queue.
    pub fn take_messages(&self, name: &str) -> Vec<BrokerMessage> {
        lock(&self.shared)
            .queues
            .get_mut(name)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Connection to a [`MemoryBroker`]. Closing it ends its consumers and
/// deletes the queues it owns.
pub struct MemoryConnection {
    id: u64,
    shared: SharedState,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }

        Ok(Arc::new(MemoryChannel {
            connection_id: self.id,
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.shared).close_connection(&self.shared, self.id);
        Ok(())
    }
}

struct MemoryChannel {
    connection_id: u64,
    shared: SharedState,
    closed: Arc<AtomicBool>,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        self.ensure_open()?;
        lock(&self.shared).declare_queue(self.connection_id, def)
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        lock(&self.shared).bind_queue(self.connection_id, binding)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let message = BrokerMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: message.data,
            properties: message.properties,
            redelivered: false,
        };
        lock(&self.shared).enqueue(&self.shared, message)?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let prefetch = self.prefetch.load(Ordering::SeqCst);

        let receiver = {
            let mut state = lock(&self.shared);
            let receiver = state.add_consumer(self.connection_id, queue, prefetch)?;
            state.dispatch(&self.shared, queue);
            receiver
        };

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }
}

struct MemoryAcker {
    shared: SharedState,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<(), ()> {
        lock(&self.shared).settle(&self.shared, &self.queue, self.delivery_tag, settlement)
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Ack)
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::DeadLetter
        };
        self.settle(settlement)
            .map_err(|_| AmqpError::NackMessageError)
    }
}
