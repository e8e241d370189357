// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption and Acknowledgment Policy
//!
//! Processing of a single delivery: decode the payload, run the handler, and
//! settle the delivery according to the resulting decision:
//!
//! | Decision              | Broker action        |
//! |-----------------------|----------------------|
//! | `Accept`              | ack                  |
//! | `RequeueRetry`        | nack, requeue=true   |
//! | `DiscardToDeadLetter` | nack, requeue=false  |
//!
//! Undecodable payloads are discarded to the dead-letter exchange without
//! reaching the handler. Requeues are counted per message id so that a
//! message cannot bounce between queue and handler forever.

use crate::{
    broker::Delivery,
    codec::Codec,
    errors::AmqpError,
    handler::{AckDecision, ConsumerHandler},
    otel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{FutureExt, SpanRef, Status, TraceContextExt},
};
use serde::de::DeserializeOwned;
use std::{
    borrow::Cow,
    collections::{HashMap, VecDeque},
    marker::PhantomData,
};
use tracing::{debug, error, warn};

/// Requeues allowed per message before it is dead-lettered instead.
pub const DEFAULT_MAX_REQUEUES: u32 = 10;

/// Message ids a consumer loop keeps requeue counts for. Past this, the
/// oldest tracked id is forgotten.
pub(crate) const MAX_TRACKED_MESSAGES: usize = 1024;

/// How many times a message may be requeued by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Honor every `RequeueRetry`.
    Unbounded,
    /// After this many requeues of the same message, a further
    /// `RequeueRetry` becomes `DiscardToDeadLetter`.
    Bounded(u32),
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        RequeuePolicy::Bounded(DEFAULT_MAX_REQUEUES)
    }
}

/// Counts requeues per message id for one consumer loop.
///
/// Messages without a message id cannot be told apart across redeliveries
/// and are never escalated. A requeued message may be settled by another
/// consumer of the same queue, so at most `capacity` ids are tracked and the
/// oldest is evicted first.
#[derive(Debug)]
pub(crate) struct RequeueTracker {
    policy: RequeuePolicy,
    capacity: usize,
    requeues: HashMap<String, u32>,
    order: VecDeque<String>,
}

impl RequeueTracker {
    pub(crate) fn new(policy: RequeuePolicy) -> Self {
        Self::with_capacity(policy, MAX_TRACKED_MESSAGES)
    }

    pub(crate) fn with_capacity(policy: RequeuePolicy, capacity: usize) -> Self {
        RequeueTracker {
            policy,
            capacity: capacity.max(1),
            requeues: HashMap::default(),
            order: VecDeque::default(),
        }
    }

    fn forget(&mut self, id: &str) {
        if self.requeues.remove(id).is_some() {
            self.order.retain(|tracked| tracked != id);
        }
    }

    fn track(&mut self, id: &str) -> &mut u32 {
        if !self.requeues.contains_key(id) {
            while self.requeues.len() >= self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.requeues.remove(&oldest);
            }
            self.order.push_back(id.to_owned());
        }
        self.requeues.entry(id.to_owned()).or_insert(0)
    }

    /// Returns the decision to apply, escalating requeues past the bound.
    pub(crate) fn resolve(
        &mut self,
        message_id: Option<&str>,
        decision: AckDecision,
    ) -> AckDecision {
        let Some(id) = message_id else {
            return decision;
        };

        if decision != AckDecision::RequeueRetry {
            self.forget(id);
            return decision;
        }

        let RequeuePolicy::Bounded(max) = self.policy else {
            return decision;
        };

        let count = self.track(id);
        if *count >= max {
            self.forget(id);
            warn!(
                message_id = id,
                requeues = max,
                "too many requeues, sending to dead letter"
            );
            return AckDecision::DiscardToDeadLetter;
        }

        *count += 1;
        decision
    }
}

/// Decodes, handles and settles deliveries of one subscription.
pub(crate) struct MessageConsumer<C, T, H> {
    handler: H,
    tracker: RequeueTracker,
    _marker: PhantomData<fn() -> (C, T)>,
}

impl<C, T, H> MessageConsumer<C, T, H>
where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T>,
{
    pub(crate) fn new(handler: H, policy: RequeuePolicy) -> Self {
        MessageConsumer {
            handler,
            tracker: RequeueTracker::new(policy),
            _marker: PhantomData,
        }
    }

    /// Processes one delivery and returns the decision that was applied.
    ///
    /// Errors only report a failure to settle the delivery with the broker;
    /// the caller logs them and keeps consuming.
    pub(crate) async fn consume(
        &mut self,
        tracer: &BoxedTracer,
        delivery: &Delivery,
    ) -> Result<AckDecision, AmqpError> {
        let cx =
            otel::consumer_context(&delivery.properties.headers, tracer, &delivery.routing_key);
        let span = cx.span();

        debug!(
            "received: {} - exchange: {}",
            delivery.routing_key, delivery.exchange,
        );

        let decision = match C::decode::<T>(&delivery.data) {
            Ok(payload) => {
                self.handler
                    .exec(payload)
                    .with_context(cx.clone())
                    .await
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    routing_key = delivery.routing_key.as_str(),
                    "removing message from queue - reason: undecodable payload"
                );
                span.record_error(&err);
                AckDecision::DiscardToDeadLetter
            }
        };

        let decision = self
            .tracker
            .resolve(delivery.properties.message_id.as_deref(), decision);

        apply_decision(delivery, decision, &span).await?;
        Ok(decision)
    }
}

/// Settles a delivery with the broker according to `decision`.
pub(crate) async fn apply_decision(
    delivery: &Delivery,
    decision: AckDecision,
    span: &SpanRef<'_>,
) -> Result<(), AmqpError> {
    let result = match decision {
        AckDecision::Accept => {
            debug!("message successfully processed");
            delivery.ack().await
        }
        AckDecision::RequeueRetry => {
            warn!("error whiling handling msg, requeuing for latter");
            delivery.nack(true).await
        }
        AckDecision::DiscardToDeadLetter => {
            warn!("discarding msg to dead letter");
            delivery.nack(false).await
        }
    };

    match result {
        Ok(()) => {
            span.set_status(Status::Ok);
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "error whiling settling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{DeliveryAcker, MessageProperties},
        codec::JsonCodec,
        routing::PlayingState,
    };
    use async_trait::async_trait;
    use opentelemetry::global;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    #[derive(Default)]
    struct RecordingAcker {
        settled: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DeliveryAcker for RecordingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.settled.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
            let action = if requeue { "nack-requeue" } else { "nack-discard" };
            self.settled.lock().unwrap().push(action);
            Ok(())
        }
    }

    fn delivery(data: &[u8], acker: Arc<RecordingAcker>) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "peril_direct".to_owned(),
            routing_key: "pause".to_owned(),
            redelivered: false,
            data: data.to_vec(),
            properties: MessageProperties {
                message_id: Some("msg-1".to_owned()),
                ..Default::default()
            },
            acker,
        }
    }

    const REQUEUE: AckDecision = AckDecision::RequeueRetry;

    #[test]
    fn tracker_escalates_after_bound() {
        let mut tracker = RequeueTracker::new(RequeuePolicy::Bounded(2));

        assert_eq!(tracker.resolve(Some("m"), REQUEUE), REQUEUE);
        assert_eq!(tracker.resolve(Some("m"), REQUEUE), REQUEUE);
        assert_eq!(
            tracker.resolve(Some("m"), REQUEUE),
            AckDecision::DiscardToDeadLetter
        );
        assert_eq!(tracker.resolve(Some("m"), REQUEUE), REQUEUE);
    }

    #[test]
    fn tracker_forgets_settled_messages_and_ignores_anonymous_ones() {
        let mut tracker = RequeueTracker::new(RequeuePolicy::Bounded(1));

        tracker.resolve(Some("m"), REQUEUE);
        tracker.resolve(Some("m"), AckDecision::Accept);
        assert_eq!(tracker.resolve(Some("m"), REQUEUE), REQUEUE);

        for _ in 0..5 {
            assert_eq!(tracker.resolve(None, REQUEUE), REQUEUE);
        }
    }

    #[test]
    fn ids_settled_by_other_consumers_do_not_accumulate() {
        let mut tracker = RequeueTracker::new(RequeuePolicy::default());

        for i in 0..10_000 {
            tracker.resolve(Some(&format!("msg-{i}")), REQUEUE);
        }

        assert_eq!(tracker.requeues.len(), MAX_TRACKED_MESSAGES);
        assert_eq!(tracker.order.len(), MAX_TRACKED_MESSAGES);
        assert!(tracker.requeues.contains_key("msg-9999"));
        assert!(!tracker.requeues.contains_key("msg-0"));
    }

    #[test]
    fn eviction_drops_the_oldest_id_first() {
        let mut tracker = RequeueTracker::with_capacity(RequeuePolicy::Bounded(1), 2);

        tracker.resolve(Some("a"), REQUEUE);
        tracker.resolve(Some("b"), REQUEUE);
        tracker.resolve(Some("c"), REQUEUE);

        // "a" was forgotten, so its count starts over
        assert_eq!(tracker.resolve(Some("a"), REQUEUE), REQUEUE);
        // "c" is still tracked and hits the bound
        assert_eq!(
            tracker.resolve(Some("c"), REQUEUE),
            AckDecision::DiscardToDeadLetter
        );
        assert!(tracker.requeues.len() <= 2);
    }

    #[test]
    fn unbounded_policy_never_escalates() {
        let mut tracker = RequeueTracker::new(RequeuePolicy::Unbounded);
        for _ in 0..100 {
            assert_eq!(tracker.resolve(Some("m"), REQUEUE), REQUEUE);
        }
    }

    #[tokio::test]
    async fn each_decision_maps_to_one_broker_action() {
        let tracer = global::tracer("test");
        let cases = [
            (AckDecision::Accept, "ack"),
            (AckDecision::RequeueRetry, "nack-requeue"),
            (AckDecision::DiscardToDeadLetter, "nack-discard"),
        ];

        for (decision, expected) in cases {
            let acker = Arc::new(RecordingAcker::default());
            let mut consumer = MessageConsumer::<JsonCodec, PlayingState, _>::new(
                move |_: PlayingState| decision,
                RequeuePolicy::Unbounded,
            );

            let applied = consumer
                .consume(&tracer, &delivery(br#"{"IsPaused":true}"#, acker.clone()))
                .await
                .unwrap();

            assert_eq!(applied, decision);
            assert_eq!(*acker.settled.lock().unwrap(), vec![expected]);
        }
    }

    #[tokio::test]
    async fn undecodable_payload_skips_handler() {
        let tracer = global::tracer("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let acker = Arc::new(RecordingAcker::default());

        let mut consumer = MessageConsumer::<JsonCodec, PlayingState, _>::new(
            move |_: PlayingState| {
                counter.fetch_add(1, Ordering::SeqCst);
                AckDecision::Accept
            },
            RequeuePolicy::default(),
        );

        let applied = consumer
            .consume(&tracer, &delivery(b"\x00garbage", acker.clone()))
            .await
            .unwrap();

        assert_eq!(applied, AckDecision::DiscardToDeadLetter);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*acker.settled.lock().unwrap(), vec!["nack-discard"]);
    }
}
