// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Encodes typed payloads and hands them to an exchange under a routing key.
//! Publishing is fire-and-forget: it returns once the message is written to
//! the channel, without waiting for broker confirms or consumers. Every
//! message carries its codec's content type, a fresh message id and the
//! current trace context.
//!
//! Channels are not shared between concurrent publishers; give each
//! concurrent call site its own channel.

use crate::{
    broker::{BrokerChannel, Headers, MessageProperties, OutboundMessage},
    codec::{BincodeCodec, Codec, JsonCodec},
    errors::AmqpError,
    otel,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes `payload` encoded with codec `C` to `exchange` under `routing_key`.
///
/// Encode failures are returned before anything is sent.
pub async fn publish<C, T>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    payload: &T,
) -> Result<(), AmqpError>
where
    C: Codec,
    T: Serialize + ?Sized,
{
    let data = C::encode(payload).map_err(|err| {
        error!(error = err.to_string(), "error encoding message");
        err
    })?;

    let mut headers = Headers::new();
    otel::inject_current(&mut headers);

    let message = OutboundMessage {
        data,
        properties: MessageProperties {
            content_type: Some(C::CONTENT_TYPE.to_owned()),
            message_id: Some(Uuid::new_v4().to_string()),
            headers,
        },
        mandatory: true,
    };

    debug!(
        "publishing to exchange: {} with the key: {}",
        exchange, routing_key
    );

    channel.basic_publish(exchange, routing_key, message).await
}

/// Publishes `payload` as JSON.
pub async fn publish_json<T>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    payload: &T,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized,
{
    publish::<JsonCodec, T>(channel, exchange, routing_key, payload).await
}

/// Publishes `payload` as bincode.
pub async fn publish_bincode<T>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    payload: &T,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized,
{
    publish::<BincodeCodec, T>(channel, exchange, routing_key, payload).await
}

/// A publisher holding its own channel handle.
///
/// Handlers that publish derived messages usually capture one of these.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Creates a publisher sending on `channel`.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Publisher {
        Publisher { channel }
    }

    /// Publishes `payload` encoded with codec `C`, see [`publish`].
    pub async fn publish<C, T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        C: Codec,
        T: Serialize + ?Sized,
    {
        publish::<C, T>(self.channel.as_ref(), exchange, routing_key, payload).await
    }

    /// Publishes `payload` as JSON.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish::<JsonCodec, T>(exchange, routing_key, payload)
            .await
    }

    /// Publishes `payload` as bincode.
    pub async fn publish_bincode<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish::<BincodeCodec, T>(exchange, routing_key, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        codec::{BINCODE_CONTENT_TYPE, JSON_CONTENT_TYPE},
        routing::PlayingState,
    };
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn json_message_is_tagged_and_mandatory() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_publish()
            .with(eq("peril_direct"), eq("pause"), mockall::predicate::always())
            .times(1)
            .returning(|_, _, message| {
                assert_eq!(message.data, br#"{"IsPaused":true}"#);
                assert_eq!(
                    message.properties.content_type.as_deref(),
                    Some(JSON_CONTENT_TYPE)
                );
                assert!(message.properties.message_id.is_some());
                assert!(message.mandatory);
                Ok(())
            });

        publish_json(&channel, "peril_direct", "pause", &PlayingState { is_paused: true })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn every_message_gets_its_own_id() {
        let ids = Arc::new(std::sync::Mutex::new(vec![]));
        let seen = ids.clone();

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_publish()
            .times(2)
            .returning(move |_, _, message| {
                assert_eq!(
                    message.properties.content_type.as_deref(),
                    Some(BINCODE_CONTENT_TYPE)
                );
                seen.lock().unwrap().push(message.properties.message_id);
                Ok(())
            });

        let publisher = Publisher::new(Arc::new(channel));
        for _ in 0..2 {
            publisher
                .publish_bincode("peril_topic", "game_logs.alice", &PlayingState { is_paused: false })
                .await
                .unwrap();
        }

        let ids = ids.lock().unwrap();
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn encode_failure_never_reaches_the_channel() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_publish().never();

        let mut unencodable = BTreeMap::new();
        unencodable.insert(vec![0u8], 1u8);

        let result = publish_json(&channel, "peril_topic", "war.alice", &unencodable).await;
        assert!(matches!(result, Err(AmqpError::EncodeError(_))));
    }

    #[tokio::test]
    async fn channel_failure_is_returned() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_publish()
            .returning(|exchange, _, _| Err(AmqpError::PublishingError(exchange.to_owned())));

        let result = publish_json(&channel, "peril_direct", "pause", &true).await;
        assert_eq!(
            result,
            Err(AmqpError::PublishingError("peril_direct".to_owned()))
        );
    }
}
