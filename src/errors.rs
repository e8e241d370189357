// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Layer
//!
//! The `AmqpError` enum represents every failure the layer can surface:
//! infrastructure faults (connection, channel, declare, bind, qos, consumer
//! setup), publish-side faults (encode, publish) and per-message faults
//! (decode, ack, nack). Infrastructure errors are returned to the caller;
//! per-message errors never leave the consumer loop.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or using a channel, including use after close
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish to exchange `{0}`")]
    PublishingError(String),

    /// Error serializing a payload, the message never leaves the process
    #[error("failure to encode payload: {0}")]
    EncodeError(String),

    /// Error deserializing a payload
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error reading from a delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
