// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub over AMQP
//!
//! Typed publish/subscribe on top of an AMQP 0-9-1 broker. Publishers encode
//! payloads with a [`codec::Codec`] and send them to an exchange; subscribers
//! provision a queue, consume it with a prefetch of one and settle every
//! delivery according to their handler's [`handler::AckDecision`].
//!
//! The broker is reached through the [`broker`] traits, implemented for
//! RabbitMQ in [`channel`] and in-process in [`memory`].

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod routing;
pub mod subscriber;
pub mod topology;

pub use consumer::{RequeuePolicy, DEFAULT_MAX_REQUEUES};
