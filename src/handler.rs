// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives one decoded payload and answers with an [`AckDecision`].
//! The decision is a plain return value; the consumer loop is the only place
//! that talks to the broker about it.

use async_trait::async_trait;

/// Outcome of handling one message, terminal for that delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; the message is removed from its queue.
    Accept,
    /// Not processed yet; the broker redelivers the message.
    RequeueRetry,
    /// Never processable; the message goes to the dead-letter exchange.
    DiscardToDeadLetter,
}

/// Processes payloads of type `T` for a subscription.
///
/// Handlers run sequentially on their subscription's consumer loop and, with
/// a prefetch of one, no further message reaches the queue's consumer until
/// `exec` returns. Plain closures `Fn(T) -> AckDecision` implement this trait.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn exec(&self, payload: T) -> AckDecision;
}

#[async_trait]
impl<T, F> ConsumerHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> AckDecision + Send + Sync,
{
    async fn exec(&self, payload: T) -> AckDecision {
        self(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Acceptor;

    #[async_trait]
    impl ConsumerHandler<u32> for Acceptor {
        async fn exec(&self, payload: u32) -> AckDecision {
            if payload % 2 == 0 {
                AckDecision::Accept
            } else {
                AckDecision::DiscardToDeadLetter
            }
        }
    }

    #[tokio::test]
    async fn closures_and_structs_are_handlers() {
        let closure = |n: u32| {
            if n > 3 {
                AckDecision::Accept
            } else {
                AckDecision::RequeueRetry
            }
        };

        assert_eq!(closure.exec(1).await, AckDecision::RequeueRetry);
        assert_eq!(closure.exec(7).await, AckDecision::Accept);
        assert_eq!(Acceptor.exec(2).await, AckDecision::Accept);
        assert_eq!(Acceptor.exec(3).await, AckDecision::DiscardToDeadLetter);
    }
}
