// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Kinds and Routing
//!
//! Exchanges are the routing mechanism that decides which bound queues
//! receive a published message. This module names the exchange kinds the
//! layer works with and implements their routing-key matching rules.

/// Separator between routing-key segments.
pub const ROUTING_KEY_SEPARATOR: char = '.';
/// Topic pattern segment matching exactly one key segment.
pub const WILDCARD_ONE: &str = "*";
/// Topic pattern segment matching zero or more key segments.
pub const WILDCARD_MANY: &str = "#";

/// Represents the types of exchanges a queue can be bound to.
///
/// - Direct: routes on an exact match of the routing key
/// - Fanout: routes to every bound queue regardless of the key
/// - Topic: routes on wildcard pattern matching of dot-separated segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    /// Returns whether a binding with `pattern` receives a message published
    /// under `routing_key` on an exchange of this kind.
    pub fn matches(&self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = pattern.split(ROUTING_KEY_SEPARATOR).collect();
                let key: Vec<&str> = routing_key.split(ROUTING_KEY_SEPARATOR).collect();
                topic_matches(&pattern, &key)
            }
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&WILDCARD_MANY, rest)) => {
            (0..=key.len()).any(|skip| topic_matches(rest, &key[skip..]))
        }
        Some((&WILDCARD_ONE, rest)) => !key.is_empty() && topic_matches(rest, &key[1..]),
        Some((segment, rest)) => key.first() == Some(segment) && topic_matches(rest, &key[1..]),
    }
}
