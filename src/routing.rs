// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Conventions
//!
//! Well-known exchange names, routing-key prefixes and the payload types
//! shared between the game server and its clients. Field names serialize in
//! PascalCase so JSON messages stay readable by clients written against the
//! same wire format in other languages.

use crate::exchange::{ROUTING_KEY_SEPARATOR, WILDCARD_ONE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direct exchange carrying exact-match control broadcasts
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
/// Topic exchange carrying wildcard-routed gameplay and log traffic
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Routing key targeting one player: `<prefix>.<username>`.
pub fn player_key(prefix: &str, username: &str) -> String {
    format!("{prefix}{ROUTING_KEY_SEPARATOR}{username}")
}

/// Topic pattern matching any single player: `<prefix>.*`.
pub fn any_player_pattern(prefix: &str) -> String {
    format!("{prefix}{ROUTING_KEY_SEPARATOR}{WILDCARD_ONE}")
}

/// Pause/resume broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// A line of game history, published by clients and persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    #[test]
    fn player_keys_match_their_pattern() {
        let key = player_key(GAME_LOG_SLUG, "alice");
        let pattern = any_player_pattern(GAME_LOG_SLUG);

        assert_eq!(key, "game_logs.alice");
        assert_eq!(pattern, "game_logs.*");
        assert!(ExchangeKind::Topic.matches(&pattern, &key));
        assert!(!ExchangeKind::Topic.matches(&pattern, &player_key(ARMY_MOVES_PREFIX, "alice")));
    }
}
