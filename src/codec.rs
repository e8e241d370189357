// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! A codec turns a typed payload into message bytes and back. Two strategies
//! are provided and selected statically at each publish/subscribe call site:
//!
//! - [`JsonCodec`]: self-describing text, tolerant of optional fields. Used
//!   for low-frequency control messages.
//! - [`BincodeCodec`]: dense binary that relies on both ends sharing the same
//!   type layout. Used for high-volume internal traffic such as game logs.
//!
//! Both ends of a routing key are expected to agree on the codec; the
//! content type set on publish records which one produced a message.

use crate::errors::AmqpError;
use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

/// Content type tag for [`JsonCodec`] messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type tag for [`BincodeCodec`] messages
pub const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";

/// Upper bound on the size of a binary payload, in bytes.
const BINCODE_SIZE_LIMIT: u64 = 16 * 1024 * 1024;

/// Encode/decode strategy applied uniformly to any serde type.
pub trait Codec: Send + Sync + 'static {
    /// Tag stored in the message's content-type property.
    const CONTENT_TYPE: &'static str;

    /// Serializes a payload. Fails with [`AmqpError::EncodeError`].
    fn encode<T>(value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized;

    /// Deserializes a payload. Malformed or mismatched bytes fail with
    /// [`AmqpError::DecodeError`]; no default value is ever produced.
    fn decode<T>(data: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode<T>(value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|err| AmqpError::EncodeError(err.to_string()))
    }

    fn decode<T>(data: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

/// Binary codec over bincode with fixed-width integers.
///
/// Trailing bytes after a complete value are rejected so that a payload of
/// the wrong type cannot decode by accident.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    fn options() -> impl Options {
        bincode::DefaultOptions::new()
            .with_limit(BINCODE_SIZE_LIMIT)
            .with_fixint_encoding()
            .reject_trailing_bytes()
    }
}

impl Codec for BincodeCodec {
    const CONTENT_TYPE: &'static str = BINCODE_CONTENT_TYPE;

    fn encode<T>(value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        Self::options()
            .serialize(value)
            .map_err(|err| AmqpError::EncodeError(err.to_string()))
    }

    fn decode<T>(data: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        Self::options()
            .deserialize(data)
            .map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{GameLog, PlayingState};
    use chrono::DateTime;
    use std::collections::BTreeMap;

    fn game_log(message: &str) -> GameLog {
        GameLog {
            current_time: DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap(),
            message: message.to_owned(),
            username: "alice".to_owned(),
        }
    }

    #[test]
    fn json_round_trip() {
        for state in [PlayingState { is_paused: true }, PlayingState { is_paused: false }] {
            let bytes = JsonCodec::encode(&state).unwrap();
            assert_eq!(JsonCodec::decode::<PlayingState>(&bytes).unwrap(), state);
        }

        let log = game_log("alice won a war against bob");
        let bytes = JsonCodec::encode(&log).unwrap();
        assert_eq!(JsonCodec::decode::<GameLog>(&bytes).unwrap(), log);
    }

    #[test]
    fn json_uses_pascal_case_field_names() {
        let bytes = JsonCodec::encode(&PlayingState { is_paused: true }).unwrap();
        assert_eq!(bytes, br#"{"IsPaused":true}"#);
    }

    #[test]
    fn bincode_round_trip() {
        let log = game_log("");
        let bytes = BincodeCodec::encode(&log).unwrap();
        assert_eq!(BincodeCodec::decode::<GameLog>(&bytes).unwrap(), log);

        let bytes = BincodeCodec::encode(&PlayingState { is_paused: true }).unwrap();
        assert_eq!(
            BincodeCodec::decode::<PlayingState>(&bytes).unwrap(),
            PlayingState { is_paused: true }
        );
    }

    #[test]
    fn json_rejects_malformed_input() {
        let inputs: [&[u8]; 5] = [
            b"",
            b"{",
            b"not json",
            br#"{"Paused":true}"#,
            br#"{"IsPaused":1}"#,
        ];
        for input in inputs {
            let result = JsonCodec::decode::<PlayingState>(input);
            assert!(matches!(result, Err(AmqpError::DecodeError(_))), "{input:?}");
        }
    }

    #[test]
    fn bincode_rejects_truncated_and_trailing_bytes() {
        let bytes = BincodeCodec::encode(&game_log("spam")).unwrap();

        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            BincodeCodec::decode::<GameLog>(truncated),
            Err(AmqpError::DecodeError(_))
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            BincodeCodec::decode::<GameLog>(&trailing),
            Err(AmqpError::DecodeError(_))
        ));

        assert!(matches!(
            BincodeCodec::decode::<GameLog>(&[]),
            Err(AmqpError::DecodeError(_))
        ));
    }

    #[test]
    fn bincode_rejects_invalid_bool() {
        assert!(matches!(
            BincodeCodec::decode::<PlayingState>(&[7]),
            Err(AmqpError::DecodeError(_))
        ));
    }

    #[test]
    fn json_encode_failure_is_reported() {
        let mut unencodable = BTreeMap::new();
        unencodable.insert(vec![1u8, 2], 3u8);

        assert!(matches!(
            JsonCodec::encode(&unencodable),
            Err(AmqpError::EncodeError(_))
        ));
    }
}
