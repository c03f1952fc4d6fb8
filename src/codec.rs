//! Payload codecs and content-derived deduplication keys

use crate::error::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

/// Encodes a typed payload to bytes and back.
///
/// Transports only move bytes; typed publishers and subscribers are thin
/// wrappers that pair a transport with a codec.
pub trait Codec<T>: Send + Sync + 'static {
    /// Encode a value to wire bytes
    fn encode(&self, value: &T) -> Result<Bytes>;

    /// Decode wire bytes into a value
    fn decode(&self, payload: &[u8]) -> Result<T>;
}

/// JSON codec.
///
/// Values pass through `serde_json::Value` before being written, so object
/// keys are emitted in sorted order regardless of the iteration order of the
/// source map. Identical logical payloads therefore encode to identical
/// bytes, which keeps [`dedup_key`] stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        let canonical = serde_json::to_value(value)?;
        Ok(Bytes::from(serde_json::to_vec(&canonical)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Broker deduplication key for an encoded payload: lowercase hex SHA-256.
pub fn dedup_key(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Message ID sent to the broker: `{subject}:{dedup_key}`.
///
/// A stream usually captures several subjects and its duplicate window spans
/// all of them. Scoping the key to the subject keeps equal payloads on
/// different subjects (a grant and a claim of the same kit) from suppressing
/// each other.
pub fn message_id(subject: &str, payload: &[u8]) -> String {
    format!("{}:{}", subject, dedup_key(payload))
}
