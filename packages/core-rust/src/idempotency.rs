//! Idempotency key derivation.
//!
//! The key identifies one logical message across redeliveries. Sources are
//! tried in priority order: broker message id, then application correlation
//! id, then a content hash of the serialized body.
//!
//! The content-hash fallback is a 32-bit FNV-1a and is best-effort only: two
//! distinct messages can collide and be suppressed as duplicates. Producers
//! that need reliable deduplication must supply a message or correlation id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{fnv1a_hash, hash_hex};
use crate::transport::TransportMessage;

/// Where an [`IdempotencyKey`] was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySource {
    DeliveryId,
    Correlation,
    ContentHash,
}

impl KeySource {
    /// Key prefix for this source.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::DeliveryId => "msg",
            Self::Correlation => "corr",
            Self::ContentHash => "hash",
        }
    }
}

/// Deduplication key of a logical message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    source: KeySource,
    value: String,
}

impl IdempotencyKey {
    /// Derives the key of an inbound message.
    #[must_use]
    pub fn derive(message: &TransportMessage) -> Self {
        if let Some(id) = message.message_id {
            return Self::from_parts(KeySource::DeliveryId, id.to_string());
        }
        if let Some(correlation) = message.correlation_id {
            return Self::from_parts(KeySource::Correlation, correlation.simple().to_string());
        }
        Self::from_parts(KeySource::ContentHash, hash_hex(content_hash(message)))
    }

    fn from_parts(source: KeySource, id: String) -> Self {
        Self {
            source,
            value: format!("{}:{id}", source.tag()),
        }
    }

    /// Prefixes the key with a consumer scope, e.g. the consuming queue.
    ///
    /// Fan-out copies of one event carry the same message id; scoping keeps
    /// each consumer's claims apart in a shared store.
    #[must_use]
    pub fn scoped(mut self, scope: &str) -> Self {
        self.value = format!("{scope}/{}", self.value);
        self
    }

    #[must_use]
    pub fn source(&self) -> KeySource {
        self.source
    }

    /// Full key string, e.g. `msg:6f0c...`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Whether the key only rests on the collision-prone content hash.
    #[must_use]
    pub fn is_best_effort(&self) -> bool {
        self.source == KeySource::ContentHash
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// Type name is folded in so equal bodies of different types do not collide.
fn content_hash(message: &TransportMessage) -> u32 {
    let mut buf = Vec::with_capacity(message.message_type.len() + 1 + message.body.len());
    buf.extend_from_slice(message.message_type.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&message.body);
    fnv1a_hash(&buf)
}
