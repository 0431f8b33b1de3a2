//! Nostr event record: parsing, kind classification, tag access.

pub mod canonical;
pub mod envelope;
pub mod filter;
pub mod verify;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 32-byte event id (SHA-256 of the canonical serialization).
pub type Id = [u8; 32];

/// 32-byte x-only public key.
pub type Pubkey = [u8; 32];

/// 64-byte Schnorr signature.
pub type Sig = [u8; 64];

/// Kind of a deletion request event (NIP-09).
pub const KIND_DELETION: u16 = 5;

/// Kind of a follow list event (NIP-02); feeds the `follows` access policy.
pub const KIND_FOLLOW_LIST: u16 = 3;

/// Kind of a relay list event (NIP-65); feeds the spider's peer discovery.
pub const KIND_RELAY_LIST: u16 = 10002;

/// Kind of a client authentication response event (NIP-42).
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Error types for event decoding and verification.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("event id does not match canonical hash")]
    IdMismatch,

    #[error("signature verification failed")]
    BadSignature,
}

/// A signed, immutable Nostr event.
///
/// The JSON mapping hex-encodes `id`, `pubkey` and `sig`; `tags` is an
/// ordered list of ordered lists of strings; `created_at` is seconds since
/// the epoch (signed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "hex32")]
    pub id: Id,
    #[serde(with = "hex32")]
    pub pubkey: Pubkey,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    #[serde(with = "hex64")]
    pub sig: Sig,
}

impl Event {
    /// Parse an event from its JSON object form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize to the minimized JSON object form.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Values of all tags whose key equals `key`.
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == key)
            .map(|t| t[1].as_str())
    }

    /// First value of the first tag whose key equals `key`.
    pub fn first_tag_value<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.tag_values(key).next()
    }

    /// The `d` tag value, used to key parameterized-replaceable events.
    pub fn d_tag(&self) -> Option<&str> {
        self.first_tag_value("d")
    }
}

/// Replaceable kinds: only the newest event per (pubkey, kind) survives.
pub fn is_replaceable(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Parameterized-replaceable kinds: newest per (pubkey, kind, d-tag) survives.
pub fn is_param_replaceable(kind: u16) -> bool {
    (30_000..40_000).contains(&kind)
}

/// Ephemeral kinds are fanned out to live subscribers but never persisted.
pub fn is_ephemeral(kind: u16) -> bool {
    (20_000..30_000).contains(&kind)
}

/// Privileged kinds are disclosed only to the author, to parties p-tagged
/// in the event, or to an admin.
pub fn is_privileged(kind: u16) -> bool {
    matches!(kind, 4 | 1059 | 1060)
}

/// Decode a 64-char hex string into a 32-byte array.
pub fn parse_hex32(s: &str) -> Result<[u8; 32], EventError> {
    let bytes = hex::decode(s).map_err(|e| EventError::Malformed(format!("bad hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| EventError::Malformed(format!("expected 32 bytes, got {}", s.len() / 2)))
}

pub(crate) mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes of hex"))
    }
}

pub(crate) mod hex64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes of hex"))
    }
}
