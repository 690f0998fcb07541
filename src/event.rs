//! Nostr event model.

use chrono::DateTime;
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{de, Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `i` – input parameter of a job request
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved, and
/// both the order of tags and the order of elements inside a tag survive a
/// decode/encode cycle. An empty array is not a tag and fails to decode.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let parts = Vec::<String>::deserialize(deserializer)?;
        if parts.is_empty() {
            return Err(de::Error::custom("tag must have at least one element"));
        }
        Ok(Tag(parts))
    }
}

impl Tag {
    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Primary value (second element), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event accepted from clients and fanned out to subscribers.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["p", "abcd"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
///
/// `created_at` may arrive as an integer, a numeric string such as
/// `"1700000000"`, or an RFC3339 string such as `"2023-11-14T22:13:20Z"`. It is
/// always encoded back as an integer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: Timestamp,
    /// Kind number, e.g. `1` or `5838`.
    pub kind: u32,
    /// Arbitrary tags such as `e` (event reference) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Reasons an event fails id or signature verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("id mismatch")]
    IdMismatch,
    #[error("bad hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("bad signature: {0}")]
    Signature(#[from] secp256k1::Error),
    #[error("serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Event {
    /// SHA-256 over the canonical `[0, pubkey, created_at, kind, tags, content]`
    /// serialization.
    pub fn hash(&self) -> Result<[u8; 32], serde_json::Error> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let data = serde_json::to_vec(&arr)?;
        Ok(Sha256::digest(&data).into())
    }

    /// Hex-encoded canonical id for the current content.
    pub fn compute_id(&self) -> Result<String, serde_json::Error> {
        Ok(hex::encode(self.hash()?))
    }

    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(VerifyError::IdMismatch);
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)?;
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }

    /// Value of the first tag named `name` that carries one. Bare tags such
    /// as `["i"]` are skipped.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.name() == Some(name))
            .find_map(Tag::value)
    }
}

/// Wire encodings accepted for `created_at`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(i64),
    Text(String),
}

/// Normalize a textual timestamp: numeric seconds first, then RFC3339.
pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
    if let Ok(secs) = text.trim().parse::<i64>() {
        return Some(secs);
    }
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.timestamp())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    match RawTimestamp::deserialize(deserializer) {
        Ok(RawTimestamp::Seconds(secs)) => Ok(secs),
        Ok(RawTimestamp::Text(text)) => parse_timestamp(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid timestamp format: {text}"))
        }),
        Err(_) => Err(serde::de::Error::custom(
            "created_at must be integer seconds, a numeric string, or RFC3339",
        )),
    }
}
