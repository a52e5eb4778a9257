// Core data model shared by sources, the engine and remote stores.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

/// Opaque continuation marker handed out by a source.
///
/// The engine never interprets the bytes. The empty token is the bootstrap
/// value and means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    pub fn bootstrap() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Token for counter-based sources (offsets, sequence numbers)
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_bootstrap(&self) -> bool {
        self.0.is_empty()
    }

    /// Read back a token produced by [`ChangeToken::from_u64`].
    ///
    /// The bootstrap token reads as 0. Returns `None` for tokens of any
    /// other shape.
    pub fn as_u64(&self) -> Option<u64> {
        if self.0.is_empty() {
            return Some(0);
        }
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(encoded).map(Self)
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bootstrap() {
            write!(f, "<bootstrap>")
        } else if let Some(n) = self.as_u64() {
            write!(f, "{}", n)
        } else {
            write!(f, "{}", self.to_base64())
        }
    }
}

impl Serialize for ChangeToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ChangeToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Category label derived from a local record id, used to find the remote
/// counterpart of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyTag(String);

impl IdempotencyTag {
    /// Tags are the stringified record id, so any system holding the id can
    /// correlate without a mapping table.
    pub fn for_record(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binary payload uploaded alongside an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A unit of data produced by a local source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    pub stream_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl LocalRecord {
    pub fn new(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            content,
            attachment: None,
            time: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn tag(&self) -> IdempotencyTag {
        IdempotencyTag::for_record(&self.id)
    }

    /// Parameters for `events.create`
    pub fn to_event_params(&self) -> Value {
        let mut params = json!({
            "streamIds": [self.stream_id],
            "type": self.event_type,
            "content": self.content,
            "tags": [self.tag().as_str()],
        });
        if let Some(time) = self.time {
            params["time"] = json!(to_unix_seconds(time));
        }
        params
    }
}

/// A record removed at the source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deletion {
    pub id: String,
}

impl Deletion {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn tag(&self) -> IdempotencyTag {
        IdempotencyTag::for_record(&self.id)
    }
}

/// One delivery from a source: everything that changed since the anchor it
/// was queried with, plus the anchor to use next time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub additions: Vec<LocalRecord>,
    pub deletions: Vec<Deletion>,
    pub next_anchor: ChangeToken,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }
}

/// Event as returned by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    pub id: String,
    #[serde(default)]
    pub stream_ids: Vec<String>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
}

impl RemoteEvent {
    pub fn has_tag(&self, tag: &IdempotencyTag) -> bool {
        self.tags.iter().any(|t| t == tag.as_str())
    }
}

pub fn to_unix_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_millis()) / 1000.0
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
