//! Twelve-byte document identifiers.
//!
//! Layout: 4-byte big-endian creation timestamp (seconds), 5 bytes unique to
//! the process, 3-byte big-endian counter. The wire form is 24 lowercase hex
//! characters.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const COUNTER_MASK: u32 = 0x00FF_FFFF;

static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();

fn random_bytes() -> [u8; 16] {
    *Uuid::new_v4().as_bytes()
}

fn process_unique() -> [u8; 5] {
    *PROCESS_UNIQUE.get_or_init(|| {
        let bytes = random_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
    })
}

fn next_count() -> u32 {
    let counter = COUNTER.get_or_init(|| {
        let bytes = random_bytes();
        AtomicU32::new(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    });
    counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK
}

/// Error parsing an object id from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid object id '{input}': expected 24 hex characters")]
pub struct ObjectIdError {
    input: String,
}

/// Unique, roughly time-ordered document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generates a new identifier stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&timestamp_secs(Utc::now()).to_be_bytes());
        bytes[4..9].copy_from_slice(&process_unique());
        bytes[9..].copy_from_slice(&next_count().to_be_bytes()[1..]);
        Self(bytes)
    }

    /// Builds the smallest identifier for the given second.
    ///
    /// Useful as a watermark: every id generated at or after `at` compares
    /// greater than or equal to it.
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&timestamp_secs(at).to_be_bytes());
        Self(bytes)
    }

    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Parses the 24-character hex form.
    pub fn parse_str(input: &str) -> Result<Self, ObjectIdError> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(input, &mut bytes).map_err(|_| ObjectIdError {
            input: input.to_string(),
        })?;
        Ok(Self(bytes))
    }

    /// Lowercase 24-character hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Creation time encoded in the identifier, at second precision.
    #[must_use]
    pub fn generation_time(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
    }
}

fn timestamp_secs(at: DateTime<Utc>) -> u32 {
    u32::try_from(at.timestamp().max(0)).unwrap_or(u32::MAX)
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = ObjectIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_str(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_hex()
    }
}

/// Reference to a document in another collection by its object id.
///
/// Wire form: `{"ref": <collection>, "id": <hex id>}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbRef {
    /// Name of the referenced collection.
    pub collection: String,
    /// Primary key of the referenced document.
    pub id: ObjectId,
}

impl DbRef {
    /// Reference to `id` in `collection`.
    #[must_use]
    pub fn new(collection: impl Into<String>, id: ObjectId) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }
}

impl fmt::Display for DbRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DBRef({}, {})", self.collection, self.id)
    }
}
