//! Identity and ordering types for the realtime protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::WireError;

/// Epoch shared by client and server message IDs (2025-01-01T00:00:00Z, in ms).
pub const ID_EPOCH_MS: u64 = 1_735_689_600_000;

const SEQUENCE_BITS: u32 = 22;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// A 64-bit protocol message identifier.
///
/// Packed as `(unix_ms - ID_EPOCH_MS) << 22 | sequence`. Both peers use the
/// same packing, so IDs from either side sort by generation time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct MessageId(u64);

impl MessageId {
    /// Create a MessageId from its raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Pack a MessageId from a unix timestamp (ms) and a per-millisecond sequence.
    pub fn from_parts(unix_ms: u64, sequence: u32) -> Self {
        let elapsed = unix_ms.saturating_sub(ID_EPOCH_MS);
        Self((elapsed << SEQUENCE_BITS) | (u64::from(sequence) & SEQUENCE_MASK))
    }

    /// Get the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Unix timestamp (ms) at which this ID was generated.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> SEQUENCE_BITS) + ID_EPOCH_MS
    }

    /// Per-millisecond sequence component.
    pub fn sequence(&self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

/// Generates monotonic [`MessageId`]s for one session generation.
#[derive(Debug, Clone, Default)]
pub struct MessageIdGenerator {
    last_ms: u64,
    sequence: u32,
}

impl MessageIdGenerator {
    /// Create a fresh generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next ID from the wall clock.
    pub fn next_id(&mut self) -> MessageId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(ID_EPOCH_MS);
        self.next_at(now_ms)
    }

    /// Generate the next ID for the given unix timestamp (ms).
    ///
    /// A timestamp at or before the previous one counts as the same
    /// millisecond, so a clock stepping backwards never reorders IDs.
    pub fn next_at(&mut self, unix_ms: u64) -> MessageId {
        if unix_ms > self.last_ms {
            self.last_ms = unix_ms;
            self.sequence = 0;
        } else {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK as u32;
        }
        MessageId::from_parts(self.last_ms, self.sequence)
    }

    /// Forget all history. Called when the session resets.
    pub fn reset(&mut self) {
        self.last_ms = 0;
        self.sequence = 0;
    }
}

/// A per-bucket sequence number assigned by the server.
///
/// Strictly increasing within one bucket. `Seq::ZERO` means nothing has
/// been applied yet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Seq(u64);

impl Seq {
    /// The "nothing applied" sequence.
    pub const ZERO: Seq = Seq(0);

    /// Create a Seq with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The sequence immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

/// An independent ordering domain with its own strictly increasing seq.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BucketKey {
    /// One chat (direct or thread).
    Chat(i64),
    /// Space-level changes (membership, chat list).
    Space(i64),
    /// Account-level changes for the signed-in user.
    User,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::Chat(id) => write!(f, "chat:{id}"),
            BucketKey::Space(id) => write!(f, "space:{id}"),
            BucketKey::User => write!(f, "user"),
        }
    }
}

impl FromStr for BucketKey {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "user" {
            return Ok(BucketKey::User);
        }
        let invalid = || WireError::InvalidData(format!("invalid bucket key: {s}"));
        let (kind, id) = s.split_once(':').ok_or_else(invalid)?;
        let id: i64 = id.parse().map_err(|_| invalid())?;
        match kind {
            "chat" => Ok(BucketKey::Chat(id)),
            "space" => Ok(BucketKey::Space(id)),
            _ => Err(invalid()),
        }
    }
}
