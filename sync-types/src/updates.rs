//! Server-ordered updates.
//!
//! Every update belongs to exactly one [`BucketKey`] and carries the
//! bucket-local [`Seq`] the server assigned to it.

use serde::{Deserialize, Serialize};

use crate::{BucketKey, Seq};

/// A message as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Chat-local message id
    pub id: i64,
    /// Owning chat
    pub chat_id: i64,
    /// Author user id
    pub from_id: i64,
    /// Unix timestamp (seconds)
    pub date: i64,
    /// Text body, if any
    pub text: Option<String>,
    /// Client-chosen id used to match optimistic sends
    pub random_id: Option<i64>,
    /// Message this one replies to
    pub reply_to_msg_id: Option<i64>,
}

/// The mutation carried by an [`Update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// A message was posted
    NewMessage(MessageRecord),
    /// A message was edited
    EditMessage(MessageRecord),
    /// Messages were deleted
    DeleteMessages {
        /// Owning chat
        chat_id: i64,
        /// Deleted message ids
        message_ids: Vec<i64>,
    },
    /// The reader's inbox was read up to `max_id`
    ReadInbox {
        /// Owning chat
        chat_id: i64,
        /// Highest message id read
        max_id: i64,
    },
    /// Chat metadata changed; the client should refresh it
    ChatChanged {
        /// Changed chat
        chat_id: i64,
    },
}

/// Discriminant of [`UpdatePayload`], used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// [`UpdatePayload::NewMessage`]
    NewMessage,
    /// [`UpdatePayload::EditMessage`]
    EditMessage,
    /// [`UpdatePayload::DeleteMessages`]
    DeleteMessages,
    /// [`UpdatePayload::ReadInbox`]
    ReadInbox,
    /// [`UpdatePayload::ChatChanged`]
    ChatChanged,
}

/// One server-ordered mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Ordering domain
    pub bucket: BucketKey,
    /// Bucket-local sequence number
    pub seq: Seq,
    /// Unix timestamp (seconds) the server recorded the update
    pub date: i64,
    /// The mutation
    pub payload: UpdatePayload,
}

impl Update {
    /// Which kind of mutation this is.
    pub fn kind(&self) -> UpdateKind {
        match self.payload {
            UpdatePayload::NewMessage(_) => UpdateKind::NewMessage,
            UpdatePayload::EditMessage(_) => UpdateKind::EditMessage,
            UpdatePayload::DeleteMessages { .. } => UpdateKind::DeleteMessages,
            UpdatePayload::ReadInbox { .. } => UpdateKind::ReadInbox,
            UpdatePayload::ChatChanged { .. } => UpdateKind::ChatChanged,
        }
    }
}

/// A batch of updates pushed by the server in one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesBatch {
    /// Updates, possibly spanning several buckets
    pub updates: Vec<Update>,
}
