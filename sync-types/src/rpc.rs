//! RPC method catalog.
//!
//! Each [`Method`] has one input and one result shape. The catalog is
//! extensible; the update-fetch methods are consumed by the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BucketKey, Seq, Update};

/// RPC method discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Fetch the signed-in user
    GetMe,
    /// Post a message to a chat
    SendMessage,
    /// Fetch a seq range of one bucket
    GetUpdates,
    /// List buckets that changed since a date
    GetUpdatesState,
    /// Fetch the freshest window of one bucket
    GetHistory,
}

impl Method {
    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetMe => "GET_ME",
            Method::SendMessage => "SEND_MESSAGE",
            Method::GetUpdates => "GET_UPDATES",
            Method::GetUpdatesState => "GET_UPDATES_STATE",
            Method::GetHistory => "GET_HISTORY",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for [`Method::GetMe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetMeInput {}

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: i64,
    /// First name
    pub first_name: Option<String>,
    /// Last name
    pub last_name: Option<String>,
    /// Public username
    pub username: Option<String>,
}

/// Result of [`Method::GetMe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMeResult {
    /// The signed-in user
    pub user: User,
}

/// Input for [`Method::SendMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageInput {
    /// Target chat
    pub chat_id: i64,
    /// Text body
    pub text: Option<String>,
    /// Message being replied to
    pub reply_to_msg_id: Option<i64>,
    /// Client-chosen id for matching the echoed update
    pub random_id: i64,
}

/// Result of [`Method::SendMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResult {
    /// Updates the send produced, in bucket order
    pub updates: Vec<Update>,
}

/// Input for [`Method::GetUpdates`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesInput {
    /// Bucket to read
    pub bucket: BucketKey,
    /// First seq wanted (inclusive)
    pub start_seq: Seq,
    /// Stop before this seq; `None` reads up to the head
    pub end_seq: Option<Seq>,
    /// Maximum number of updates to return
    pub total_limit: u32,
}

/// How a [`GetUpdatesResult`] relates to the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetUpdatesResultType {
    /// Nothing in range
    Empty,
    /// Some or all of the range
    Slice,
    /// The range is too large to serve incrementally; repair instead
    TooLong,
}

/// Result of [`Method::GetUpdates`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesResult {
    /// Updates in ascending seq order
    pub updates: Vec<Update>,
    /// Server head seq for the bucket
    pub seq: Seq,
    /// Server date for the bucket head
    pub date: i64,
    /// No further updates exist past this slice
    pub is_final: bool,
    /// Slice classification
    pub result_type: GetUpdatesResultType,
}

/// Input for [`Method::GetUpdatesState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesStateInput {
    /// Only list buckets changed after this unix date (seconds); 0 lists all
    pub since_date: i64,
}

/// Head of one bucket as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketHead {
    /// The bucket
    pub bucket: BucketKey,
    /// Latest seq
    pub seq: Seq,
    /// Date of the latest update
    pub date: i64,
}

/// Result of [`Method::GetUpdatesState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesStateResult {
    /// Server date; never lower than any date previously returned
    pub date: i64,
    /// Changed buckets
    pub buckets: Vec<BucketHead>,
}

/// Input for [`Method::GetHistory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHistoryInput {
    /// Bucket to read
    pub bucket: BucketKey,
    /// Window size
    pub limit: u32,
}

/// Result of [`Method::GetHistory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHistoryResult {
    /// Freshest updates in ascending seq order
    pub updates: Vec<Update>,
    /// Oldest seq covered by the window
    pub from_seq: Seq,
    /// Server head seq
    pub seq: Seq,
    /// Server date for the head
    pub date: i64,
}

/// RPC input, one variant per method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcInput {
    /// [`Method::GetMe`]
    GetMe(GetMeInput),
    /// [`Method::SendMessage`]
    SendMessage(SendMessageInput),
    /// [`Method::GetUpdates`]
    GetUpdates(GetUpdatesInput),
    /// [`Method::GetUpdatesState`]
    GetUpdatesState(GetUpdatesStateInput),
    /// [`Method::GetHistory`]
    GetHistory(GetHistoryInput),
}

impl RpcInput {
    /// The method this input belongs to.
    pub fn method(&self) -> Method {
        match self {
            RpcInput::GetMe(_) => Method::GetMe,
            RpcInput::SendMessage(_) => Method::SendMessage,
            RpcInput::GetUpdates(_) => Method::GetUpdates,
            RpcInput::GetUpdatesState(_) => Method::GetUpdatesState,
            RpcInput::GetHistory(_) => Method::GetHistory,
        }
    }
}

/// RPC result, one variant per method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResult {
    /// [`Method::GetMe`]
    GetMe(GetMeResult),
    /// [`Method::SendMessage`]
    SendMessage(SendMessageResult),
    /// [`Method::GetUpdates`]
    GetUpdates(GetUpdatesResult),
    /// [`Method::GetUpdatesState`]
    GetUpdatesState(GetUpdatesStateResult),
    /// [`Method::GetHistory`]
    GetHistory(GetHistoryResult),
}

impl RpcResult {
    /// The method this result answers.
    pub fn method(&self) -> Method {
        match self {
            RpcResult::GetMe(_) => Method::GetMe,
            RpcResult::SendMessage(_) => Method::SendMessage,
            RpcResult::GetUpdates(_) => Method::GetUpdates,
            RpcResult::GetUpdatesState(_) => Method::GetUpdatesState,
            RpcResult::GetHistory(_) => Method::GetHistory,
        }
    }
}
