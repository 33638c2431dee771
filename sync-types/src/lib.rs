//! # sync-types
//!
//! Wire format types for the Inline realtime protocol.
//!
//! This crate provides the foundational types used across all inline-sync crates:
//! - [`MessageId`], [`Seq`], [`BucketKey`] - Identity and ordering types
//! - [`ClientMessage`], [`ServerMessage`] - Envelopes carried over the binary channel
//! - [`RpcInput`], [`RpcResult`] - The RPC method catalog
//! - [`Update`] - Server-ordered mutations delivered per bucket
//! - [`WireError`], [`RpcErrorCode`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod rpc;
mod updates;

pub use envelope::{
    Ack, AuthToken, ClientBody, ClientMessage, ConnectionError, ConnectionInit, Ping, Pong,
    RpcCall, RpcErrorMessage, RpcResultMessage, ServerBody, ServerMessage, ServerPush,
    PROTOCOL_LAYER,
};
pub use error::{describe_rpc_error, RpcErrorCode, WireError};
pub use ids::{BucketKey, MessageId, MessageIdGenerator, Seq, ID_EPOCH_MS};
pub use rpc::{
    BucketHead, GetHistoryInput, GetHistoryResult, GetMeInput, GetMeResult, GetUpdatesInput,
    GetUpdatesResult, GetUpdatesResultType, GetUpdatesStateInput, GetUpdatesStateResult, Method,
    RpcInput, RpcResult, SendMessageInput, SendMessageResult, User,
};
pub use updates::{MessageRecord, Update, UpdateKind, UpdatePayload, UpdatesBatch};
