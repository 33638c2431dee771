//! Envelopes - the wire format wrappers for every frame on the realtime channel.
//!
//! Frames are binary MessagePack. The client sends [`ClientMessage`]s and
//! receives [`ServerMessage`]s.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    describe_rpc_error, MessageId, Method, RpcErrorCode, RpcInput, RpcResult, UpdatesBatch,
    WireError,
};

/// Protocol layer announced in the connection-init handshake.
pub const PROTOCOL_LAYER: u32 = 1;

/// An opaque bearer token. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// First frame on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInit {
    /// Bearer token
    pub token: AuthToken,
    /// Client build, informational
    pub client_version: Option<String>,
    /// Protocol layer the client speaks
    pub layer: u32,
}

/// An RPC invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    /// Method being called
    pub method: Method,
    /// Method input
    pub input: RpcInput,
}

/// Delivery confirmation for a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The acknowledged message
    pub msg_id: MessageId,
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Random value the server echoes back
    pub nonce: u64,
}

/// Liveness reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Nonce from the matching ping
    pub nonce: u64,
}

/// Body of a client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientBody {
    /// Authentication handshake
    ConnectionInit(ConnectionInit),
    /// RPC invocation
    RpcCall(RpcCall),
    /// Delivery confirmation
    Ack(Ack),
    /// Liveness probe
    Ping(Ping),
}

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Fresh id from the session's generator
    pub id: MessageId,
    /// Session-local send counter
    pub seq: u32,
    /// Payload
    pub body: ClientBody,
}

impl ClientMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Short name of the body variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self.body {
            ClientBody::ConnectionInit(_) => "connection_init",
            ClientBody::RpcCall(_) => "rpc_call",
            ClientBody::Ack(_) => "ack",
            ClientBody::Ping(_) => "ping",
        }
    }
}

/// Server rejection of the connection-init handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionError {
    /// Why the connection was refused, if the server said
    pub reason: Option<String>,
}

/// Successful reply to an RPC call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResultMessage {
    /// Id of the originating `RpcCall` frame
    pub req_msg_id: MessageId,
    /// Method result
    pub result: RpcResult,
}

/// Failed reply to an RPC call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorMessage {
    /// Id of the originating `RpcCall` frame
    pub req_msg_id: MessageId,
    /// Error code
    pub error_code: RpcErrorCode,
    /// Server message
    pub message: String,
    /// HTTP-style status, 0 if absent
    pub status: i32,
}

impl RpcErrorMessage {
    /// Human-readable rendering.
    pub fn describe(&self) -> String {
        describe_rpc_error(self.error_code, &self.message, self.status)
    }
}

/// Unsolicited server payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerPush {
    /// Pushed updates
    Updates(UpdatesBatch),
}

/// Body of a server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerBody {
    /// Handshake accepted
    ConnectionOpen,
    /// Handshake refused
    ConnectionError(ConnectionError),
    /// RPC success
    RpcResult(RpcResultMessage),
    /// RPC failure
    RpcError(RpcErrorMessage),
    /// Push payload
    Message(ServerPush),
    /// Delivery confirmation
    Ack(Ack),
    /// Liveness reply
    Pong(Pong),
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Server-generated id (same packing as client ids)
    pub id: MessageId,
    /// Payload
    pub body: ServerBody,
}

impl ServerMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Short name of the body variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self.body {
            ServerBody::ConnectionOpen => "connection_open",
            ServerBody::ConnectionError(_) => "connection_error",
            ServerBody::RpcResult(_) => "rpc_result",
            ServerBody::RpcError(_) => "rpc_error",
            ServerBody::Message(_) => "message",
            ServerBody::Ack(_) => "ack",
            ServerBody::Pong(_) => "pong",
        }
    }
}
