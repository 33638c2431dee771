//! Error types for the realtime protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Error codes the server attaches to an `RpcError` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RpcErrorCode {
    /// Code not known to this client
    Unknown(i32),
    /// Malformed or invalid input
    BadRequest,
    /// Token missing, expired, or revoked
    Unauthenticated,
    /// Too many requests
    RateLimited,
    /// Server-side failure
    InternalError,
    /// Peer does not exist or is not visible
    PeerIdInvalid,
    /// Message does not exist
    MessageIdInvalid,
    /// User does not exist
    UserIdInvalid,
    /// User is already a participant
    UserAlreadyParticipant,
    /// Space does not exist
    SpaceIdInvalid,
    /// Chat does not exist
    ChatIdInvalid,
    /// Email address rejected
    EmailInvalid,
    /// Phone number rejected
    PhoneNumberInvalid,
    /// Caller must be a space admin
    SpaceAdminRequired,
    /// Caller must be the space owner
    SpaceOwnerRequired,
}

impl RpcErrorCode {
    /// Numeric code on the wire.
    pub fn code(&self) -> i32 {
        match self {
            RpcErrorCode::Unknown(code) => *code,
            RpcErrorCode::BadRequest => 1,
            RpcErrorCode::Unauthenticated => 2,
            RpcErrorCode::RateLimited => 3,
            RpcErrorCode::InternalError => 4,
            RpcErrorCode::PeerIdInvalid => 5,
            RpcErrorCode::MessageIdInvalid => 6,
            RpcErrorCode::UserIdInvalid => 7,
            RpcErrorCode::UserAlreadyParticipant => 8,
            RpcErrorCode::SpaceIdInvalid => 9,
            RpcErrorCode::ChatIdInvalid => 10,
            RpcErrorCode::EmailInvalid => 11,
            RpcErrorCode::PhoneNumberInvalid => 12,
            RpcErrorCode::SpaceAdminRequired => 13,
            RpcErrorCode::SpaceOwnerRequired => 14,
        }
    }

    /// Short human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            RpcErrorCode::Unknown(_) => "Unknown RPC error",
            RpcErrorCode::BadRequest => "Bad request",
            RpcErrorCode::Unauthenticated => "Not authenticated",
            RpcErrorCode::RateLimited => "Rate limited",
            RpcErrorCode::InternalError => "Internal server error",
            RpcErrorCode::PeerIdInvalid => "Invalid peer",
            RpcErrorCode::MessageIdInvalid => "Invalid message id",
            RpcErrorCode::UserIdInvalid => "Invalid user id",
            RpcErrorCode::UserAlreadyParticipant => "User already in chat/space",
            RpcErrorCode::SpaceIdInvalid => "Invalid space id",
            RpcErrorCode::ChatIdInvalid => "Invalid chat id",
            RpcErrorCode::EmailInvalid => "Invalid email address",
            RpcErrorCode::PhoneNumberInvalid => "Invalid phone number",
            RpcErrorCode::SpaceAdminRequired => "Space admin required",
            RpcErrorCode::SpaceOwnerRequired => "Space owner required",
        }
    }
}

impl From<i32> for RpcErrorCode {
    fn from(code: i32) -> Self {
        match code {
            1 => RpcErrorCode::BadRequest,
            2 => RpcErrorCode::Unauthenticated,
            3 => RpcErrorCode::RateLimited,
            4 => RpcErrorCode::InternalError,
            5 => RpcErrorCode::PeerIdInvalid,
            6 => RpcErrorCode::MessageIdInvalid,
            7 => RpcErrorCode::UserIdInvalid,
            8 => RpcErrorCode::UserAlreadyParticipant,
            9 => RpcErrorCode::SpaceIdInvalid,
            10 => RpcErrorCode::ChatIdInvalid,
            11 => RpcErrorCode::EmailInvalid,
            12 => RpcErrorCode::PhoneNumberInvalid,
            13 => RpcErrorCode::SpaceAdminRequired,
            14 => RpcErrorCode::SpaceOwnerRequired,
            other => RpcErrorCode::Unknown(other),
        }
    }
}

impl From<RpcErrorCode> for i32 {
    fn from(code: RpcErrorCode) -> Self {
        code.code()
    }
}

/// Render an RPC error for display.
///
/// `"<label>: <message> (HTTP <status>)"`, where the message is omitted when
/// empty or equal to the label and the status is omitted when zero.
pub fn describe_rpc_error(code: RpcErrorCode, message: &str, status: i32) -> String {
    let label = code.label();
    let message = message.trim();
    let mut text = if message.is_empty() || message == label {
        label.to_string()
    } else {
        format!("{label}: {message}")
    };
    if status != 0 {
        text.push_str(&format!(" (HTTP {status})"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::InvalidData("bad bucket".into());
        assert_eq!(err.to_string(), "invalid data: bad bucket");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }

    #[test]
    fn rpc_error_code_numbers_roundtrip() {
        for n in 1..=14 {
            let code = RpcErrorCode::from(n);
            assert_ne!(code, RpcErrorCode::Unknown(n));
            assert_eq!(code.code(), n);
        }
        assert_eq!(RpcErrorCode::from(99), RpcErrorCode::Unknown(99));
    }

    #[test]
    fn describe_appends_message_and_status() {
        let text = describe_rpc_error(RpcErrorCode::RateLimited, "slow down", 429);
        assert_eq!(text, "Rate limited: slow down (HTTP 429)");
    }

    #[test]
    fn describe_skips_empty_or_duplicate_message() {
        assert_eq!(
            describe_rpc_error(RpcErrorCode::BadRequest, "", 0),
            "Bad request"
        );
        assert_eq!(
            describe_rpc_error(RpcErrorCode::BadRequest, "Bad request", 400),
            "Bad request (HTTP 400)"
        );
    }

    #[test]
    fn describe_unknown_code() {
        assert_eq!(
            describe_rpc_error(RpcErrorCode::from(77), "teapot", 0),
            "Unknown RPC error: teapot"
        );
    }
}
