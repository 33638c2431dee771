//! Transport abstraction for the realtime channel.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (WebSocket, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection (connecting → connected)
//! - `send()` transmits one binary frame
//! - `recv()` waits for the next binary frame (message)
//! - `close()` gracefully terminates (stopping)
//!
//! An error from `recv()` means the connection is gone.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect("wss://example.invalid/realtime").await?;
//! transport.send(&frame).await?;
//! let reply = transport.recv().await?;
//! ```

mod mock;
mod websocket;

pub use mock::{MockTransport, Responder};
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// Transport trait for exchanging binary protocol frames.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc). `send` and `recv` may run concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the endpoint at `address`.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one binary frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next binary frame.
    ///
    /// Waits until a frame arrives or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
