//! # inline-sync-client
//!
//! Realtime sync client for Inline chat.
//!
//! Keeps one authenticated session to the realtime endpoint and keeps local
//! state consistent with the server's per-bucket update streams.
//!
//! ## Features
//!
//! - **Connection Manager**: pure state machine from sync-core, driven by an actor
//!   with timers, backoff, and constraint tracking
//! - **Protocol Session**: handshake, RPC correlation, pushes, acks, and heartbeat
//! - **Sync Engine**: gap detection, bounded fetches, catch-up, and
//!   crash-safe watermarks
//! - **Pluggable edges**: [`Transport`], [`SyncStorage`], and [`DomainApply`]
//!
//! ## Example
//!
//! ```ignore
//! use inline_sync_client::{ClientConfig, MemoryDomain, RealtimeClient, SqliteSyncStorage};
//!
//! let config = ClientConfig::default().apply_env();
//! let storage = Arc::new(SqliteSyncStorage::open(&db_path).await?);
//! let client = RealtimeClient::websocket(config, storage, Arc::new(MemoryDomain::new()));
//! client.start();
//!
//! let mut events = client.subscribe_sync();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
mod heartbeat;
pub mod manager;
pub mod pending;
pub mod session;
pub mod storage;
pub mod transport;

pub use apply::{AppliedResult, DomainApply, MemoryDomain};
pub use client::{ClientError, RealtimeClient};
pub use config::{ClientConfig, ConfigError};
pub use engine::{
    CatchupMessagePolicy, SyncEngine, SyncEvent, SyncHandle, SyncPolicy, UpdatesApi,
};
pub use error::{ApplyError, RpcCallError, StorageError};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use session::{ProtocolSession, SessionConfig, SessionEvent};
pub use storage::{MemorySyncStorage, SqliteSyncStorage, SyncStorage};
pub use transport::{MockTransport, Transport, TransportError, WebSocketTransport};

pub use inline_sync_core::{
    ApplyMode, BucketState, ConnectionPolicy, ConnectionSnapshot, ConnectionState, Reason,
    SyncState,
};
