//! Sync watermark persistence.
//!
//! The engine is the only writer. It keeps the in-memory watermark
//! authoritative and treats a failed write as something to retry on the
//! next flush.

mod memory;
mod sqlite;

pub use memory::MemorySyncStorage;
pub use sqlite::SqliteSyncStorage;

use std::collections::HashMap;

use async_trait::async_trait;
use inline_sync_core::{BucketState, SyncState};
use inline_sync_types::BucketKey;

use crate::error::StorageError;

/// Persistence for [`SyncState`] and per-bucket [`BucketState`].
#[async_trait]
pub trait SyncStorage: Send + Sync + 'static {
    /// Load the global watermark.
    async fn get_state(&self) -> Result<SyncState, StorageError>;

    /// Store the global watermark.
    async fn set_state(&self, state: SyncState) -> Result<(), StorageError>;

    /// Load one bucket's watermark; a bucket never seen starts at zero.
    async fn get_bucket_state(&self, bucket: BucketKey) -> Result<BucketState, StorageError>;

    /// Store one bucket's watermark.
    async fn set_bucket_state(
        &self,
        bucket: BucketKey,
        state: BucketState,
    ) -> Result<(), StorageError>;

    /// Store several watermarks. Either all of them land or none do.
    async fn set_bucket_states(
        &self,
        states: &HashMap<BucketKey, BucketState>,
    ) -> Result<(), StorageError>;

    /// Forget every watermark (sign-out).
    async fn clear_sync_state(&self) -> Result<(), StorageError>;
}
