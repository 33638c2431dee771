//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use inline_sync_core::{BucketState, SyncState};
use inline_sync_types::BucketKey;

use super::SyncStorage;
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Inner {
    state: SyncState,
    buckets: HashMap<BucketKey, BucketState>,
}

/// Watermarks held in process memory.
///
/// Useful for tests and for clients that resync from scratch on every
/// launch. Writes can be made to fail to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemorySyncStorage {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemorySyncStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Watermark for `bucket` without going through the async trait.
    pub fn bucket(&self, bucket: BucketKey) -> Option<BucketState> {
        self.lock().buckets.get(&bucket).copied()
    }

    /// Global watermark without going through the async trait.
    pub fn state(&self) -> SyncState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SyncStorage for MemorySyncStorage {
    async fn get_state(&self) -> Result<SyncState, StorageError> {
        Ok(self.lock().state)
    }

    async fn set_state(&self, state: SyncState) -> Result<(), StorageError> {
        self.check_writable()?;
        self.lock().state = state;
        Ok(())
    }

    async fn get_bucket_state(&self, bucket: BucketKey) -> Result<BucketState, StorageError> {
        Ok(self.lock().buckets.get(&bucket).copied().unwrap_or_default())
    }

    async fn set_bucket_state(
        &self,
        bucket: BucketKey,
        state: BucketState,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        self.lock().buckets.insert(bucket, state);
        Ok(())
    }

    async fn set_bucket_states(
        &self,
        states: &HashMap<BucketKey, BucketState>,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.lock();
        for (bucket, state) in states {
            inner.buckets.insert(*bucket, *state);
        }
        Ok(())
    }

    async fn clear_sync_state(&self) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.lock();
        inner.state = SyncState::default();
        inner.buckets.clear();
        Ok(())
    }
}
