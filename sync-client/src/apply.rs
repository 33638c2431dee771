//! Domain apply interface.
//!
//! The engine hands every sequenced update to a [`DomainApply`]. The
//! implementation upserts idempotently and reports whether the entity was
//! already present, which the engine uses to gate side effects.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use inline_sync_core::ApplyMode;
use inline_sync_types::{BucketKey, MessageRecord, Update, UpdatePayload};

use crate::error::ApplyError;

/// Result of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedResult {
    /// The entity was already stored; no user-visible side effects.
    pub already_existed: bool,
}

/// Applies updates to the local domain store.
#[async_trait]
pub trait DomainApply: Send + Sync + 'static {
    /// Upsert the effect of `update`.
    async fn apply(&self, update: &Update, mode: ApplyMode) -> Result<AppliedResult, ApplyError>;

    /// Drop locally cached state for `bucket` before a history window
    /// replaces it.
    async fn reset_bucket(&self, bucket: BucketKey) -> Result<(), ApplyError>;
}

#[derive(Debug, Default)]
struct Store {
    /// Messages keyed by (chat_id, message_id).
    messages: BTreeMap<(i64, i64), MessageRecord>,
    /// Highest read message id per chat.
    read_max: BTreeMap<i64, i64>,
    /// Chats whose metadata needs a refresh.
    stale_chats: HashSet<i64>,
    /// Side effects that reached the user-visible path.
    side_effects: Vec<(i64, i64)>,
    applied: usize,
}

/// Reference [`DomainApply`] backed by in-process maps.
///
/// Counts user-visible side effects so tests can check that a refetch
/// never notifies twice.
#[derive(Debug, Default)]
pub struct MemoryDomain {
    store: Mutex<Store>,
    fail_next: AtomicBool,
}

impl MemoryDomain {
    /// Create an empty domain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next apply fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Stored message.
    pub fn message(&self, chat_id: i64, message_id: i64) -> Option<MessageRecord> {
        self.lock().messages.get(&(chat_id, message_id)).cloned()
    }

    /// Message ids stored for a chat, ascending.
    pub fn message_ids(&self, chat_id: i64) -> Vec<i64> {
        self.lock()
            .messages
            .range((chat_id, i64::MIN)..=(chat_id, i64::MAX))
            .map(|((_, id), _)| *id)
            .collect()
    }

    /// Highest read message id for a chat.
    pub fn read_max(&self, chat_id: i64) -> Option<i64> {
        self.lock().read_max.get(&chat_id).copied()
    }

    /// Whether a chat was flagged for a metadata refresh.
    pub fn chat_is_stale(&self, chat_id: i64) -> bool {
        self.lock().stale_chats.contains(&chat_id)
    }

    /// (chat_id, message_id) pairs that triggered notifications.
    pub fn side_effects(&self) -> Vec<(i64, i64)> {
        self.lock().side_effects.clone()
    }

    /// Number of successful apply calls.
    pub fn applied_count(&self) -> usize {
        self.lock().applied
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DomainApply for MemoryDomain {
    async fn apply(&self, update: &Update, mode: ApplyMode) -> Result<AppliedResult, ApplyError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ApplyError::Failed(format!(
                "{} seq {} rejected",
                update.bucket, update.seq
            )));
        }

        let mut store = self.lock();
        store.applied += 1;
        let already_existed = match &update.payload {
            UpdatePayload::NewMessage(message) => {
                let key = (message.chat_id, message.id);
                let existed = store.messages.insert(key, message.clone()).is_some();
                // Catch-up never notifies; push only for net-new messages.
                if !existed && mode == ApplyMode::Push {
                    store.side_effects.push(key);
                }
                existed
            }
            UpdatePayload::EditMessage(message) => {
                let key = (message.chat_id, message.id);
                match store.messages.get_mut(&key) {
                    Some(stored) if stored == message => true,
                    Some(stored) => {
                        *stored = message.clone();
                        false
                    }
                    None => {
                        return Err(ApplyError::MissingDependency(format!(
                            "message {} in chat {}",
                            message.id, message.chat_id
                        )))
                    }
                }
            }
            UpdatePayload::DeleteMessages {
                chat_id,
                message_ids,
            } => {
                let mut removed = false;
                for id in message_ids {
                    removed |= store.messages.remove(&(*chat_id, *id)).is_some();
                }
                !removed
            }
            UpdatePayload::ReadInbox { chat_id, max_id } => {
                let current = store.read_max.entry(*chat_id).or_insert(0);
                if *max_id > *current {
                    *current = *max_id;
                    false
                } else {
                    true
                }
            }
            UpdatePayload::ChatChanged { chat_id } => !store.stale_chats.insert(*chat_id),
        };

        Ok(AppliedResult { already_existed })
    }

    async fn reset_bucket(&self, bucket: BucketKey) -> Result<(), ApplyError> {
        let mut store = self.lock();
        match bucket {
            BucketKey::Chat(chat_id) => {
                store.messages.retain(|(chat, _), _| *chat != chat_id);
                store.read_max.remove(&chat_id);
            }
            BucketKey::Space(_) | BucketKey::User => {
                store.stale_chats.clear();
            }
        }
        tracing::debug!("Reset local state for {}", bucket);
        Ok(())
    }
}
