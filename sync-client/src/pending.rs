//! Pending RPC call table.
//!
//! Maps an outbound message id to the one-shot channel its caller awaits.
//! Every entry is completed exactly once: removing it from the map and
//! sending on its channel happen together, so a late reply after a reset
//! finds nothing to resolve.

use std::time::Instant;

use dashmap::DashMap;
use inline_sync_types::{MessageId, Method, RpcResult};
use tokio::sync::oneshot;

use crate::error::RpcCallError;

/// Result delivered to a waiting caller.
pub type CallOutcome = Result<RpcResult, RpcCallError>;

struct PendingCall {
    method: Method,
    issued_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// Concurrency-safe map from message id to completion handle.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<MessageId, PendingCall>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Returns the receiver the caller awaits.
    ///
    /// A second registration under the same id replaces the first, whose
    /// caller sees `Stopped`.
    pub fn register(&self, id: MessageId, method: Method) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let previous = self.calls.insert(
            id,
            PendingCall {
                method,
                issued_at: Instant::now(),
                tx,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!("Replacing pending {} call {}", previous.method, id);
            let _ = previous.tx.send(Err(RpcCallError::Stopped));
        }
        rx
    }

    /// Complete the call for `id`. Returns false if no such call exists.
    pub fn resolve(&self, id: MessageId, outcome: CallOutcome) -> bool {
        match self.calls.remove(&id) {
            Some((_, call)) => {
                tracing::debug!(
                    "{} call {} completed in {}ms",
                    call.method,
                    id,
                    call.issued_at.elapsed().as_millis()
                );
                // The caller may have given up already.
                let _ = call.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the call for `id` without completing it (caller timed out).
    pub fn cancel(&self, id: MessageId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Fail every outstanding call. Returns how many were rejected.
    pub fn reject_all(&self) -> usize {
        let ids: Vec<MessageId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.tx.send(Err(RpcCallError::Stopped));
                rejected += 1;
            }
        }
        rejected
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// No outstanding calls.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inline_sync_types::{GetMeResult, User};

    fn me() -> RpcResult {
        RpcResult::GetMe(GetMeResult {
            user: User {
                id: 1,
                first_name: Some("Dena".into()),
                last_name: None,
                username: None,
            },
        })
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let table = PendingCalls::new();
        let id = MessageId::new(42);
        let rx = table.register(id, Method::GetMe);

        assert!(table.resolve(id, Ok(me())));
        assert!(!table.resolve(id, Ok(me())));

        assert_eq!(rx.await.unwrap().unwrap(), me());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_not_resolved() {
        let table = PendingCalls::new();
        assert!(!table.resolve(MessageId::new(7), Ok(me())));
    }

    #[tokio::test]
    async fn reject_all_stops_every_caller() {
        let table = PendingCalls::new();
        let a = table.register(MessageId::new(1), Method::GetMe);
        let b = table.register(MessageId::new(2), Method::GetUpdates);

        assert_eq!(table.reject_all(), 2);
        assert!(table.is_empty());
        assert!(matches!(a.await.unwrap(), Err(RpcCallError::Stopped)));
        assert!(matches!(b.await.unwrap(), Err(RpcCallError::Stopped)));

        // Late reply after reset finds nothing.
        assert!(!table.resolve(MessageId::new(1), Ok(me())));
    }

    #[tokio::test]
    async fn cancel_removes_without_completing() {
        let table = PendingCalls::new();
        let id = MessageId::new(9);
        let rx = table.register(id, Method::GetMe);

        assert!(table.cancel(id));
        assert_eq!(table.len(), 0);
        // Sender dropped without a value.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_stops_previous_caller() {
        let table = PendingCalls::new();
        let id = MessageId::new(3);
        let first = table.register(id, Method::GetMe);
        let second = table.register(id, Method::GetMe);

        assert!(matches!(first.await.unwrap(), Err(RpcCallError::Stopped)));
        assert_eq!(table.len(), 1);
        table.resolve(id, Ok(me()));
        assert!(second.await.unwrap().is_ok());
    }
}
