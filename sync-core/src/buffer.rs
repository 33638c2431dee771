//! Out-of-order update buffer.
//!
//! Holds pushed updates that arrived ahead of a bucket's expected seq:
//! - Keyed by seq, so exact repeats collapse into one entry
//! - Drained in ascending seq order once the gap closes
//! - Max size limit to prevent unbounded memory growth
//!
//! Refusing an update when full is safe: the bucket cursor has not moved,
//! so the gap fetch delivers it again.

use inline_sync_types::{Seq, Update};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::ApplyMode;

/// Error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Buffer is at capacity.
    #[error("buffer full (capacity: {capacity})")]
    Full {
        /// Current buffer capacity.
        capacity: usize,
    },
}

/// Outcome of [`UpdateBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// First copy of this seq.
    New,
    /// An update with this seq was already buffered; the new copy was dropped.
    Repeat,
}

/// Buffered updates for one bucket, ordered by seq.
#[derive(Debug, Clone)]
pub struct UpdateBuffer {
    max_size: usize,
    entries: BTreeMap<Seq, (Update, ApplyMode)>,
}

impl UpdateBuffer {
    /// Create a new buffer with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: BTreeMap::new(),
        }
    }

    /// Buffer an update.
    pub fn insert(&mut self, update: Update, mode: ApplyMode) -> Result<Inserted, BufferError> {
        if self.entries.contains_key(&update.seq) {
            return Ok(Inserted::Repeat);
        }
        if self.entries.len() >= self.max_size {
            return Err(BufferError::Full {
                capacity: self.max_size,
            });
        }
        self.entries.insert(update.seq, (update, mode));
        Ok(Inserted::New)
    }

    /// Put an update back regardless of capacity.
    ///
    /// Used when applying a popped update failed; it must not be lost.
    pub fn restore(&mut self, update: Update, mode: ApplyMode) {
        self.entries.insert(update.seq, (update, mode));
    }

    /// Lowest buffered seq.
    pub fn first_seq(&self) -> Option<Seq> {
        self.entries.keys().next().copied()
    }

    /// Highest buffered seq.
    pub fn last_seq(&self) -> Option<Seq> {
        self.entries.keys().next_back().copied()
    }

    /// Remove and return the update at `seq` if it is the lowest entry.
    pub fn pop_if_first(&mut self, seq: Seq) -> Option<(Update, ApplyMode)> {
        if self.first_seq() == Some(seq) {
            self.entries.remove(&seq)
        } else {
            None
        }
    }

    /// Drop every entry at or below `seq`. Returns how many were dropped.
    pub fn drop_through(&mut self, seq: Seq) -> usize {
        let keep = self.entries.split_off(&seq.next());
        let dropped = self.entries.len();
        self.entries = keep;
        dropped
    }

    /// Check whether `seq` is buffered.
    pub fn contains(&self, seq: Seq) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Number of buffered updates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all buffered updates.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inline_sync_types::{BucketKey, UpdatePayload};

    fn update(seq: u64) -> Update {
        Update {
            bucket: BucketKey::Chat(1),
            seq: Seq::new(seq),
            date: 1_700_000_000 + seq as i64,
            payload: UpdatePayload::ChatChanged { chat_id: 1 },
        }
    }

    #[test]
    fn buffer_orders_by_seq() {
        let mut buffer = UpdateBuffer::new(10);
        buffer.insert(update(9), ApplyMode::Push).unwrap();
        buffer.insert(update(4), ApplyMode::Push).unwrap();
        buffer.insert(update(6), ApplyMode::Push).unwrap();

        assert_eq!(buffer.first_seq(), Some(Seq::new(4)));
        assert_eq!(buffer.last_seq(), Some(Seq::new(9)));
    }

    #[test]
    fn buffer_collapses_repeats() {
        let mut buffer = UpdateBuffer::new(10);
        assert_eq!(
            buffer.insert(update(5), ApplyMode::Push).unwrap(),
            Inserted::New
        );
        assert_eq!(
            buffer.insert(update(5), ApplyMode::Catchup).unwrap(),
            Inserted::Repeat
        );
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn buffer_respects_max_size() {
        let mut buffer = UpdateBuffer::new(2);
        buffer.insert(update(2), ApplyMode::Push).unwrap();
        buffer.insert(update(3), ApplyMode::Push).unwrap();
        let overflow = buffer.insert(update(4), ApplyMode::Push);

        assert_eq!(overflow, Err(BufferError::Full { capacity: 2 }));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn repeat_is_accepted_when_full() {
        let mut buffer = UpdateBuffer::new(1);
        buffer.insert(update(2), ApplyMode::Push).unwrap();
        assert_eq!(
            buffer.insert(update(2), ApplyMode::Push),
            Ok(Inserted::Repeat)
        );
    }

    #[test]
    fn pop_only_the_expected_seq() {
        let mut buffer = UpdateBuffer::new(10);
        buffer.insert(update(3), ApplyMode::Push).unwrap();

        assert!(buffer.pop_if_first(Seq::new(2)).is_none());
        let (popped, mode) = buffer.pop_if_first(Seq::new(3)).unwrap();
        assert_eq!(popped.seq, Seq::new(3));
        assert_eq!(mode, ApplyMode::Push);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drop_through_discards_stale_entries() {
        let mut buffer = UpdateBuffer::new(10);
        for seq in [3, 5, 8] {
            buffer.insert(update(seq), ApplyMode::Push).unwrap();
        }

        assert_eq!(buffer.drop_through(Seq::new(5)), 2);
        assert_eq!(buffer.first_seq(), Some(Seq::new(8)));
        assert!(!buffer.contains(Seq::new(3)));
    }

    #[test]
    fn restore_ignores_capacity() {
        let mut buffer = UpdateBuffer::new(1);
        buffer.insert(update(4), ApplyMode::Push).unwrap();
        buffer.restore(update(3), ApplyMode::Catchup);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.first_seq(), Some(Seq::new(3)));
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buffer = UpdateBuffer::new(10);
        buffer.insert(update(3), ApplyMode::Push).unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.first_seq(), None);
    }
}
