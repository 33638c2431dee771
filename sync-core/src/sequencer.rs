//! Per-bucket sequencing.
//!
//! Each bucket has a strictly increasing server seq. The sequencer decides
//! what happens to an incoming update:
//! - `seq == expected`: apply now
//! - `seq > expected`: buffer it and ask for the missing range
//! - `seq <= last applied`: duplicate, drop it
//!
//! The cursor only moves through [`BucketSequencer::advance`] (an update
//! was applied) or [`BucketSequencer::repair_complete`] (an explicit
//! repair re-established continuity). It never skips a gap on its own.

use inline_sync_types::{BucketKey, Seq, Update};
use serde::{Deserialize, Serialize};

use crate::buffer::{BufferError, UpdateBuffer};

/// Last-applied watermark for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BucketState {
    /// Date of the last applied update (unix seconds).
    pub date: i64,
    /// Seq of the last applied update.
    pub seq: Seq,
}

/// Where an update came from. Catch-up applies suppress user-visible side
/// effects for entities already present locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Live delivery while connected.
    Push,
    /// Reconciliation after a reconnect or a gap fetch.
    Catchup,
}

/// A range of a bucket the engine should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Bucket to fetch.
    pub bucket: BucketKey,
    /// First missing seq (inclusive).
    pub start: Seq,
    /// Lowest buffered seq (exclusive); `None` means up to the server head.
    pub end: Option<Seq>,
}

/// What the sequencer decided about an offered update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Contiguous; apply it, then call [`BucketSequencer::advance`].
    Apply(Update),
    /// Ahead of the cursor; held until the gap closes.
    Buffered,
    /// Already applied.
    Duplicate,
    /// Ahead of the cursor but the buffer is full; the gap fetch covers it.
    Dropped(BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Fetch,
    Repair,
}

/// Sequencing state for one bucket.
#[derive(Debug, Clone)]
pub struct BucketSequencer {
    bucket: BucketKey,
    state: BucketState,
    buffer: UpdateBuffer,
    /// Highest seq the server has shown us for this bucket.
    known_head: Seq,
    in_flight: Option<InFlight>,
    needs_repair: bool,
    failures: u32,
}

impl BucketSequencer {
    /// Create a sequencer resuming from a persisted watermark.
    pub fn new(bucket: BucketKey, state: BucketState, max_buffered: usize) -> Self {
        Self {
            bucket,
            state,
            buffer: UpdateBuffer::new(max_buffered),
            known_head: state.seq,
            in_flight: None,
            needs_repair: false,
            failures: 0,
        }
    }

    /// The bucket this sequencer owns.
    pub fn bucket(&self) -> BucketKey {
        self.bucket
    }

    /// Current watermark.
    pub fn state(&self) -> BucketState {
        self.state
    }

    /// Next seq that may be applied.
    pub fn expected_seq(&self) -> Seq {
        self.state.seq.next()
    }

    /// Highest seq known to exist on the server.
    pub fn known_head(&self) -> Seq {
        self.known_head
    }

    /// Number of updates waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Classify an incoming update.
    pub fn offer(&mut self, update: Update, mode: ApplyMode) -> Offer {
        if update.seq <= self.state.seq {
            return Offer::Duplicate;
        }
        self.note_head(update.seq);
        if update.seq == self.expected_seq() {
            return Offer::Apply(update);
        }
        match self.buffer.insert(update, mode) {
            Ok(_) => Offer::Buffered,
            Err(err) => Offer::Dropped(err),
        }
    }

    /// Take the next buffered update if it is now contiguous.
    pub fn pop_ready(&mut self) -> Option<(Update, ApplyMode)> {
        self.buffer.drop_through(self.state.seq);
        self.buffer.pop_if_first(self.expected_seq())
    }

    /// Record that the update at `seq` was applied.
    pub fn advance(&mut self, seq: Seq, date: i64) {
        debug_assert_eq!(seq, self.expected_seq(), "advance must be contiguous");
        if seq > self.state.seq {
            self.state.seq = seq;
        }
        self.state.date = self.state.date.max(date);
        self.buffer.drop_through(self.state.seq);
    }

    /// Put back an update whose apply failed so it is retried in order.
    pub fn requeue(&mut self, update: Update, mode: ApplyMode) {
        self.buffer.restore(update, mode);
    }

    /// Learn that the server has at least `seq` for this bucket.
    pub fn note_head(&mut self, seq: Seq) {
        if seq > self.known_head {
            self.known_head = seq;
        }
    }

    /// Whether updates are known to be missing.
    pub fn needs_fetch(&self) -> bool {
        !self.needs_repair && (self.known_head > self.state.seq || !self.buffer.is_empty())
    }

    /// The next update is buffered and only waits to be applied.
    pub fn has_ready(&self) -> bool {
        self.buffer.first_seq() == Some(self.expected_seq())
    }

    /// Start a gap fetch, unless one is already outstanding.
    ///
    /// Returns at most one request until [`fetch_finished`](Self::fetch_finished).
    pub fn take_fetch(&mut self) -> Option<FetchRequest> {
        if self.in_flight.is_some() || !self.needs_fetch() || self.has_ready() {
            return None;
        }
        self.in_flight = Some(InFlight::Fetch);
        Some(FetchRequest {
            bucket: self.bucket,
            start: self.expected_seq(),
            end: self.buffer.first_seq(),
        })
    }

    /// The outstanding gap fetch completed (successfully or not).
    pub fn fetch_finished(&mut self) {
        if self.in_flight == Some(InFlight::Fetch) {
            self.in_flight = None;
        }
    }

    /// Whether a fetch or repair is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The gap cannot be filled incrementally.
    pub fn mark_needs_repair(&mut self) {
        self.needs_repair = true;
    }

    /// Whether the bucket is waiting for repair.
    pub fn needs_repair(&self) -> bool {
        self.needs_repair
    }

    /// Start a repair if one is needed and nothing else is outstanding.
    pub fn take_repair(&mut self) -> bool {
        if self.needs_repair && self.in_flight.is_none() {
            self.in_flight = Some(InFlight::Repair);
            true
        } else {
            false
        }
    }

    /// The repair request failed; it stays pending.
    pub fn repair_failed(&mut self) {
        if self.in_flight == Some(InFlight::Repair) {
            self.in_flight = None;
        }
    }

    /// A repair re-established continuity at the server's `seq`.
    pub fn repair_complete(&mut self, seq: Seq, date: i64) {
        self.in_flight = None;
        self.needs_repair = false;
        if seq > self.state.seq {
            self.state.seq = seq;
        }
        self.state.date = self.state.date.max(date);
        self.note_head(seq);
        self.buffer.drop_through(self.state.seq);
    }

    /// Forget outstanding work; its results belong to an older session.
    pub fn cancel_in_flight(&mut self) {
        self.in_flight = None;
    }

    /// Caught up: nothing missing, outstanding, or awaiting repair.
    pub fn is_settled(&self) -> bool {
        self.in_flight.is_none() && !self.needs_repair && !self.needs_fetch() && !self.has_ready()
    }

    /// Count a failed fetch or repair; returns the consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// Reset the consecutive failure count.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inline_sync_types::UpdatePayload;

    const BUCKET: BucketKey = BucketKey::Chat(7);

    fn update(seq: u64) -> Update {
        Update {
            bucket: BUCKET,
            seq: Seq::new(seq),
            date: 1_700_000_000 + seq as i64,
            payload: UpdatePayload::ChatChanged { chat_id: 7 },
        }
    }

    fn at(seq: u64) -> BucketSequencer {
        BucketSequencer::new(
            BUCKET,
            BucketState {
                date: 1_700_000_000,
                seq: Seq::new(seq),
            },
            100,
        )
    }

    /// Apply everything the sequencer releases, returning the applied seqs.
    fn apply_all(seqr: &mut BucketSequencer, offer: Offer) -> Vec<u64> {
        let mut applied = Vec::new();
        if let Offer::Apply(u) = offer {
            seqr.advance(u.seq, u.date);
            applied.push(u.seq.value());
            while let Some((u, _)) = seqr.pop_ready() {
                seqr.advance(u.seq, u.date);
                applied.push(u.seq.value());
            }
        }
        applied
    }

    // ===== Classification =====

    #[test]
    fn contiguous_update_is_applied() {
        let mut seqr = at(10);
        assert!(matches!(seqr.offer(update(11), ApplyMode::Push), Offer::Apply(_)));
    }

    #[test]
    fn old_update_is_duplicate() {
        let mut seqr = at(10);
        assert_eq!(seqr.offer(update(10), ApplyMode::Push), Offer::Duplicate);
        assert_eq!(seqr.offer(update(3), ApplyMode::Push), Offer::Duplicate);
    }

    #[test]
    fn future_update_is_buffered_not_applied() {
        let mut seqr = at(10);
        assert_eq!(seqr.offer(update(15), ApplyMode::Push), Offer::Buffered);
        assert_eq!(seqr.state().seq, Seq::new(10));
        assert_eq!(seqr.buffered(), 1);
    }

    #[test]
    fn full_buffer_drops_without_moving_cursor() {
        let mut seqr = BucketSequencer::new(BUCKET, BucketState::default(), 1);
        assert_eq!(seqr.offer(update(3), ApplyMode::Push), Offer::Buffered);
        assert!(matches!(
            seqr.offer(update(4), ApplyMode::Push),
            Offer::Dropped(BufferError::Full { capacity: 1 })
        ));
        assert_eq!(seqr.state().seq, Seq::ZERO);
        assert_eq!(seqr.known_head(), Seq::new(4));
    }

    // ===== Gap fetch =====

    #[test]
    fn gap_emits_exactly_one_fetch_for_missing_range() {
        let mut seqr = at(10);
        seqr.offer(update(16), ApplyMode::Push);

        let fetch = seqr.take_fetch().unwrap();
        assert_eq!(fetch.start, Seq::new(11));
        assert_eq!(fetch.end, Some(Seq::new(16)));

        // Further gap triggers collapse into the outstanding request.
        seqr.offer(update(18), ApplyMode::Push);
        assert!(seqr.take_fetch().is_none());
    }

    #[test]
    fn gap_fill_applies_all_in_order_without_duplicates() {
        let mut seqr = at(10);
        seqr.offer(update(16), ApplyMode::Push);
        seqr.take_fetch().unwrap();

        let mut applied = Vec::new();
        for seq in 11..16 {
            let offer = seqr.offer(update(seq), ApplyMode::Catchup);
            applied.extend(apply_all(&mut seqr, offer));
        }
        seqr.fetch_finished();

        assert_eq!(applied, vec![11, 12, 13, 14, 15, 16]);
        assert_eq!(seqr.state().seq, Seq::new(16));
        assert!(seqr.is_settled());
        // The buffered copy is gone; a re-delivery is a duplicate.
        assert_eq!(seqr.offer(update(16), ApplyMode::Push), Offer::Duplicate);
    }

    #[test]
    fn reversed_delivery_applies_ascending_exactly_once() {
        let mut seqr = at(0);
        let mut applied = Vec::new();
        for seq in (1..=8).rev() {
            let offer = seqr.offer(update(seq), ApplyMode::Push);
            applied.extend(apply_all(&mut seqr, offer));
        }
        assert_eq!(applied, (1..=8).collect::<Vec<_>>());
        assert_eq!(seqr.buffered(), 0);
    }

    #[test]
    fn interleaved_delivery_with_repeats() {
        let mut seqr = at(0);
        let mut applied = Vec::new();
        for seq in [3, 1, 3, 2, 1, 5, 4, 5, 6] {
            let offer = seqr.offer(update(seq), ApplyMode::Push);
            applied.extend(apply_all(&mut seqr, offer));
        }
        assert_eq!(applied, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn head_beyond_cursor_needs_open_ended_fetch() {
        let mut seqr = at(4);
        seqr.note_head(Seq::new(9));
        let fetch = seqr.take_fetch().unwrap();
        assert_eq!(fetch.start, Seq::new(5));
        assert_eq!(fetch.end, None);
    }

    #[test]
    fn settled_bucket_needs_no_fetch() {
        let mut seqr = at(4);
        seqr.note_head(Seq::new(4));
        assert!(seqr.take_fetch().is_none());
        assert!(seqr.is_settled());
    }

    #[test]
    fn cancel_in_flight_allows_new_fetch() {
        let mut seqr = at(1);
        seqr.offer(update(5), ApplyMode::Push);
        seqr.take_fetch().unwrap();
        seqr.cancel_in_flight();
        assert!(seqr.take_fetch().is_some());
    }

    // ===== Repair =====

    #[test]
    fn repair_blocks_fetch_and_keeps_cursor() {
        let mut seqr = at(10);
        seqr.offer(update(500), ApplyMode::Push);
        seqr.take_fetch().unwrap();
        seqr.fetch_finished();
        seqr.mark_needs_repair();

        assert_eq!(seqr.state().seq, Seq::new(10));
        assert!(seqr.take_fetch().is_none());
        assert!(seqr.take_repair());
        assert!(!seqr.take_repair());
    }

    #[test]
    fn repair_complete_jumps_cursor_and_keeps_newer_buffered() {
        let mut seqr = at(10);
        seqr.offer(update(499), ApplyMode::Push);
        seqr.offer(update(502), ApplyMode::Push);
        seqr.mark_needs_repair();
        assert!(seqr.take_repair());

        seqr.repair_complete(Seq::new(500), 1_700_000_500);

        assert_eq!(seqr.state().seq, Seq::new(500));
        assert!(!seqr.needs_repair());
        assert_eq!(seqr.buffered(), 1);
        // 501 is now missing before 502.
        let fetch = seqr.take_fetch().unwrap();
        assert_eq!(fetch.start, Seq::new(501));
        assert_eq!(fetch.end, Some(Seq::new(502)));
    }

    #[test]
    fn failed_repair_stays_pending() {
        let mut seqr = at(1);
        seqr.mark_needs_repair();
        assert!(seqr.take_repair());
        seqr.repair_failed();
        assert!(seqr.needs_repair());
        assert!(seqr.take_repair());
    }

    // ===== Apply failure =====

    #[test]
    fn requeued_update_is_released_again() {
        let mut seqr = at(1);
        let Offer::Apply(u) = seqr.offer(update(2), ApplyMode::Push) else {
            panic!("expected apply");
        };
        seqr.requeue(u, ApplyMode::Push);

        assert!(seqr.has_ready());
        assert!(seqr.take_fetch().is_none());
        assert!(!seqr.is_settled());

        let (again, mode) = seqr.pop_ready().unwrap();
        assert_eq!(again.seq, Seq::new(2));
        assert_eq!(mode, ApplyMode::Push);
    }

    #[test]
    fn failure_counter_resets() {
        let mut seqr = at(1);
        assert_eq!(seqr.record_failure(), 1);
        assert_eq!(seqr.record_failure(), 2);
        seqr.record_success();
        assert_eq!(seqr.record_failure(), 1);
    }
}
