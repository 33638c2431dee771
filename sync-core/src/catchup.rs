//! Reconnect catch-up planning.
//!
//! After every transition to open the engine reconciles with the server
//! once. A recent `last_sync_date` only asks for buckets changed since
//! then; a stale one rescans every bucket watermark.

use serde::{Deserialize, Serialize};

/// Global sync watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncState {
    /// Server date of the last completed catch-up (unix seconds).
    pub last_sync_date: Option<i64>,
}

impl SyncState {
    /// Move the watermark forward. Never moves it back.
    pub fn advance_to(&mut self, date: i64) {
        self.last_sync_date = Some(self.last_sync_date.map_or(date, |last| last.max(date)));
    }
}

/// How to catch up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupMode {
    /// Ask only for buckets changed since `since`.
    Incremental {
        /// Watermark to diff against.
        since: i64,
    },
    /// Rescan every bucket.
    Full,
}

/// Pick a catch-up mode.
///
/// Full when nothing was ever synced or the watermark is older than
/// `safety_gap_secs` relative to the server's clock.
pub fn plan_catchup(state: SyncState, server_date: i64, safety_gap_secs: i64) -> CatchupMode {
    match state.last_sync_date {
        Some(last) if server_date.saturating_sub(last) <= safety_gap_secs => {
            CatchupMode::Incremental { since: last }
        }
        _ => CatchupMode::Full,
    }
}

/// Admits at most one catch-up per session generation.
#[derive(Debug, Clone, Default)]
pub struct CatchupGate {
    last_session: Option<u64>,
}

impl CatchupGate {
    /// Create a gate that has admitted nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time it sees `session_id`, false afterwards.
    pub fn admit(&mut self, session_id: u64) -> bool {
        if self.last_session == Some(session_id) {
            return false;
        }
        self.last_session = Some(session_id);
        true
    }
}
