//! Ping/pong liveness tracking.
//!
//! Pure bookkeeping for the heartbeat task: which pings are outstanding,
//! when the connection last proved it was alive, and whether it has gone
//! silent for longer than the timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::backoff::random_u64;

/// What the heartbeat should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingTick {
    /// Send a ping carrying this nonce.
    SendPing(u64),
    /// The connection is presumed dead.
    TimedOut,
}

/// Tracks outstanding pings for one open session.
#[derive(Debug, Clone)]
pub struct PingTracker {
    timeout: Duration,
    pending: HashMap<u64, Instant>,
    last_alive: Instant,
}

impl PingTracker {
    /// Start tracking at `now` (the moment the session opened).
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
            last_alive: now,
        }
    }

    /// Decide what to do on an interval tick.
    pub fn on_tick(&mut self, now: Instant) -> PingTick {
        if self.is_timed_out(now) {
            return PingTick::TimedOut;
        }
        let mut nonce = random_u64();
        while self.pending.contains_key(&nonce) {
            nonce = nonce.wrapping_add(1);
        }
        self.pending.insert(nonce, now);
        PingTick::SendPing(nonce)
    }

    /// Record a pong. Returns false if the nonce was not outstanding.
    pub fn on_pong(&mut self, nonce: u64, now: Instant) -> bool {
        if self.pending.remove(&nonce).is_some() {
            self.last_alive = now;
            // Older pings are answered implicitly.
            self.pending.clear();
            true
        } else {
            false
        }
    }

    /// Drop a ping that could not be sent.
    pub fn forget(&mut self, nonce: u64) {
        self.pending.remove(&nonce);
    }

    /// Number of pings awaiting a pong.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// No matching pong within the timeout of a ping, or silence for the
    /// whole timeout with nothing in flight.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return now.saturating_duration_since(self.last_alive) >= self.timeout;
        }
        self.pending
            .values()
            .any(|sent| now.saturating_duration_since(*sent) >= self.timeout)
    }
}
