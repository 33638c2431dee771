//! # sync-core
//!
//! Pure logic for the Inline realtime sync core (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, timers, storage) is performed by `sync-client`,
//! which interprets the actions and decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod buffer;
pub mod catchup;
pub mod heartbeat;
pub mod sequencer;
pub mod state;

pub use backoff::{fetch_retry_delay, reconnect_delay};
pub use buffer::{BufferError, Inserted, UpdateBuffer};
pub use catchup::{plan_catchup, CatchupGate, CatchupMode, SyncState};
pub use heartbeat::{PingTick, PingTracker};
pub use sequencer::{ApplyMode, BucketSequencer, BucketState, FetchRequest, Offer};
pub use state::{
    Action, ConnectionMachine, ConnectionPolicy, ConnectionSnapshot, ConnectionState, Constraints,
    Event, Reason, Timer,
};
