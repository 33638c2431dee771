//! Connection lifecycle state machine.
//!
//! This module provides a pure, side-effect-free state machine deciding
//! whether a transport attempt should exist and why. It takes events as
//! input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (connecting, timers, publishing snapshots) is performed
//! by sync-client, not by this module. This enables instant unit testing
//! without network mocks.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::backoff::reconnect_delay;

/// Where the connection lifecycle currently is. Exactly one is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// User has not asked for a connection (initial state).
    Stopped,
    /// Wanted, but a constraint is unmet.
    WaitingForConstraints,
    /// Transport connect in progress.
    ConnectingTransport,
    /// Transport up, handshake in progress.
    Authenticating,
    /// Handshake done, session usable.
    Open,
    /// Last attempt failed; waiting before the next one.
    Backoff,
    /// App stayed in the background past the grace period.
    BackgroundSuspended,
}

impl ConnectionState {
    /// States in which the manager is pursuing a connection.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::ConnectingTransport | Self::Authenticating | Self::Open | Self::Backoff
        )
    }

    /// States in which a transport exists or is being created.
    fn has_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectingTransport | Self::Authenticating | Self::Open
        )
    }
}

/// Why the manager is in its current state. UI-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// `stop()` was called, or `start()` never was.
    UserStopped,
    /// Network reachability lost.
    NoNetwork,
    /// No auth token.
    NoAuth,
    /// App is in the background.
    AppInactive,
    /// Transport connect in progress.
    Connecting,
    /// Handshake in progress.
    Authenticating,
    /// Open and idle.
    Connected,
    /// Open and catching up.
    Syncing,
    /// Transport failed, timed out, or stalled.
    TransportError,
    /// Transport closed underneath an attempt or an open session.
    TransportDisconnected,
    /// Server refused the handshake, or it timed out.
    AuthFailed,
    /// Heartbeat saw no pong in time.
    PingTimeout,
}

/// The four independent preconditions for wanting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// An auth token exists.
    pub auth_available: bool,
    /// The network is reachable.
    pub network_available: bool,
    /// The app is in the foreground.
    pub app_active: bool,
    /// The user asked for a connection.
    pub user_wants_connection: bool,
}

impl Constraints {
    /// All four hold.
    pub fn is_satisfied(&self) -> bool {
        self.auth_available
            && self.network_available
            && self.app_active
            && self.user_wants_connection
    }

    /// The most significant unmet constraint, if any.
    pub fn unmet_reason(&self) -> Option<Reason> {
        if !self.user_wants_connection {
            Some(Reason::UserStopped)
        } else if !self.network_available {
            Some(Reason::NoNetwork)
        } else if !self.auth_available {
            Some(Reason::NoAuth)
        } else if !self.app_active {
            Some(Reason::AppInactive)
        } else {
            None
        }
    }

    /// Everything holds except app-active; backgrounding gets a grace period.
    fn only_app_inactive(&self) -> bool {
        !self.app_active
            && self.user_wants_connection
            && self.network_available
            && self.auth_available
    }
}

impl Default for Constraints {
    /// Signals without an adapter are assumed favorable; auth and user
    /// intent must be given explicitly.
    fn default() -> Self {
        Self {
            auth_available: false,
            network_available: true,
            app_active: true,
            user_wants_connection: false,
        }
    }
}

/// Timers the manager asks its runtime to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timer {
    /// Transport connect must finish by then.
    ConnectTimeout,
    /// Handshake must finish by then.
    AuthTimeout,
    /// Ceiling on connecting + authenticating combined.
    Watchdog,
    /// End of the backoff wait.
    Backoff,
    /// End of the background grace period.
    BackgroundGrace,
}

/// Connection timing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    /// Transport connect timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Handshake timeout.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Interval between pings while open.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// How long a ping may go unanswered.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// How long the app may stay backgrounded before suspension.
    #[serde(default = "default_background_grace_secs")]
    pub background_grace_secs: u64,
    /// Ceiling on a stalled connect + handshake.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_ping_timeout_secs() -> u64 {
    30
}

fn default_background_grace_secs() -> u64 {
    30
}

fn default_watchdog_secs() -> u64 {
    45
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            background_grace_secs: default_background_grace_secs(),
            watchdog_secs: default_watchdog_secs(),
        }
    }
}

impl ConnectionPolicy {
    /// Transport connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Handshake timeout.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Ping timeout.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Background grace period.
    pub fn background_grace(&self) -> Duration {
        Duration::from_secs(self.background_grace_secs)
    }

    /// Watchdog ceiling.
    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}

/// Immutable, UI-facing view of the manager, published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Why.
    pub reason: Reason,
    /// Consecutive failed attempts; 0 once open.
    pub attempt: u32,
    /// When the current state was entered.
    pub since: SystemTime,
    /// Generation of the current (or last) transport attempt.
    pub session_id: u64,
    /// Constraint values.
    pub constraints: Constraints,
    /// Description of the last failure.
    pub last_error: Option<String>,
    /// Wait before the next attempt, while in backoff.
    pub retry_in: Option<Duration>,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// User wants a connection.
    Start,
    /// User no longer wants a connection. Terminal until `Start`/`ConnectNow`.
    Stop,
    /// Like `Start`, and skip any remaining backoff wait.
    ConnectNow,
    /// Auth availability changed.
    AuthChanged(bool),
    /// Network reachability changed.
    NetworkChanged(bool),
    /// App foreground state changed.
    AppActiveChanged(bool),
    /// Transport connected.
    TransportConnected {
        /// Attempt the event belongs to.
        session_id: u64,
    },
    /// Transport connect or init send failed.
    TransportFailed {
        /// Attempt the event belongs to.
        session_id: u64,
        /// Error message describing the failure.
        error: String,
    },
    /// Transport closed.
    TransportDisconnected {
        /// Attempt the event belongs to.
        session_id: u64,
        /// Error message describing the failure.
        error: String,
    },
    /// Server accepted the handshake.
    ProtocolOpened {
        /// Attempt the event belongs to.
        session_id: u64,
    },
    /// Server refused the handshake.
    AuthFailed {
        /// Attempt the event belongs to.
        session_id: u64,
        /// Error message describing the failure.
        error: String,
    },
    /// Heartbeat saw no pong in time.
    PingTimeout {
        /// Attempt the event belongs to.
        session_id: u64,
    },
    /// A scheduled timer elapsed.
    TimerFired {
        /// Which timer.
        timer: Timer,
        /// Attempt it was scheduled for.
        session_id: u64,
    },
    /// The sync engine started or finished catching up.
    SyncActivity {
        /// True while catching up.
        catching_up: bool,
    },
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start the protocol session for this attempt.
    ConnectTransport {
        /// The new attempt's generation.
        session_id: u64,
    },
    /// Stop the protocol session and close the transport.
    DisconnectTransport,
    /// Start (or restart) a timer.
    ScheduleTimer {
        /// Which timer.
        timer: Timer,
        /// Delay until it fires.
        delay: Duration,
        /// Attempt to tag the firing with.
        session_id: u64,
    },
    /// Cancel a timer if running.
    CancelTimer(Timer),
}

/// The connection manager's state machine - NO I/O, just state transitions.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ConnectionPolicy,
    state: ConnectionState,
    reason: Reason,
    constraints: Constraints,
    attempt: u32,
    session_id: u64,
    since: SystemTime,
    last_error: Option<String>,
    retry_in: Option<Duration>,
    grace_pending: bool,
}

impl ConnectionMachine {
    /// Create a machine in `Stopped`.
    pub fn new(policy: ConnectionPolicy, now: SystemTime) -> Self {
        Self {
            policy,
            state: ConnectionState::Stopped,
            reason: Reason::UserStopped,
            constraints: Constraints::default(),
            attempt: 0,
            session_id: 0,
            since: now,
            last_error: None,
            retry_in: None,
            grace_pending: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current reason.
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// Consecutive failed attempts.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current generation.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Current constraint values.
    pub fn constraints(&self) -> Constraints {
        self.constraints
    }

    /// Timing policy.
    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Build the UI-facing snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            reason: self.reason,
            attempt: self.attempt,
            since: self.since,
            session_id: self.session_id,
            constraints: self.constraints,
            last_error: self.last_error.clone(),
            retry_in: self.retry_in,
        }
    }

    /// Process an event and return the new machine plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(mut self, event: Event, now: SystemTime) -> (Self, Vec<Action>) {
        let mut actions = Vec::new();
        match event {
            Event::Start => {
                self.constraints.user_wants_connection = true;
                self.leave_stopped(now);
                self.reconcile(now, &mut actions);
            }
            Event::ConnectNow => {
                self.constraints.user_wants_connection = true;
                self.leave_stopped(now);
                if self.state == ConnectionState::Backoff && self.constraints.is_satisfied() {
                    actions.push(Action::CancelTimer(Timer::Backoff));
                    self.begin_attempt(now, &mut actions);
                } else {
                    self.reconcile(now, &mut actions);
                }
            }
            Event::Stop => {
                self.constraints.user_wants_connection = false;
                if self.state != ConnectionState::Stopped {
                    if self.state.has_transport() {
                        self.teardown(&mut actions);
                    }
                    if self.state == ConnectionState::Backoff {
                        actions.push(Action::CancelTimer(Timer::Backoff));
                    }
                    self.attempt = 0;
                    self.retry_in = None;
                    self.enter(ConnectionState::Stopped, Reason::UserStopped, now);
                }
            }
            Event::AuthChanged(available) => {
                self.constraints.auth_available = available;
                self.reconcile(now, &mut actions);
            }
            Event::NetworkChanged(available) => {
                self.constraints.network_available = available;
                self.reconcile(now, &mut actions);
            }
            Event::AppActiveChanged(active) => {
                self.constraints.app_active = active;
                self.reconcile(now, &mut actions);
            }
            Event::TransportConnected { session_id } => {
                if self.is_current(session_id) && self.state == ConnectionState::ConnectingTransport
                {
                    actions.push(Action::CancelTimer(Timer::ConnectTimeout));
                    self.enter(ConnectionState::Authenticating, Reason::Authenticating, now);
                    actions.push(self.schedule(Timer::AuthTimeout, self.policy.auth_timeout()));
                }
            }
            Event::TransportFailed { session_id, error } => {
                if self.is_current(session_id)
                    && matches!(
                        self.state,
                        ConnectionState::ConnectingTransport | ConnectionState::Authenticating
                    )
                {
                    self.fail(Reason::TransportError, error, now, &mut actions);
                }
            }
            Event::TransportDisconnected { session_id, error } => {
                if self.is_current(session_id) && self.state.has_transport() {
                    self.fail(Reason::TransportDisconnected, error, now, &mut actions);
                }
            }
            Event::ProtocolOpened { session_id } => {
                if self.is_current(session_id) && self.state == ConnectionState::Authenticating {
                    actions.push(Action::CancelTimer(Timer::AuthTimeout));
                    actions.push(Action::CancelTimer(Timer::Watchdog));
                    self.attempt = 0;
                    self.last_error = None;
                    self.enter(ConnectionState::Open, Reason::Connected, now);
                }
            }
            Event::AuthFailed { session_id, error } => {
                if self.is_current(session_id)
                    && matches!(
                        self.state,
                        ConnectionState::ConnectingTransport | ConnectionState::Authenticating
                    )
                {
                    self.fail(Reason::AuthFailed, error, now, &mut actions);
                }
            }
            Event::PingTimeout { session_id } => {
                if self.is_current(session_id) && self.state == ConnectionState::Open {
                    let error = format!(
                        "no pong within {}s",
                        self.policy.ping_timeout().as_secs()
                    );
                    self.fail(Reason::PingTimeout, error, now, &mut actions);
                }
            }
            Event::TimerFired { timer, session_id } => {
                if self.is_current(session_id) {
                    self.on_timer(timer, now, &mut actions);
                }
            }
            Event::SyncActivity { catching_up } => {
                if self.state == ConnectionState::Open {
                    self.reason = if catching_up {
                        Reason::Syncing
                    } else {
                        Reason::Connected
                    };
                }
            }
        }
        (self, actions)
    }

    fn on_timer(&mut self, timer: Timer, now: SystemTime, actions: &mut Vec<Action>) {
        match (timer, self.state) {
            (Timer::ConnectTimeout, ConnectionState::ConnectingTransport) => {
                let error = "transport connect timed out".to_string();
                self.fail(Reason::TransportError, error, now, actions);
            }
            (Timer::AuthTimeout, ConnectionState::Authenticating) => {
                let error = "authentication timed out".to_string();
                self.fail(Reason::AuthFailed, error, now, actions);
            }
            (
                Timer::Watchdog,
                ConnectionState::ConnectingTransport | ConnectionState::Authenticating,
            ) => {
                let error = "connection attempt stalled".to_string();
                self.fail(Reason::TransportError, error, now, actions);
            }
            (Timer::Backoff, ConnectionState::Backoff) => {
                self.retry_in = None;
                match self.constraints.unmet_reason() {
                    None => self.begin_attempt(now, actions),
                    Some(reason) => self.enter(ConnectionState::WaitingForConstraints, reason, now),
                }
            }
            (Timer::BackgroundGrace, state) if self.grace_pending => {
                self.grace_pending = false;
                if state.has_transport() && self.constraints.only_app_inactive() {
                    self.teardown(actions);
                    self.enter(
                        ConnectionState::BackgroundSuspended,
                        Reason::AppInactive,
                        now,
                    );
                }
            }
            _ => {}
        }
    }

    /// React to a constraint change.
    ///
    /// Losing a non-app constraint while connecting or open goes straight to
    /// `WaitingForConstraints` instead of passing through `Backoff`; the
    /// backoff exit would land there anyway.
    fn reconcile(&mut self, now: SystemTime, actions: &mut Vec<Action>) {
        let unmet = self.constraints.unmet_reason();
        match self.state {
            ConnectionState::Stopped => {}
            ConnectionState::WaitingForConstraints | ConnectionState::BackgroundSuspended => {
                match unmet {
                    None => self.begin_attempt(now, actions),
                    Some(_)
                        if self.state == ConnectionState::BackgroundSuspended
                            && self.constraints.only_app_inactive() => {}
                    Some(reason) if self.state == ConnectionState::WaitingForConstraints => {
                        self.reason = reason;
                    }
                    Some(reason) => self.enter(ConnectionState::WaitingForConstraints, reason, now),
                }
            }
            ConnectionState::ConnectingTransport
            | ConnectionState::Authenticating
            | ConnectionState::Open => match unmet {
                None => self.disarm_grace(actions),
                Some(_) if self.constraints.only_app_inactive() => self.arm_grace(actions),
                Some(reason) => {
                    self.teardown(actions);
                    self.enter(ConnectionState::WaitingForConstraints, reason, now);
                }
            },
            ConnectionState::Backoff => match unmet {
                None => {}
                // The backoff timer re-checks constraints when it fires.
                Some(_) if self.constraints.only_app_inactive() => {}
                Some(reason) => {
                    actions.push(Action::CancelTimer(Timer::Backoff));
                    self.retry_in = None;
                    self.enter(ConnectionState::WaitingForConstraints, reason, now);
                }
            },
        }
    }

    fn leave_stopped(&mut self, now: SystemTime) {
        if self.state == ConnectionState::Stopped {
            self.attempt = 0;
            self.last_error = None;
            let reason = self.constraints.unmet_reason().unwrap_or(Reason::Connecting);
            self.enter(ConnectionState::WaitingForConstraints, reason, now);
        }
    }

    fn begin_attempt(&mut self, now: SystemTime, actions: &mut Vec<Action>) {
        self.session_id += 1;
        self.retry_in = None;
        self.enter(ConnectionState::ConnectingTransport, Reason::Connecting, now);
        actions.push(Action::ConnectTransport {
            session_id: self.session_id,
        });
        actions.push(self.schedule(Timer::ConnectTimeout, self.policy.connect_timeout()));
        actions.push(self.schedule(Timer::Watchdog, self.policy.watchdog()));
    }

    fn fail(&mut self, reason: Reason, error: String, now: SystemTime, actions: &mut Vec<Action>) {
        self.teardown(actions);
        self.attempt = self.attempt.saturating_add(1);
        let delay = reconnect_delay(self.attempt);
        self.retry_in = Some(delay);
        self.last_error = Some(error);
        self.enter(ConnectionState::Backoff, reason, now);
        actions.push(self.schedule(Timer::Backoff, delay));
    }

    fn teardown(&mut self, actions: &mut Vec<Action>) {
        actions.push(Action::DisconnectTransport);
        actions.push(Action::CancelTimer(Timer::ConnectTimeout));
        actions.push(Action::CancelTimer(Timer::AuthTimeout));
        actions.push(Action::CancelTimer(Timer::Watchdog));
        self.disarm_grace(actions);
    }

    fn arm_grace(&mut self, actions: &mut Vec<Action>) {
        if !self.grace_pending {
            self.grace_pending = true;
            actions.push(self.schedule(Timer::BackgroundGrace, self.policy.background_grace()));
        }
    }

    fn disarm_grace(&mut self, actions: &mut Vec<Action>) {
        if self.grace_pending {
            self.grace_pending = false;
            actions.push(Action::CancelTimer(Timer::BackgroundGrace));
        }
    }

    fn schedule(&self, timer: Timer, delay: Duration) -> Action {
        Action::ScheduleTimer {
            timer,
            delay,
            session_id: self.session_id,
        }
    }

    fn enter(&mut self, state: ConnectionState, reason: Reason, now: SystemTime) {
        self.state = state;
        self.reason = reason;
        self.since = now;
    }

    fn is_current(&self, session_id: u64) -> bool {
        session_id == self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_750_000_000)
    }

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ConnectionPolicy::default(), t0())
    }

    fn step(m: ConnectionMachine, event: Event) -> (ConnectionMachine, Vec<Action>) {
        m.on_event(event, t0())
    }

    fn has(actions: &[Action], pred: impl Fn(&Action) -> bool) -> bool {
        actions.iter().any(pred)
    }

    /// Authenticated, started, with the transport attempt for `session_id` in flight.
    fn connecting() -> ConnectionMachine {
        let (m, _) = step(machine(), Event::AuthChanged(true));
        let (m, _) = step(m, Event::Start);
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        m
    }

    fn open() -> ConnectionMachine {
        let m = connecting();
        let sid = m.session_id();
        let (m, _) = step(m, Event::TransportConnected { session_id: sid });
        let (m, _) = step(m, Event::ProtocolOpened { session_id: sid });
        assert_eq!(m.state(), ConnectionState::Open);
        m
    }

    // ===== Lifecycle =====

    #[test]
    fn starts_stopped() {
        let m = machine();
        assert_eq!(m.state(), ConnectionState::Stopped);
        assert_eq!(m.reason(), Reason::UserStopped);
        assert!(!m.state().is_active());
    }

    #[test]
    fn start_without_auth_waits() {
        let (m, actions) = step(machine(), Event::Start);
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoAuth);
        assert!(actions.is_empty());
    }

    #[test]
    fn start_with_constraints_connects() {
        let (m, _) = step(machine(), Event::AuthChanged(true));
        let (m, actions) = step(m, Event::Start);

        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert_eq!(m.reason(), Reason::Connecting);
        assert_eq!(m.session_id(), 1);
        assert!(has(&actions, |a| matches!(
            a,
            Action::ConnectTransport { session_id: 1 }
        )));
        assert!(has(&actions, |a| matches!(
            a,
            Action::ScheduleTimer {
                timer: Timer::Watchdog,
                ..
            }
        )));
    }

    #[test]
    fn transport_connected_moves_to_authenticating() {
        let m = connecting();
        let (m, actions) = step(m, Event::TransportConnected { session_id: 1 });

        assert_eq!(m.state(), ConnectionState::Authenticating);
        assert_eq!(m.reason(), Reason::Authenticating);
        assert!(has(&actions, |a| matches!(
            a,
            Action::CancelTimer(Timer::ConnectTimeout)
        )));
        assert!(has(&actions, |a| matches!(
            a,
            Action::ScheduleTimer {
                timer: Timer::AuthTimeout,
                ..
            }
        )));
    }

    #[test]
    fn protocol_open_resets_attempt() {
        let m = connecting();
        let (m, _) = step(
            m,
            Event::TransportFailed {
                session_id: 1,
                error: "refused".into(),
            },
        );
        assert_eq!(m.attempt(), 1);
        let (m, _) = step(
            m,
            Event::TimerFired {
                timer: Timer::Backoff,
                session_id: 1,
            },
        );
        let (m, _) = step(m, Event::TransportConnected { session_id: 2 });
        let (m, _) = step(m, Event::ProtocolOpened { session_id: 2 });

        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.reason(), Reason::Connected);
        assert_eq!(m.attempt(), 0);
        assert_eq!(m.snapshot().last_error, None);
    }

    #[test]
    fn stop_is_terminal_from_open() {
        let (m, actions) = step(open(), Event::Stop);
        assert_eq!(m.state(), ConnectionState::Stopped);
        assert!(has(&actions, |a| matches!(a, Action::DisconnectTransport)));

        // Constraint changes do not revive it.
        let (m, actions) = step(m, Event::NetworkChanged(true));
        assert_eq!(m.state(), ConnectionState::Stopped);
        assert!(actions.is_empty());
    }

    #[test]
    fn stop_from_backoff_cancels_timer() {
        let (m, _) = step(
            connecting(),
            Event::TransportFailed {
                session_id: 1,
                error: "boom".into(),
            },
        );
        let (m, actions) = step(m, Event::Stop);
        assert_eq!(m.state(), ConnectionState::Stopped);
        assert!(has(&actions, |a| matches!(a, Action::CancelTimer(Timer::Backoff))));
        assert!(!has(&actions, |a| matches!(a, Action::DisconnectTransport)));
    }

    // ===== Failures and backoff =====

    #[test]
    fn transport_failure_enters_backoff() {
        let (m, actions) = step(
            connecting(),
            Event::TransportFailed {
                session_id: 1,
                error: "refused".into(),
            },
        );
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.reason(), Reason::TransportError);
        assert_eq!(m.attempt(), 1);
        let snapshot = m.snapshot();
        assert_eq!(snapshot.last_error.as_deref(), Some("refused"));
        assert!(snapshot.retry_in.is_some());
        assert!(has(&actions, |a| matches!(
            a,
            Action::ScheduleTimer {
                timer: Timer::Backoff,
                session_id: 1,
                ..
            }
        )));
    }

    #[test]
    fn auth_failure_enters_backoff() {
        let (m, _) = step(connecting(), Event::TransportConnected { session_id: 1 });
        let (m, _) = step(
            m,
            Event::AuthFailed {
                session_id: 1,
                error: "token expired".into(),
            },
        );
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.reason(), Reason::AuthFailed);
    }

    #[test]
    fn auth_timeout_enters_backoff() {
        let (m, _) = step(connecting(), Event::TransportConnected { session_id: 1 });
        let (m, _) = step(
            m,
            Event::TimerFired {
                timer: Timer::AuthTimeout,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.reason(), Reason::AuthFailed);
    }

    #[test]
    fn attempts_accumulate_across_failures() {
        let mut m = connecting();
        for expected in 1..=5 {
            let sid = m.session_id();
            let (next, _) = step(
                m,
                Event::TransportFailed {
                    session_id: sid,
                    error: "down".into(),
                },
            );
            assert_eq!(next.attempt(), expected);
            let (next, _) = step(
                next,
                Event::TimerFired {
                    timer: Timer::Backoff,
                    session_id: sid,
                },
            );
            assert_eq!(next.state(), ConnectionState::ConnectingTransport);
            assert_eq!(next.session_id(), sid + 1);
            m = next;
        }
    }

    #[test]
    fn backoff_timer_with_unmet_constraint_waits() {
        let (m, _) = step(
            connecting(),
            Event::TransportFailed {
                session_id: 1,
                error: "down".into(),
            },
        );
        let (m, _) = step(m, Event::AppActiveChanged(false));
        assert_eq!(m.state(), ConnectionState::Backoff);

        let (m, actions) = step(
            m,
            Event::TimerFired {
                timer: Timer::Backoff,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::AppInactive);
        assert!(actions.is_empty());
    }

    #[test]
    fn network_loss_during_backoff_waits() {
        let (m, _) = step(
            connecting(),
            Event::TransportFailed {
                session_id: 1,
                error: "down".into(),
            },
        );
        let (m, actions) = step(m, Event::NetworkChanged(false));
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoNetwork);
        assert_eq!(m.snapshot().retry_in, None);
        assert!(has(&actions, |a| matches!(a, Action::CancelTimer(Timer::Backoff))));
    }

    #[test]
    fn connect_now_skips_backoff_wait() {
        let (m, _) = step(
            connecting(),
            Event::TransportFailed {
                session_id: 1,
                error: "down".into(),
            },
        );
        let (m, actions) = step(m, Event::ConnectNow);
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert_eq!(m.session_id(), 2);
        assert!(has(&actions, |a| matches!(a, Action::CancelTimer(Timer::Backoff))));

        // The old backoff timer is stale now.
        let (m, actions) = step(
            m,
            Event::TimerFired {
                timer: Timer::Backoff,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert!(actions.is_empty());
    }

    #[test]
    fn connect_now_from_stopped_starts() {
        let (m, _) = step(machine(), Event::AuthChanged(true));
        let (m, actions) = step(m, Event::ConnectNow);
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert!(has(&actions, |a| matches!(a, Action::ConnectTransport { .. })));
    }

    // ===== Watchdog and stale events =====

    #[test]
    fn watchdog_forces_backoff_when_stalled() {
        let (m, _) = step(connecting(), Event::TransportConnected { session_id: 1 });
        let (m, actions) = step(
            m,
            Event::TimerFired {
                timer: Timer::Watchdog,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.reason(), Reason::TransportError);
        assert!(has(&actions, |a| matches!(a, Action::DisconnectTransport)));
    }

    #[test]
    fn watchdog_ignored_once_open() {
        let (m, actions) = step(
            open(),
            Event::TimerFired {
                timer: Timer::Watchdog,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::Open);
        assert!(actions.is_empty());
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let (m, _) = step(
            connecting(),
            Event::TransportFailed {
                session_id: 1,
                error: "down".into(),
            },
        );
        let (m, _) = step(m, Event::ConnectNow);
        assert_eq!(m.session_id(), 2);

        let (m, actions) = step(m, Event::TransportConnected { session_id: 1 });
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert!(actions.is_empty());

        let (m, actions) = step(
            m,
            Event::TransportDisconnected {
                session_id: 1,
                error: "late".into(),
            },
        );
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert!(actions.is_empty());
    }

    // ===== Open session =====

    #[test]
    fn ping_timeout_enters_backoff() {
        let (m, actions) = step(open(), Event::PingTimeout { session_id: 1 });
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.reason(), Reason::PingTimeout);
        assert!(has(&actions, |a| matches!(a, Action::DisconnectTransport)));
    }

    #[test]
    fn disconnect_while_open_enters_backoff() {
        let (m, _) = step(
            open(),
            Event::TransportDisconnected {
                session_id: 1,
                error: "closed by peer".into(),
            },
        );
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.reason(), Reason::TransportDisconnected);
        assert_eq!(m.attempt(), 1);
    }

    #[test]
    fn sync_activity_changes_reason_only() {
        let m = open();
        let since = m.snapshot().since;
        let (m, _) = step(m, Event::SyncActivity { catching_up: true });
        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.reason(), Reason::Syncing);
        assert_eq!(m.snapshot().since, since);
        let (m, _) = step(m, Event::SyncActivity { catching_up: false });
        assert_eq!(m.reason(), Reason::Connected);
    }

    #[test]
    fn sync_activity_ignored_when_not_open() {
        let (m, _) = step(connecting(), Event::SyncActivity { catching_up: true });
        assert_eq!(m.reason(), Reason::Connecting);
    }

    // ===== Constraints =====

    #[test]
    fn network_loss_tears_down_immediately() {
        let (m, actions) = step(open(), Event::NetworkChanged(false));
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoNetwork);
        assert_eq!(m.attempt(), 0);
        assert!(has(&actions, |a| matches!(a, Action::DisconnectTransport)));
    }

    #[test]
    fn auth_loss_tears_down_attempt() {
        let (m, actions) = step(connecting(), Event::AuthChanged(false));
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoAuth);
        assert!(has(&actions, |a| matches!(a, Action::DisconnectTransport)));
    }

    #[test]
    fn waiting_reason_tracks_most_significant_constraint() {
        let (m, _) = step(machine(), Event::NetworkChanged(false));
        let (m, _) = step(m, Event::Start);
        assert_eq!(m.reason(), Reason::NoNetwork);
        let (m, _) = step(m, Event::NetworkChanged(true));
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoAuth);
    }

    #[test]
    fn backgrounding_gets_grace_then_suspends() {
        let (m, actions) = step(open(), Event::AppActiveChanged(false));
        assert_eq!(m.state(), ConnectionState::Open);
        assert!(has(&actions, |a| matches!(
            a,
            Action::ScheduleTimer {
                timer: Timer::BackgroundGrace,
                ..
            }
        )));

        let (m, actions) = step(
            m,
            Event::TimerFired {
                timer: Timer::BackgroundGrace,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::BackgroundSuspended);
        assert_eq!(m.reason(), Reason::AppInactive);
        assert!(has(&actions, |a| matches!(a, Action::DisconnectTransport)));
    }

    #[test]
    fn returning_within_grace_keeps_connection() {
        let (m, _) = step(open(), Event::AppActiveChanged(false));
        let (m, actions) = step(m, Event::AppActiveChanged(true));
        assert_eq!(m.state(), ConnectionState::Open);
        assert!(has(&actions, |a| matches!(
            a,
            Action::CancelTimer(Timer::BackgroundGrace)
        )));

        // A late grace firing does nothing.
        let (m, actions) = step(
            m,
            Event::TimerFired {
                timer: Timer::BackgroundGrace,
                session_id: 1,
            },
        );
        assert_eq!(m.state(), ConnectionState::Open);
        assert!(actions.is_empty());
    }

    #[test]
    fn foreground_resumes_from_suspension() {
        let (m, _) = step(open(), Event::AppActiveChanged(false));
        let (m, _) = step(
            m,
            Event::TimerFired {
                timer: Timer::BackgroundGrace,
                session_id: 1,
            },
        );
        let (m, actions) = step(m, Event::AppActiveChanged(true));
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        assert_eq!(m.session_id(), 2);
        assert!(has(&actions, |a| matches!(
            a,
            Action::ConnectTransport { session_id: 2 }
        )));
    }

    #[test]
    fn network_loss_while_suspended_waits() {
        let (m, _) = step(open(), Event::AppActiveChanged(false));
        let (m, _) = step(
            m,
            Event::TimerFired {
                timer: Timer::BackgroundGrace,
                session_id: 1,
            },
        );
        let (m, _) = step(m, Event::NetworkChanged(false));
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoNetwork);
    }

    #[test]
    fn snapshot_serializes_for_ui() {
        let json = serde_json::to_value(open().snapshot()).unwrap();
        assert_eq!(json["state"], "open");
        assert_eq!(json["reason"], "connected");
        assert_eq!(json["session_id"], 1);
        assert_eq!(json["constraints"]["auth_available"], true);
    }

    // ===== Properties =====

    /// Drives the machine with an ideal transport: every connect succeeds and
    /// every handshake is accepted. Remaining timers can be fired on demand.
    struct Harness {
        m: ConnectionMachine,
        timers: HashMap<Timer, u64>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                m: machine(),
                timers: HashMap::new(),
            }
        }

        fn send(&mut self, event: Event) {
            let mut queue = VecDeque::from([event]);
            while let Some(event) = queue.pop_front() {
                let (m, actions) = self.m.clone().on_event(event, t0());
                self.m = m;
                for action in actions {
                    match action {
                        Action::ConnectTransport { session_id } => {
                            queue.push_back(Event::TransportConnected { session_id });
                            queue.push_back(Event::ProtocolOpened { session_id });
                        }
                        Action::ScheduleTimer {
                            timer, session_id, ..
                        } => {
                            self.timers.insert(timer, session_id);
                        }
                        Action::CancelTimer(timer) => {
                            self.timers.remove(&timer);
                        }
                        Action::DisconnectTransport => {}
                    }
                }
            }
        }

        fn settle(&mut self) {
            for _ in 0..4 {
                let due: Vec<(Timer, u64)> = self.timers.drain().collect();
                for (timer, session_id) in due {
                    self.send(Event::TimerFired { timer, session_id });
                }
            }
        }
    }

    fn flip(h: &mut Harness, which: u64, value: bool) {
        match which % 4 {
            0 => h.send(Event::AuthChanged(value)),
            1 => h.send(Event::NetworkChanged(value)),
            2 => h.send(Event::AppActiveChanged(value)),
            _ => h.send(if value { Event::Start } else { Event::Stop }),
        }
    }

    #[test]
    fn constraint_flips_converge_to_final_constraints() {
        let mut rng: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            rng = rng
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            rng >> 33
        };

        for round in 0..400 {
            let mut h = Harness::new();
            for _ in 0..(round % 12) {
                let which = next();
                let value = next() % 2 == 0;
                flip(&mut h, which, value);
            }
            let finals = [next() % 2 == 0, next() % 2 == 0, next() % 2 == 0, next() % 2 == 0];
            for (which, value) in finals.iter().enumerate() {
                flip(&mut h, which as u64, *value);
            }
            h.settle();

            let c = h.m.constraints();
            let state = h.m.state();
            if c.is_satisfied() {
                assert_eq!(state, ConnectionState::Open, "round {round}: {c:?}");
            } else if !c.user_wants_connection {
                assert_eq!(state, ConnectionState::Stopped, "round {round}: {c:?}");
            } else if c.only_app_inactive() {
                assert!(
                    matches!(
                        state,
                        ConnectionState::WaitingForConstraints
                            | ConnectionState::BackgroundSuspended
                    ),
                    "round {round}: {state:?} {c:?}"
                );
            } else {
                assert_eq!(
                    state,
                    ConnectionState::WaitingForConstraints,
                    "round {round}: {c:?}"
                );
            }
        }
    }

    #[test]
    fn scenario_offline_start_then_network_returns() {
        let (m, _) = step(machine(), Event::AuthChanged(true));
        let (m, _) = step(m, Event::NetworkChanged(false));
        let (m, actions) = step(m, Event::Start);
        assert_eq!(m.state(), ConnectionState::WaitingForConstraints);
        assert_eq!(m.reason(), Reason::NoNetwork);
        assert!(actions.is_empty());

        let (m, _) = step(m, Event::NetworkChanged(true));
        assert_eq!(m.state(), ConnectionState::ConnectingTransport);
        let sid = m.session_id();
        let (m, _) = step(m, Event::TransportConnected { session_id: sid });
        assert_eq!(m.state(), ConnectionState::Authenticating);
        let (m, _) = step(m, Event::ProtocolOpened { session_id: sid });
        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.attempt(), 0);
    }
}
