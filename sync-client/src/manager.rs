//! Connection manager.
//!
//! An actor that owns the [`ConnectionMachine`] and interprets its actions:
//! starting and stopping the protocol session, running timers, and
//! publishing a fresh [`ConnectionSnapshot`] after every event.
//!
//! ```text
//! adapters / user ─┐
//!                  ├─► mailbox ─► ConnectionMachine ─► actions ─► session, timers
//! session events ──┘                    │
//!                                       └─► watch<ConnectionSnapshot>
//! ```
//!
//! Nothing outside the actor mutates the machine. Callers talk to it through
//! a clonable [`ConnectionHandle`].

use std::collections::HashMap;
use std::time::SystemTime;

use inline_sync_core::{
    Action, ConnectionMachine, ConnectionPolicy, ConnectionSnapshot, ConnectionState, Event,
    Timer,
};
use inline_sync_types::AuthToken;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::session::{ProtocolSession, SessionEvent};
use crate::transport::Transport;

enum Command {
    Event(Event),
    SetToken(Option<AuthToken>),
    Shutdown(oneshot::Sender<()>),
}

/// Clonable handle to a running connection manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ConnectionSnapshot>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("snapshot", &*self.snapshots.borrow())
            .finish()
    }
}

impl ConnectionHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Connection manager is gone; command dropped");
        }
    }

    fn event(&self, event: Event) {
        self.send(Command::Event(event));
    }

    /// The user wants a connection.
    pub fn start(&self) {
        self.event(Event::Start);
    }

    /// The user no longer wants a connection.
    pub fn stop(&self) {
        self.event(Event::Stop);
    }

    /// Connect now, skipping any remaining backoff wait.
    pub fn connect_now(&self) {
        self.event(Event::ConnectNow);
    }

    /// Provide or withdraw the auth token.
    pub fn set_auth_token(&self, token: Option<AuthToken>) {
        self.send(Command::SetToken(token));
    }

    /// Network reachability changed.
    pub fn set_network_available(&self, available: bool) {
        self.event(Event::NetworkChanged(available));
    }

    /// App foreground state changed.
    pub fn set_app_active(&self, active: bool) {
        self.event(Event::AppActiveChanged(active));
    }

    /// The sync engine started or finished catching up.
    pub fn report_sync_activity(&self, catching_up: bool) {
        self.event(Event::SyncActivity { catching_up });
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshots.clone()
    }

    /// Feed network reachability from an adapter.
    pub fn watch_network(&self, signal: watch::Receiver<bool>) -> JoinHandle<()> {
        self.forward(signal, ConnectionHandle::set_network_available)
    }

    /// Feed app foreground state from an adapter.
    pub fn watch_app_active(&self, signal: watch::Receiver<bool>) -> JoinHandle<()> {
        self.forward(signal, ConnectionHandle::set_app_active)
    }

    /// Feed the auth token from an adapter.
    pub fn watch_auth(&self, signal: watch::Receiver<Option<AuthToken>>) -> JoinHandle<()> {
        self.forward(signal, ConnectionHandle::set_auth_token)
    }

    fn forward<V>(&self, mut signal: watch::Receiver<V>, apply: fn(&Self, V)) -> JoinHandle<()>
    where
        V: Clone + Send + Sync + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                let value = signal.borrow_and_update().clone();
                apply(&handle, value);
                if signal.changed().await.is_err() || handle.commands.is_closed() {
                    break;
                }
            }
        })
    }

    /// Stop the manager and close the session. Waits until it is done.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Shutdown(done));
        let _ = wait.await;
    }
}

/// Spawns the manager actor.
pub struct ConnectionManager;

impl ConnectionManager {
    /// Start the actor driving `session` under `policy`.
    pub fn spawn<T: Transport>(
        session: ProtocolSession<T>,
        policy: ConnectionPolicy,
    ) -> ConnectionHandle {
        let machine = ConnectionMachine::new(policy, SystemTime::now());
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session_events = session.subscribe();

        let actor = Actor {
            machine,
            session,
            token: None,
            timers: HashMap::new(),
            mailbox: commands_tx.downgrade(),
            snapshots: snapshot_tx,
        };
        tokio::spawn(actor.run(commands_rx, session_events));

        ConnectionHandle {
            commands: commands_tx,
            snapshots: snapshot_rx,
        }
    }
}

struct Actor<T: Transport> {
    machine: ConnectionMachine,
    session: ProtocolSession<T>,
    token: Option<AuthToken>,
    timers: HashMap<Timer, JoinHandle<()>>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    snapshots: watch::Sender<ConnectionSnapshot>,
}

impl<T: Transport> Actor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Event(event)) => self.handle(event).await,
                    Some(Command::SetToken(token)) => {
                        let available = token.is_some();
                        self.token = token;
                        self.handle(Event::AuthChanged(available)).await;
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => break,
                },
                Some(event) = session_events.recv() => {
                    if let Some(event) = lifecycle_event(event) {
                        self.handle(event).await;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, event: Event) {
        let before = self.machine.state();
        let (machine, actions) = self.machine.clone().on_event(event, SystemTime::now());
        self.machine = machine;

        for action in actions {
            self.execute(action).await;
        }

        let after = self.machine.state();
        if before != after {
            tracing::info!(
                "Connection {:?} -> {:?} ({:?})",
                before,
                after,
                self.machine.reason()
            );
        }
        let snapshot = self.machine.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::ConnectTransport { session_id } => match self.token.clone() {
                Some(token) => {
                    tracing::debug!("Starting session {}", session_id);
                    self.session.start(session_id, token);
                }
                None => self.post(Event::AuthFailed {
                    session_id,
                    error: "no auth token".to_string(),
                }),
            },
            Action::DisconnectTransport => self.session.stop().await,
            Action::ScheduleTimer {
                timer,
                delay,
                session_id,
            } => {
                let mailbox = self.mailbox.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = mailbox.upgrade() {
                        let _ = tx.send(Command::Event(Event::TimerFired { timer, session_id }));
                    }
                });
                if let Some(previous) = self.timers.insert(timer, task) {
                    previous.abort();
                }
            }
            Action::CancelTimer(timer) => {
                if let Some(task) = self.timers.remove(&timer) {
                    task.abort();
                }
            }
        }
    }

    fn post(&self, event: Event) {
        if let Some(tx) = self.mailbox.upgrade() {
            let _ = tx.send(Command::Event(event));
        }
    }

    async fn shutdown(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        if self.machine.state() != ConnectionState::Stopped {
            self.handle(Event::Stop).await;
        }
        self.session.stop().await;
        tracing::info!("Connection manager stopped");
    }
}

fn lifecycle_event(event: SessionEvent) -> Option<Event> {
    match event {
        SessionEvent::TransportConnected { session_id } => {
            Some(Event::TransportConnected { session_id })
        }
        SessionEvent::TransportFailed { session_id, error } => {
            Some(Event::TransportFailed { session_id, error })
        }
        SessionEvent::Opened { session_id } => Some(Event::ProtocolOpened { session_id }),
        SessionEvent::AuthRejected { session_id, error } => {
            Some(Event::AuthFailed { session_id, error })
        }
        SessionEvent::Disconnected { session_id, error } => {
            Some(Event::TransportDisconnected { session_id, error })
        }
        SessionEvent::PingTimeout { session_id } => Some(Event::PingTimeout { session_id }),
        SessionEvent::Updates { .. } | SessionEvent::Ack { .. } => None,
    }
}
