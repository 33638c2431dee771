//! Protocol session.
//!
//! Turns a raw [`Transport`] into typed request/response and push
//! semantics:
//!
//! - `start()` connects, sends `ConnectionInit`, and runs the reader
//! - RPC replies resolve entries in the [`PendingCalls`] table
//! - pushed update batches are acknowledged and forwarded to subscribers
//! - pongs go to the heartbeat
//!
//! The session never decides whether to reconnect. It reports what happened
//! as [`SessionEvent`]s tagged with the attempt's `session_id` and leaves
//! the decision to the connection manager.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use inline_sync_core::ConnectionPolicy;
use inline_sync_types::{
    Ack, AuthToken, ClientBody, ClientMessage, ConnectionInit, GetHistoryInput, GetHistoryResult,
    GetMeInput, GetMeResult, GetUpdatesInput, GetUpdatesResult, GetUpdatesStateInput,
    GetUpdatesStateResult, MessageId, MessageIdGenerator, Method, Ping, RpcCall, RpcInput,
    RpcResult, SendMessageInput, SendMessageResult, ServerBody, ServerMessage, ServerPush, Update,
    PROTOCOL_LAYER,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RpcCallError;
use crate::heartbeat::{Heartbeat, PingSink};
use crate::pending::PendingCalls;
use crate::transport::{Transport, TransportError};

/// Longest a transport close may hold up [`ProtocolSession::stop`].
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that happened on the session, for the manager and the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport connected; the handshake is being sent.
    TransportConnected {
        /// Attempt.
        session_id: u64,
    },
    /// Connecting or sending the handshake failed.
    TransportFailed {
        /// Attempt.
        session_id: u64,
        /// What went wrong.
        error: String,
    },
    /// The server accepted the handshake.
    Opened {
        /// Attempt.
        session_id: u64,
    },
    /// The server refused the handshake.
    AuthRejected {
        /// Attempt.
        session_id: u64,
        /// Server's reason.
        error: String,
    },
    /// The transport closed underneath the session.
    Disconnected {
        /// Attempt.
        session_id: u64,
        /// What went wrong.
        error: String,
    },
    /// The heartbeat saw no pong in time.
    PingTimeout {
        /// Attempt.
        session_id: u64,
    },
    /// The server pushed updates.
    Updates {
        /// Attempt.
        session_id: u64,
        /// Updates in server order.
        updates: Vec<Update>,
    },
    /// The server confirmed delivery of one of our messages.
    Ack {
        /// Attempt.
        session_id: u64,
        /// Our message that was confirmed.
        msg_id: MessageId,
    },
}

impl SessionEvent {
    /// Attempt the event belongs to.
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::TransportConnected { session_id }
            | SessionEvent::TransportFailed { session_id, .. }
            | SessionEvent::Opened { session_id }
            | SessionEvent::AuthRejected { session_id, .. }
            | SessionEvent::Disconnected { session_id, .. }
            | SessionEvent::PingTimeout { session_id }
            | SessionEvent::Updates { session_id, .. }
            | SessionEvent::Ack { session_id, .. } => *session_id,
        }
    }
}

/// Settings a session needs from the client configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Realtime endpoint.
    pub address: String,
    /// Sent in `ConnectionInit`.
    pub client_version: Option<String>,
    /// Heartbeat interval.
    pub ping_interval: Duration,
    /// Heartbeat timeout.
    pub ping_timeout: Duration,
}

impl SessionConfig {
    /// Build from an address and the connection policy.
    pub fn new(address: impl Into<String>, policy: &ConnectionPolicy) -> Self {
        Self {
            address: address.into(),
            client_version: Some(concat!("inline-sync/", env!("CARGO_PKG_VERSION")).to_string()),
            ping_interval: policy.ping_interval(),
            ping_timeout: policy.ping_timeout(),
        }
    }
}

#[derive(Default)]
struct Tasks {
    driver: Option<JoinHandle<()>>,
    heartbeat: Option<Heartbeat>,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    ids: Mutex<MessageIdGenerator>,
    seq: AtomicU32,
    pending: PendingCalls,
    session_id: AtomicU64,
    open: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    tasks: Mutex<Tasks>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A protocol session over one transport. Cheap to clone.
pub struct ProtocolSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ProtocolSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> ProtocolSession<T> {
    /// Create an idle session.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport: Arc::new(transport),
                config,
                ids: Mutex::new(MessageIdGenerator::new()),
                seq: AtomicU32::new(0),
                pending: PendingCalls::new(),
                session_id: AtomicU64::new(0),
                open: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Receive every event from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// Begin attempt `session_id`: connect, send the handshake, read.
    ///
    /// Any previous attempt is abandoned first.
    pub fn start(&self, session_id: u64, token: AuthToken) {
        self.abort_driver();
        self.shared.reset();
        self.shared.session_id.store(session_id, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let driver = tokio::spawn(async move { shared.drive(session_id, token).await });
        lock(&self.shared.tasks).driver = Some(driver);
    }

    /// Abandon the current attempt and close the transport.
    ///
    /// A close that hangs (dead peer, full socket buffer) is abandoned after
    /// [`CLOSE_TIMEOUT`].
    pub async fn stop(&self) {
        self.abort_driver();
        self.shared.reset();
        match tokio::time::timeout(CLOSE_TIMEOUT, self.shared.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Transport close failed: {}", e),
            Err(_) => tracing::warn!(
                "Transport close still pending after {}s; abandoning it",
                CLOSE_TIMEOUT.as_secs()
            ),
        }
    }

    /// Fail pending calls, forget ids and sequence, stop the heartbeat.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// The handshake completed and the session has not reset since.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Attempt this session is serving.
    pub fn session_id(&self) -> u64 {
        self.shared.session_id.load(Ordering::SeqCst)
    }

    /// Calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Send an RPC without waiting for its reply. Returns the message id.
    pub async fn send_rpc(&self, input: RpcInput) -> Result<MessageId, RpcCallError> {
        self.ensure_open()?;
        let message = self.shared.frame(rpc_body(input));
        self.shared.send_frame(&message).await?;
        Ok(message.id)
    }

    /// Send an RPC and wait for its result, an error, a timeout, or a reset.
    pub async fn call_rpc(
        &self,
        input: RpcInput,
        timeout: Duration,
    ) -> Result<RpcResult, RpcCallError> {
        self.ensure_open()?;
        let method = input.method();
        let message = self.shared.frame(rpc_body(input));
        let id = message.id;

        // Registered first so a fast reply cannot miss it.
        let mut rx = self.shared.pending.register(id, method);

        // The deadline covers the write too; a reset ends a stuck write.
        let exchange = tokio::time::timeout(timeout, async {
            tokio::select! {
                sent = self.shared.send_frame(&message) => {
                    if let Err(e) = sent {
                        return Err(e);
                    }
                }
                outcome = &mut rx => return outcome.unwrap_or(Err(RpcCallError::Stopped)),
            }
            (&mut rx).await.unwrap_or(Err(RpcCallError::Stopped))
        })
        .await;

        match exchange {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.shared.pending.cancel(id);
                Err(e)
            }
            Err(_) => {
                self.shared.pending.cancel(id);
                Err(RpcCallError::Timeout {
                    method,
                    after: timeout,
                })
            }
        }
    }

    /// Confirm delivery of a server message.
    pub async fn send_ack(&self, msg_id: MessageId) -> Result<(), RpcCallError> {
        self.shared.send_ack(msg_id).await
    }

    /// `GET_ME`.
    pub async fn get_me(&self, timeout: Duration) -> Result<GetMeResult, RpcCallError> {
        match self.call_rpc(RpcInput::GetMe(GetMeInput {}), timeout).await? {
            RpcResult::GetMe(result) => Ok(result),
            other => Err(unexpected(Method::GetMe, &other)),
        }
    }

    /// `SEND_MESSAGE`.
    pub async fn send_message(
        &self,
        input: SendMessageInput,
        timeout: Duration,
    ) -> Result<SendMessageResult, RpcCallError> {
        match self.call_rpc(RpcInput::SendMessage(input), timeout).await? {
            RpcResult::SendMessage(result) => Ok(result),
            other => Err(unexpected(Method::SendMessage, &other)),
        }
    }

    /// `GET_UPDATES`.
    pub async fn get_updates(
        &self,
        input: GetUpdatesInput,
        timeout: Duration,
    ) -> Result<GetUpdatesResult, RpcCallError> {
        match self.call_rpc(RpcInput::GetUpdates(input), timeout).await? {
            RpcResult::GetUpdates(result) => Ok(result),
            other => Err(unexpected(Method::GetUpdates, &other)),
        }
    }

    /// `GET_UPDATES_STATE`.
    pub async fn get_updates_state(
        &self,
        input: GetUpdatesStateInput,
        timeout: Duration,
    ) -> Result<GetUpdatesStateResult, RpcCallError> {
        match self.call_rpc(RpcInput::GetUpdatesState(input), timeout).await? {
            RpcResult::GetUpdatesState(result) => Ok(result),
            other => Err(unexpected(Method::GetUpdatesState, &other)),
        }
    }

    /// `GET_HISTORY`.
    pub async fn get_history(
        &self,
        input: GetHistoryInput,
        timeout: Duration,
    ) -> Result<GetHistoryResult, RpcCallError> {
        match self.call_rpc(RpcInput::GetHistory(input), timeout).await? {
            RpcResult::GetHistory(result) => Ok(result),
            other => Err(unexpected(Method::GetHistory, &other)),
        }
    }

    fn ensure_open(&self) -> Result<(), RpcCallError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RpcCallError::NotConnected)
        }
    }

    fn abort_driver(&self) {
        if let Some(driver) = lock(&self.shared.tasks).driver.take() {
            driver.abort();
        }
    }
}

fn rpc_body(input: RpcInput) -> ClientBody {
    ClientBody::RpcCall(RpcCall {
        method: input.method(),
        input,
    })
}

fn unexpected(expected: Method, actual: &RpcResult) -> RpcCallError {
    RpcCallError::UnexpectedResult {
        expected,
        actual: actual.method(),
    }
}

impl<T: Transport> Shared<T> {
    fn is_current(&self, session_id: u64) -> bool {
        self.session_id.load(Ordering::SeqCst) == session_id
    }

    fn emit(&self, event: SessionEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn reset(&self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.tasks).heartbeat = None;
        let rejected = self.pending.reject_all();
        if rejected > 0 {
            tracing::debug!("Session reset rejected {} pending calls", rejected);
        }
        lock(&self.ids).reset();
        self.seq.store(0, Ordering::SeqCst);
    }

    fn frame(&self, body: ClientBody) -> ClientMessage {
        let id = lock(&self.ids).next_id();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        ClientMessage { id, seq, body }
    }

    async fn send_frame(&self, message: &ClientMessage) -> Result<(), RpcCallError> {
        let bytes = message.to_bytes()?;
        self.transport.send(&bytes).await?;
        Ok(())
    }

    async fn send_ack(&self, msg_id: MessageId) -> Result<(), RpcCallError> {
        let message = self.frame(ClientBody::Ack(Ack { msg_id }));
        self.send_frame(&message).await
    }

    async fn drive(self: Arc<Self>, session_id: u64, token: AuthToken) {
        if let Err(e) = self.transport.connect(&self.config.address).await {
            tracing::warn!("Connect to {} failed: {}", self.config.address, e);
            self.emit(SessionEvent::TransportFailed {
                session_id,
                error: e.to_string(),
            });
            return;
        }
        self.emit(SessionEvent::TransportConnected { session_id });

        let init = self.frame(ClientBody::ConnectionInit(ConnectionInit {
            token,
            client_version: self.config.client_version.clone(),
            layer: PROTOCOL_LAYER,
        }));
        if let Err(e) = self.send_frame(&init).await {
            tracing::warn!("Sending connection init failed: {}", e);
            self.emit(SessionEvent::TransportFailed {
                session_id,
                error: e.to_string(),
            });
            return;
        }

        loop {
            match self.transport.recv().await {
                Ok(frame) => self.dispatch(session_id, &frame).await,
                Err(e) => {
                    if self.is_current(session_id) {
                        self.reset();
                    }
                    let error = match e {
                        TransportError::ConnectionClosed => "connection closed".to_string(),
                        other => other.to_string(),
                    };
                    tracing::info!("Session {} disconnected: {}", session_id, error);
                    self.emit(SessionEvent::Disconnected { session_id, error });
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, session_id: u64, frame: &[u8]) {
        let message = match ServerMessage::from_bytes(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };
        tracing::debug!("Received {} {}", message.kind(), message.id);

        match message.body {
            ServerBody::ConnectionOpen => {
                self.open.store(true, Ordering::SeqCst);
                let heartbeat = Heartbeat::spawn(
                    Arc::downgrade(self),
                    self.config.ping_interval,
                    self.config.ping_timeout,
                );
                lock(&self.tasks).heartbeat = Some(heartbeat);
                tracing::info!("Session {} open", session_id);
                self.emit(SessionEvent::Opened { session_id });
            }
            ServerBody::ConnectionError(rejection) => {
                let error = rejection
                    .reason
                    .unwrap_or_else(|| "connection rejected".to_string());
                tracing::warn!("Handshake rejected: {}", error);
                self.emit(SessionEvent::AuthRejected { session_id, error });
            }
            ServerBody::RpcResult(reply) => {
                if !self.pending.resolve(reply.req_msg_id, Ok(reply.result)) {
                    tracing::warn!("Dropping result for unknown call {}", reply.req_msg_id);
                }
            }
            ServerBody::RpcError(reply) => {
                let outcome = Err(RpcCallError::Rpc {
                    code: reply.error_code,
                    message: reply.message.clone(),
                    status: reply.status,
                });
                if !self.pending.resolve(reply.req_msg_id, outcome) {
                    tracing::warn!(
                        "Dropping error for unknown call {}: {}",
                        reply.req_msg_id,
                        reply.describe()
                    );
                }
            }
            ServerBody::Message(ServerPush::Updates(batch)) => {
                if let Err(e) = self.send_ack(message.id).await {
                    tracing::debug!("Ack for {} failed: {}", message.id, e);
                }
                self.emit(SessionEvent::Updates {
                    session_id,
                    updates: batch.updates,
                });
            }
            ServerBody::Ack(ack) => {
                self.emit(SessionEvent::Ack {
                    session_id,
                    msg_id: ack.msg_id,
                });
            }
            ServerBody::Pong(pong) => {
                if let Some(heartbeat) = lock(&self.tasks).heartbeat.as_ref() {
                    heartbeat.pong(pong.nonce);
                }
            }
        }
    }
}

#[async_trait]
impl<T: Transport> PingSink for Shared<T> {
    async fn send_ping(&self, nonce: u64) -> Result<(), TransportError> {
        let message = self.frame(ClientBody::Ping(Ping { nonce }));
        let bytes = message
            .to_bytes()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.transport.send(&bytes).await
    }

    fn ping_timed_out(&self) {
        if self.open.load(Ordering::SeqCst) {
            self.emit(SessionEvent::PingTimeout {
                session_id: self.session_id.load(Ordering::SeqCst),
            });
        }
    }
}
