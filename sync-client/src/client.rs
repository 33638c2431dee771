//! RealtimeClient - the main interface for the realtime sync core.
//!
//! [`RealtimeClient`] wires one [`ProtocolSession`] to a
//! [`ConnectionManager`] and a [`SyncEngine`], and forwards the engine's
//! catch-up activity back to the manager so the connection reports
//! `Syncing` while a catch-up runs.
//!
//! # Architecture
//!
//! ```text
//! Application → RealtimeClient ─┬→ ConnectionManager ─→ ProtocolSession → Transport
//!                               │          ↑ snapshots        │ pushes
//!                               └→ SyncEngine ←───────────────┘
//!                                     ↓
//!                          SyncStorage + DomainApply
//! ```
//!
//! # Example
//!
//! ```ignore
//! use inline_sync_client::{ClientConfig, MemoryDomain, RealtimeClient, SqliteSyncStorage};
//!
//! let config = ClientConfig::from_file(path)?.apply_env();
//! let storage = Arc::new(SqliteSyncStorage::open(&db_path).await?);
//! let client = RealtimeClient::websocket(config, storage, Arc::new(MemoryDomain::new()));
//! client.start();
//! let me = client.get_me().await?;
//! ```

use std::sync::Arc;

use inline_sync_types::{GetMeResult, RpcInput, RpcResult, SendMessageInput, SendMessageResult};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::apply::DomainApply;
use crate::config::{ClientConfig, ConfigError};
use crate::engine::{SyncEngine, SyncEvent, SyncHandle};
use crate::error::{RpcCallError, StorageError};
use crate::manager::{ConnectionHandle, ConnectionManager};
use crate::session::{ProtocolSession, SessionConfig};
use crate::storage::SyncStorage;
use crate::transport::{Transport, WebSocketTransport};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// RPC failed.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcCallError),

    /// Sync storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// A connected realtime client.
///
/// Must be created inside a Tokio runtime; the manager and engine run as
/// tasks.
pub struct RealtimeClient<T: Transport> {
    config: ClientConfig,
    session: ProtocolSession<T>,
    connection: ConnectionHandle,
    sync: SyncHandle,
    activity_task: JoinHandle<()>,
}

impl<T: Transport> std::fmt::Debug for RealtimeClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("realtime_url", &self.config.realtime_url)
            .field("connection", &self.connection)
            .field("sync", &self.sync)
            .finish()
    }
}

impl RealtimeClient<WebSocketTransport> {
    /// Create a client speaking WebSocket to `config.realtime_url`.
    pub fn websocket<S, D>(config: ClientConfig, storage: Arc<S>, domain: Arc<D>) -> Self
    where
        S: SyncStorage,
        D: DomainApply,
    {
        Self::new(config, WebSocketTransport::new(), storage, domain)
    }
}

impl<T: Transport> RealtimeClient<T> {
    /// Create a client over `transport`.
    ///
    /// Nothing connects until [`start`](Self::start) is called. If the
    /// config carries an auth token it is handed to the manager.
    pub fn new<S, D>(config: ClientConfig, transport: T, storage: Arc<S>, domain: Arc<D>) -> Self
    where
        S: SyncStorage,
        D: DomainApply,
    {
        let session = ProtocolSession::new(
            transport,
            SessionConfig::new(config.realtime_url.clone(), &config.connection),
        );
        let pushes = session.subscribe();
        let connection = ConnectionManager::spawn(session.clone(), config.connection.clone());
        let sync = SyncEngine::spawn(
            Arc::new(session.clone()),
            storage,
            domain,
            config.sync.clone(),
            pushes,
            connection.subscribe(),
        );

        if let Some(token) = config.auth_token.clone() {
            connection.set_auth_token(Some(token));
        }
        let activity_task = tokio::spawn(forward_activity(sync.activity(), connection.clone()));

        tracing::info!("Realtime client created for {}", config.realtime_url);
        Self {
            config,
            session,
            connection,
            sync,
            activity_task,
        }
    }

    /// Ask the manager to connect.
    pub fn start(&self) {
        self.connection.start();
    }

    /// Ask the manager to disconnect and stay disconnected.
    pub fn stop(&self) {
        self.connection.stop();
    }

    /// Connection manager handle.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Sync engine handle.
    pub fn sync(&self) -> &SyncHandle {
        &self.sync
    }

    /// The underlying session.
    pub fn session(&self) -> &ProtocolSession<T> {
        &self.session
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to sync engine events.
    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    /// `GET_ME` on the open session.
    pub async fn get_me(&self) -> Result<GetMeResult, ClientError> {
        Ok(self.session.get_me(self.config.rpc_timeout()).await?)
    }

    /// `SEND_MESSAGE`; the updates it returns go through the sync engine.
    pub async fn send_message(
        &self,
        input: SendMessageInput,
    ) -> Result<SendMessageResult, ClientError> {
        let result = self
            .session
            .send_message(input, self.config.rpc_timeout())
            .await?;
        if !result.updates.is_empty() {
            self.sync.ingest(result.updates.clone());
        }
        Ok(result)
    }

    /// Any RPC, with the configured timeout.
    pub async fn call_rpc(&self, input: RpcInput) -> Result<RpcResult, ClientError> {
        Ok(self
            .session
            .call_rpc(input, self.config.rpc_timeout())
            .await?)
    }

    /// Drop all sync progress, e.g. on logout.
    pub async fn clear_sync_state(&self) -> Result<(), ClientError> {
        Ok(self.sync.clear().await?)
    }

    /// Stop the engine and the manager, closing the session.
    pub async fn shutdown(self) {
        self.activity_task.abort();
        self.sync.shutdown().await;
        self.connection.shutdown().await;
        tracing::info!("Realtime client shut down");
    }
}

async fn forward_activity(mut activity: watch::Receiver<bool>, connection: ConnectionHandle) {
    while activity.changed().await.is_ok() {
        let catching_up = *activity.borrow_and_update();
        connection.report_sync_activity(catching_up);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::MemoryDomain;
    use crate::session::fake_server::responder;
    use crate::storage::MemorySyncStorage;
    use crate::transport::MockTransport;
    use inline_sync_core::{ConnectionSnapshot, ConnectionState, Reason};
    use inline_sync_types::{
        AuthToken, BucketKey, GetUpdatesStateResult, MessageRecord, Seq, Update, UpdatePayload,
        User,
    };
    use std::time::Duration;

    fn me() -> RpcResult {
        RpcResult::GetMe(GetMeResult {
            user: User {
                id: 7,
                first_name: Some("Mo".into()),
                last_name: None,
                username: Some("mo".into()),
            },
        })
    }

    fn sent(input: &SendMessageInput) -> RpcResult {
        let record = MessageRecord {
            id: 1,
            chat_id: input.chat_id,
            from_id: 7,
            date: 100,
            text: input.text.clone(),
            random_id: Some(input.random_id),
            reply_to_msg_id: input.reply_to_msg_id,
        };
        RpcResult::SendMessage(SendMessageResult {
            updates: vec![Update {
                bucket: BucketKey::Chat(input.chat_id),
                seq: Seq::new(1),
                date: 100,
                payload: UpdatePayload::NewMessage(record),
            }],
        })
    }

    /// A server that answers everything; catch-up sees no changed buckets.
    fn full_server(transport: &MockTransport) {
        transport.set_responder(responder(|input| match input {
            RpcInput::GetMe(_) => Some(me()),
            RpcInput::SendMessage(send) => Some(sent(send)),
            RpcInput::GetUpdatesState(_) => {
                Some(RpcResult::GetUpdatesState(GetUpdatesStateResult {
                    date: 100,
                    buckets: Vec::new(),
                }))
            }
            _ => None,
        }));
    }

    fn config() -> ClientConfig {
        ClientConfig {
            realtime_url: "wss://test/realtime".into(),
            auth_token: Some(AuthToken::new("token")),
            ..ClientConfig::default()
        }
    }

    fn client(
        transport: &MockTransport,
        domain: &Arc<MemoryDomain>,
    ) -> RealtimeClient<MockTransport> {
        RealtimeClient::new(
            config(),
            transport.clone(),
            Arc::new(MemorySyncStorage::new()),
            domain.clone(),
        )
    }

    async fn wait_for(
        client: &RealtimeClient<MockTransport>,
        pred: impl Fn(&ConnectionSnapshot) -> bool,
    ) -> ConnectionSnapshot {
        let mut rx = client.connection().subscribe();
        let wait = async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.expect("manager alive");
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .expect("snapshot in time")
    }

    // ===== Lifecycle =====

    #[tokio::test(start_paused = true)]
    async fn does_not_connect_until_started() {
        let transport = MockTransport::new();
        full_server(&transport);
        let client = client(&transport, &Arc::new(MemoryDomain::new()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connect_count(), 0);
        assert_eq!(client.connection().snapshot().state, ConnectionState::Stopped);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_configured_url_and_finishes_catchup() {
        let transport = MockTransport::new();
        full_server(&transport);
        let client = client(&transport, &Arc::new(MemoryDomain::new()));
        let mut events = client.subscribe_sync();

        client.start();
        wait_for(&client, |s| s.state == ConnectionState::Open).await;
        assert_eq!(
            transport.connected_address().as_deref(),
            Some("wss://test/realtime")
        );

        let finished = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let Ok(SyncEvent::CatchupFinished { date, .. }) = events.recv().await {
                    return date;
                }
            }
        })
        .await
        .expect("catch-up finished");
        assert_eq!(finished, 100);

        let idle = wait_for(&client, |s| s.reason == Reason::Connected).await;
        assert_eq!(idle.state, ConnectionState::Open);
        assert_eq!(
            client.sync().sync_state().await.and_then(|s| s.last_sync_date),
            Some(100)
        );
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_catchup_reports_syncing() {
        let transport = MockTransport::new();
        transport.set_responder(responder(|input| match input {
            RpcInput::GetMe(_) => Some(me()),
            _ => None,
        }));
        let client = client(&transport, &Arc::new(MemoryDomain::new()));

        client.start();
        let syncing = wait_for(&client, |s| s.reason == Reason::Syncing).await;
        assert_eq!(syncing.state, ConnectionState::Open);
        assert!(client.sync().is_catching_up());
        client.shutdown().await;
    }

    // ===== RPCs =====

    #[tokio::test(start_paused = true)]
    async fn get_me_on_open_session() {
        let transport = MockTransport::new();
        full_server(&transport);
        let client = client(&transport, &Arc::new(MemoryDomain::new()));
        client.start();
        wait_for(&client, |s| s.state == ConnectionState::Open).await;

        let result = client.get_me().await.unwrap();
        assert_eq!(result.user.id, 7);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_before_open_fails() {
        let transport = MockTransport::new();
        full_server(&transport);
        let client = client(&transport, &Arc::new(MemoryDomain::new()));

        let err = client.get_me().await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(RpcCallError::NotConnected)));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sent_message_updates_reach_domain() {
        let transport = MockTransport::new();
        full_server(&transport);
        let domain = Arc::new(MemoryDomain::new());
        let client = client(&transport, &domain);
        client.start();
        wait_for(&client, |s| s.state == ConnectionState::Open).await;

        let result = client
            .send_message(SendMessageInput {
                chat_id: 3,
                text: Some("hello".into()),
                reply_to_msg_id: None,
                random_id: 42,
            })
            .await
            .unwrap();
        assert_eq!(result.updates.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = domain.message(3, 1).expect("message applied");
        assert_eq!(stored.text.as_deref(), Some("hello"));
        assert_eq!(
            client
                .sync()
                .bucket_state(BucketKey::Chat(3))
                .await
                .map(|state| state.seq),
            Some(Seq::new(1))
        );
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_session() {
        let transport = MockTransport::new();
        full_server(&transport);
        let client = client(&transport, &Arc::new(MemoryDomain::new()));
        client.start();
        wait_for(&client, |s| s.state == ConnectionState::Open).await;
        let session = client.session().clone();

        client.shutdown().await;
        assert!(!session.is_open());
        assert!(!transport.is_connected());
    }
}
