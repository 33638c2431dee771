//! Sync engine.
//!
//! Converges local state with the server after every reconnect, gap, or
//! offline period. One actor owns every [`BucketSequencer`]; fetches run as
//! spawned tasks that post their results back to the actor's mailbox,
//! tagged with the session generation they were issued under. A result
//! from an older generation is dropped.
//!
//! ```text
//! session pushes ─┐
//! ingest() ───────┼─► actor ─► BucketSequencer ─► DomainApply
//! fetch results ──┘     │
//!                       ├─► SyncStorage (batched watermarks)
//!                       └─► broadcast<SyncEvent>
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inline_sync_core::{
    fetch_retry_delay, plan_catchup, ApplyMode, BucketSequencer, BucketState, CatchupGate,
    CatchupMode, ConnectionSnapshot, ConnectionState, FetchRequest, Offer, SyncState,
};
use inline_sync_types::{
    BucketKey, GetHistoryInput, GetHistoryResult, GetUpdatesInput, GetUpdatesResult,
    GetUpdatesResultType, GetUpdatesStateInput, GetUpdatesStateResult, Seq, Update, UpdateKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::apply::DomainApply;
use crate::error::{ApplyError, RpcCallError, StorageError};
use crate::session::{ProtocolSession, SessionEvent};
use crate::storage::SyncStorage;
use crate::transport::Transport;

// ===== Policy =====

/// What catch-up does with new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchupMessagePolicy {
    /// Apply them like any other update.
    #[default]
    ApplyDirect,
    /// Skip them and refetch the bucket's history window once the bucket
    /// has caught up.
    RefetchHistory,
}

/// Sync engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// A watermark older than this, against the server clock, forces a full rescan.
    #[serde(default = "default_bucket_safety_gap_secs")]
    pub bucket_safety_gap_secs: i64,
    /// Fetches allowed in flight across all buckets.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Updates requested per gap fetch.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
    /// History window requested by a repair.
    #[serde(default = "default_history_window")]
    pub history_window: u32,
    /// Timeout for each sync RPC.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Out-of-order updates held per bucket.
    #[serde(default = "default_max_buffered_updates")]
    pub max_buffered_updates: usize,
    /// Handling of new messages during catch-up.
    #[serde(default)]
    pub catchup_messages: CatchupMessagePolicy,
    /// Update kinds that catch-up skips. Live pushes still apply them.
    #[serde(default)]
    pub catchup_excluded_kinds: Vec<UpdateKind>,
}

fn default_bucket_safety_gap_secs() -> i64 {
    2 * 24 * 60 * 60
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_fetch_limit() -> u32 {
    100
}

fn default_history_window() -> u32 {
    50
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_max_buffered_updates() -> usize {
    1000
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            bucket_safety_gap_secs: default_bucket_safety_gap_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            fetch_limit: default_fetch_limit(),
            history_window: default_history_window(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_buffered_updates: default_max_buffered_updates(),
            catchup_messages: CatchupMessagePolicy::default(),
            catchup_excluded_kinds: Vec::new(),
        }
    }
}

impl SyncPolicy {
    /// Timeout for each sync RPC.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

// ===== Server API =====

/// The sync RPCs the engine needs.
#[async_trait]
pub trait UpdatesApi: Send + Sync + 'static {
    /// Read a range of one bucket.
    async fn get_updates(
        &self,
        input: GetUpdatesInput,
        timeout: Duration,
    ) -> Result<GetUpdatesResult, RpcCallError>;

    /// List buckets changed since a date.
    async fn get_updates_state(
        &self,
        input: GetUpdatesStateInput,
        timeout: Duration,
    ) -> Result<GetUpdatesStateResult, RpcCallError>;

    /// Read the freshest window of one bucket.
    async fn get_history(
        &self,
        input: GetHistoryInput,
        timeout: Duration,
    ) -> Result<GetHistoryResult, RpcCallError>;
}

#[async_trait]
impl<T: Transport> UpdatesApi for ProtocolSession<T> {
    async fn get_updates(
        &self,
        input: GetUpdatesInput,
        timeout: Duration,
    ) -> Result<GetUpdatesResult, RpcCallError> {
        ProtocolSession::get_updates(self, input, timeout).await
    }

    async fn get_updates_state(
        &self,
        input: GetUpdatesStateInput,
        timeout: Duration,
    ) -> Result<GetUpdatesStateResult, RpcCallError> {
        ProtocolSession::get_updates_state(self, input, timeout).await
    }

    async fn get_history(
        &self,
        input: GetHistoryInput,
        timeout: Duration,
    ) -> Result<GetHistoryResult, RpcCallError> {
        ProtocolSession::get_history(self, input, timeout).await
    }
}

// ===== Events =====

/// Progress reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Reconnect catch-up began for a session.
    CatchupStarted {
        /// Session generation.
        session_id: u64,
    },
    /// Every bucket the catch-up found has caught up.
    CatchupFinished {
        /// Session generation.
        session_id: u64,
        /// How the catch-up ran.
        mode: CatchupMode,
        /// Server date now stored as the sync watermark.
        date: i64,
    },
    /// An update reached the domain.
    Applied {
        /// Bucket.
        bucket: BucketKey,
        /// Seq.
        seq: Seq,
        /// Push or catch-up.
        mode: ApplyMode,
        /// The entity was already stored.
        already_existed: bool,
    },
    /// An update created something the user has not seen.
    NewContent {
        /// The update.
        update: Update,
        /// Push or catch-up.
        mode: ApplyMode,
    },
    /// Local state for a bucket was dropped and replaced by a history window.
    BucketReset {
        /// Bucket.
        bucket: BucketKey,
        /// Server seq the bucket resumed from.
        seq: Seq,
    },
}

// ===== Handle =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryPurpose {
    Repair,
    Refresh,
}

enum Message {
    Ingest(Vec<Update>),
    FetchDone {
        generation: u64,
        bucket: BucketKey,
        result: Result<GetUpdatesResult, RpcCallError>,
    },
    HistoryDone {
        generation: u64,
        bucket: BucketKey,
        purpose: HistoryPurpose,
        result: Result<GetHistoryResult, RpcCallError>,
    },
    StateDone {
        generation: u64,
        since: i64,
        result: Result<GetUpdatesStateResult, RpcCallError>,
    },
    Retry {
        generation: u64,
        bucket: BucketKey,
    },
    RetryCatchup {
        generation: u64,
        since: i64,
    },
    BucketState(BucketKey, oneshot::Sender<Option<BucketState>>),
    SyncState(oneshot::Sender<SyncState>),
    Clear(oneshot::Sender<Result<(), StorageError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Clonable handle to a running sync engine.
#[derive(Clone)]
pub struct SyncHandle {
    mailbox: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<SyncEvent>,
    activity: watch::Receiver<bool>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("catching_up", &*self.activity.borrow())
            .finish()
    }
}

impl SyncHandle {
    fn send(&self, message: Message) -> bool {
        if self.mailbox.send(message).is_err() {
            tracing::debug!("Sync engine is gone; message dropped");
            return false;
        }
        true
    }

    /// Feed updates that arrived outside the push stream (e.g. an RPC
    /// result) through the same sequencing path.
    pub fn ingest(&self, updates: Vec<Update>) {
        if !updates.is_empty() {
            self.send(Message::Ingest(updates));
        }
    }

    /// Receive engine events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Whether a reconnect catch-up is running, as a watch channel.
    pub fn activity(&self) -> watch::Receiver<bool> {
        self.activity.clone()
    }

    /// Whether a reconnect catch-up is running.
    pub fn is_catching_up(&self) -> bool {
        *self.activity.borrow()
    }

    /// In-memory watermark for a bucket the engine has seen.
    pub async fn bucket_state(&self, bucket: BucketKey) -> Option<BucketState> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Message::BucketState(bucket, tx)) {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// In-memory global watermark.
    pub async fn sync_state(&self) -> Option<SyncState> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Message::SyncState(tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// Forget every watermark, in memory and in storage (sign-out).
    ///
    /// Outstanding fetches are cancelled. The next session starts from a
    /// full rescan.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Message::Clear(tx)) {
            return Err(StorageError::Unavailable("sync engine stopped".into()));
        }
        rx.await
            .map_err(|_| StorageError::Unavailable("sync engine stopped".into()))?
    }

    /// Cancel outstanding work, flush watermarks, and stop the actor.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(Message::Shutdown(done)) {
            let _ = wait.await;
        }
    }
}

/// Spawns the engine actor.
pub struct SyncEngine;

impl SyncEngine {
    /// Start the actor.
    ///
    /// `session_events` supplies pushed updates; `connection` tells the
    /// engine when a session opens or closes.
    pub fn spawn<A, S, D>(
        api: Arc<A>,
        storage: Arc<S>,
        domain: Arc<D>,
        policy: SyncPolicy,
        session_events: mpsc::UnboundedReceiver<SessionEvent>,
        connection: watch::Receiver<ConnectionSnapshot>,
    ) -> SyncHandle
    where
        A: UpdatesApi,
        S: SyncStorage,
        D: DomainApply,
    {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (activity_tx, activity_rx) = watch::channel(false);

        let actor = Actor {
            api,
            storage,
            domain,
            permits: Arc::new(Semaphore::new(policy.max_concurrent_fetches.max(1))),
            policy,
            buckets: HashMap::new(),
            sync_state: SyncState::default(),
            generation: None,
            gate: CatchupGate::new(),
            catchup: None,
            catchup_failures: 0,
            refresh: HashMap::new(),
            dirty: HashMap::new(),
            state_dirty: false,
            tasks: Vec::new(),
            mailbox: mailbox_tx.downgrade(),
            events: events.clone(),
            activity: activity_tx,
        };
        tokio::spawn(actor.run(mailbox_rx, session_events, connection));

        SyncHandle {
            mailbox: mailbox_tx,
            events,
            activity: activity_rx,
        }
    }
}

// ===== Actor =====

struct Catchup {
    generation: u64,
    phase: Phase,
}

enum Phase {
    Requesting,
    Draining {
        mode: CatchupMode,
        date: i64,
        waiting: HashSet<BucketKey>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Pending,
    InFlight,
}

/// Where an update reached the apply step from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Sequenced,
    History,
}

struct Actor<A, S, D> {
    api: Arc<A>,
    storage: Arc<S>,
    domain: Arc<D>,
    policy: SyncPolicy,
    buckets: HashMap<BucketKey, BucketSequencer>,
    sync_state: SyncState,
    /// Session the engine is working under; `None` while closed.
    generation: Option<u64>,
    gate: CatchupGate,
    catchup: Option<Catchup>,
    catchup_failures: u32,
    refresh: HashMap<BucketKey, Refresh>,
    /// Watermarks not yet persisted.
    dirty: HashMap<BucketKey, BucketState>,
    state_dirty: bool,
    permits: Arc<Semaphore>,
    tasks: Vec<JoinHandle<()>>,
    mailbox: mpsc::WeakUnboundedSender<Message>,
    events: broadcast::Sender<SyncEvent>,
    activity: watch::Sender<bool>,
}

fn post(mailbox: &mpsc::WeakUnboundedSender<Message>, message: Message) {
    if let Some(tx) = mailbox.upgrade() {
        let _ = tx.send(message);
    }
}

impl<A: UpdatesApi, S: SyncStorage, D: DomainApply> Actor<A, S, D> {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<Message>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut connection: watch::Receiver<ConnectionSnapshot>,
    ) {
        match self.storage.get_state().await {
            Ok(state) => self.sync_state = state,
            Err(e) => tracing::warn!("Loading sync state failed: {}", e),
        }
        let snapshot = connection.borrow_and_update().clone();
        self.on_connection(&snapshot).await;
        self.after_step().await;

        loop {
            tokio::select! {
                message = mailbox.recv() => match message {
                    Some(message) => {
                        if !self.handle(message).await {
                            return;
                        }
                    }
                    None => break,
                },
                Some(event) = session_events.recv() => {
                    if let SessionEvent::Updates { updates, .. } = event {
                        self.on_updates(updates, ApplyMode::Push).await;
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Connection manager gone");
                        break;
                    }
                    let snapshot = connection.borrow_and_update().clone();
                    self.on_connection(&snapshot).await;
                }
            }
            self.after_step().await;
        }

        self.close();
        self.flush().await;
        tracing::info!("Sync engine stopped");
    }

    /// Returns false once the actor should exit.
    async fn handle(&mut self, message: Message) -> bool {
        match message {
            Message::Ingest(updates) => self.on_updates(updates, ApplyMode::Push).await,
            Message::FetchDone {
                generation,
                bucket,
                result,
            } => {
                if self.is_current(generation) {
                    self.on_fetch_done(bucket, result).await;
                } else {
                    tracing::debug!("Dropping fetch for {} from session {}", bucket, generation);
                }
            }
            Message::HistoryDone {
                generation,
                bucket,
                purpose,
                result,
            } => {
                if !self.is_current(generation) {
                    tracing::debug!("Dropping history for {} from session {}", bucket, generation);
                } else if purpose == HistoryPurpose::Repair {
                    self.on_repair_done(bucket, result).await;
                } else {
                    self.on_refresh_done(bucket, result).await;
                }
            }
            Message::StateDone {
                generation,
                since,
                result,
            } => self.on_state_done(generation, since, result).await,
            Message::Retry { generation, bucket } => {
                if self.is_current(generation) {
                    self.resume(bucket).await;
                }
            }
            Message::RetryCatchup { generation, since } => {
                if self.is_current(generation) && self.is_requesting(generation) {
                    self.request_state(generation, since);
                }
            }
            Message::BucketState(bucket, reply) => {
                let _ = reply.send(self.buckets.get(&bucket).map(BucketSequencer::state));
            }
            Message::SyncState(reply) => {
                let _ = reply.send(self.sync_state);
            }
            Message::Clear(reply) => {
                let result = self.clear().await;
                let _ = reply.send(result);
            }
            Message::Shutdown(done) => {
                self.close();
                self.flush().await;
                tracing::info!("Sync engine stopped");
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == Some(generation)
    }

    fn is_requesting(&self, generation: u64) -> bool {
        matches!(
            &self.catchup,
            Some(Catchup { generation: g, phase: Phase::Requesting }) if *g == generation
        )
    }

    async fn after_step(&mut self) {
        self.flush().await;
        self.check_catchup().await;
    }

    // ----- Connection -----

    async fn on_connection(&mut self, snapshot: &ConnectionSnapshot) {
        let open = snapshot.state == ConnectionState::Open;
        match (open, self.generation) {
            (true, Some(current)) if current == snapshot.session_id => {}
            (true, _) => {
                self.close();
                self.opened(snapshot.session_id).await;
            }
            (false, Some(_)) => self.close(),
            (false, None) => {}
        }
    }

    async fn opened(&mut self, generation: u64) {
        self.generation = Some(generation);
        if self.gate.admit(generation) {
            let since = self.sync_state.last_sync_date.unwrap_or(0);
            tracing::info!("Session {} open; catching up since {}", generation, since);
            self.catchup = Some(Catchup {
                generation,
                phase: Phase::Requesting,
            });
            self.catchup_failures = 0;
            self.set_activity(true);
            self.emit(SyncEvent::CatchupStarted {
                session_id: generation,
            });
            self.request_state(generation, since);
        }

        let buckets: Vec<BucketKey> = self.buckets.keys().copied().collect();
        for bucket in buckets {
            self.resume(bucket).await;
        }
    }

    /// Stop all work belonging to the current session.
    fn close(&mut self) {
        if let Some(generation) = self.generation.take() {
            tracing::debug!("Sync paused; session {} closed", generation);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for sequencer in self.buckets.values_mut() {
            sequencer.cancel_in_flight();
        }
        for state in self.refresh.values_mut() {
            *state = Refresh::Pending;
        }
        if self.catchup.take().is_some() {
            self.set_activity(false);
        }
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.buckets.clear();
        self.refresh.clear();
        self.dirty.clear();
        self.sync_state = SyncState::default();
        self.state_dirty = false;
        if self.catchup.take().is_some() {
            self.set_activity(false);
        }
        tracing::info!("Clearing sync state");
        self.storage.clear_sync_state().await
    }

    // ----- Sequencing -----

    async fn on_updates(&mut self, updates: Vec<Update>, mode: ApplyMode) {
        for update in updates {
            self.deliver(update, mode).await;
        }
    }

    async fn load(&mut self, bucket: BucketKey) {
        if self.buckets.contains_key(&bucket) {
            return;
        }
        let state = match self.storage.get_bucket_state(bucket).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Loading watermark for {} failed: {}", bucket, e);
                BucketState::default()
            }
        };
        let max_buffered = self.policy.max_buffered_updates;
        self.buckets
            .entry(bucket)
            .or_insert_with(|| BucketSequencer::new(bucket, state, max_buffered));
    }

    /// Offer one update to its bucket. Returns false if an apply failed and
    /// a retry was scheduled.
    async fn deliver(&mut self, update: Update, mode: ApplyMode) -> bool {
        let bucket = update.bucket;
        self.load(bucket).await;
        let Some(sequencer) = self.buckets.get_mut(&bucket) else {
            return true;
        };
        match sequencer.offer(update, mode) {
            Offer::Apply(update) => self.apply_chain(bucket, update, mode).await,
            Offer::Buffered => {
                self.pump(bucket);
                true
            }
            Offer::Duplicate => true,
            Offer::Dropped(e) => {
                tracing::debug!("Not buffering {} update: {}", bucket, e);
                self.pump(bucket);
                true
            }
        }
    }

    /// Apply `first`, then everything in the buffer that became contiguous.
    async fn apply_chain(&mut self, bucket: BucketKey, first: Update, mode: ApplyMode) -> bool {
        let mut next = Some((first, mode));
        while let Some((update, mode)) = next.take() {
            let outcome = self.apply_one(&update, mode, Source::Sequenced).await;
            let Some(sequencer) = self.buckets.get_mut(&bucket) else {
                return true;
            };
            match outcome {
                Ok(()) => {
                    sequencer.advance(update.seq, update.date);
                    self.dirty.insert(bucket, sequencer.state());
                    next = sequencer.pop_ready();
                }
                Err(e) => {
                    tracing::warn!("Applying {} seq {} failed: {}", bucket, update.seq, e);
                    sequencer.requeue(update, mode);
                    let attempt = sequencer.record_failure();
                    self.schedule_retry(bucket, attempt);
                    return false;
                }
            }
        }
        true
    }

    async fn apply_one(
        &mut self,
        update: &Update,
        mode: ApplyMode,
        source: Source,
    ) -> Result<(), ApplyError> {
        if mode == ApplyMode::Catchup {
            let kind = update.kind();
            if self.policy.catchup_excluded_kinds.contains(&kind) {
                tracing::debug!(
                    "Catch-up skips {:?} at {} seq {}",
                    kind,
                    update.bucket,
                    update.seq
                );
                return Ok(());
            }
            if source == Source::Sequenced
                && kind == UpdateKind::NewMessage
                && self.policy.catchup_messages == CatchupMessagePolicy::RefetchHistory
            {
                self.refresh.entry(update.bucket).or_insert(Refresh::Pending);
                return Ok(());
            }
        }

        let result = self.domain.apply(update, mode).await?;
        self.emit(SyncEvent::Applied {
            bucket: update.bucket,
            seq: update.seq,
            mode,
            already_existed: result.already_existed,
        });
        if !result.already_existed {
            self.emit(SyncEvent::NewContent {
                update: update.clone(),
                mode,
            });
        }
        Ok(())
    }

    /// Retry a stalled apply, then start whatever the bucket still needs.
    async fn resume(&mut self, bucket: BucketKey) {
        let ready = self
            .buckets
            .get_mut(&bucket)
            .and_then(BucketSequencer::pop_ready);
        if let Some((update, mode)) = ready {
            if !self.apply_chain(bucket, update, mode).await {
                return;
            }
        }
        self.pump(bucket);
    }

    /// Start the next repair, gap fetch, or history refresh for a bucket.
    fn pump(&mut self, bucket: BucketKey) {
        let Some(generation) = self.generation else {
            return;
        };
        let Some(sequencer) = self.buckets.get_mut(&bucket) else {
            return;
        };
        if sequencer.take_repair() {
            self.spawn_history(generation, bucket, HistoryPurpose::Repair);
        } else if let Some(request) = sequencer.take_fetch() {
            self.spawn_fetch(generation, request);
        } else if sequencer.is_settled() && self.refresh.get(&bucket) == Some(&Refresh::Pending) {
            self.refresh.insert(bucket, Refresh::InFlight);
            self.spawn_history(generation, bucket, HistoryPurpose::Refresh);
        }
    }

    fn schedule_retry(&mut self, bucket: BucketKey, attempt: u32) {
        let Some(generation) = self.generation else {
            return;
        };
        let delay = fetch_retry_delay(attempt);
        tracing::debug!("Retrying {} in {}ms", bucket, delay.as_millis());
        let mailbox = self.mailbox.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            post(&mailbox, Message::Retry { generation, bucket });
        });
    }

    // ----- Fetching -----

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn spawn_fetch(&mut self, generation: u64, request: FetchRequest) {
        let api = Arc::clone(&self.api);
        let permits = Arc::clone(&self.permits);
        let mailbox = self.mailbox.clone();
        let timeout = self.policy.fetch_timeout();
        let bucket = request.bucket;
        let input = GetUpdatesInput {
            bucket,
            start_seq: request.start,
            end_seq: request.end,
            total_limit: self.policy.fetch_limit,
        };
        tracing::debug!("Fetching {} from seq {}", bucket, request.start);

        self.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = api.get_updates(input, timeout).await;
            post(
                &mailbox,
                Message::FetchDone {
                    generation,
                    bucket,
                    result,
                },
            );
        });
    }

    fn spawn_history(&mut self, generation: u64, bucket: BucketKey, purpose: HistoryPurpose) {
        let api = Arc::clone(&self.api);
        let permits = Arc::clone(&self.permits);
        let mailbox = self.mailbox.clone();
        let timeout = self.policy.fetch_timeout();
        let input = GetHistoryInput {
            bucket,
            limit: self.policy.history_window,
        };
        tracing::debug!("Fetching history for {} ({:?})", bucket, purpose);

        self.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = api.get_history(input, timeout).await;
            post(
                &mailbox,
                Message::HistoryDone {
                    generation,
                    bucket,
                    purpose,
                    result,
                },
            );
        });
    }

    async fn on_fetch_done(
        &mut self,
        bucket: BucketKey,
        result: Result<GetUpdatesResult, RpcCallError>,
    ) {
        let Some(sequencer) = self.buckets.get_mut(&bucket) else {
            return;
        };
        let slice = match result {
            Ok(slice) => slice,
            Err(e) => {
                sequencer.fetch_finished();
                let attempt = sequencer.record_failure();
                tracing::warn!("Fetching {} failed (attempt {}): {}", bucket, attempt, e);
                self.schedule_retry(bucket, attempt);
                return;
            }
        };

        sequencer.note_head(slice.seq);
        if slice.result_type == GetUpdatesResultType::TooLong {
            tracing::info!("Gap in {} too long to fetch; repairing", bucket);
            sequencer.fetch_finished();
            sequencer.mark_needs_repair();
            self.pump(bucket);
            return;
        }

        let before = sequencer.state().seq;
        let mut healthy = true;
        for update in slice.updates {
            if update.bucket != bucket {
                tracing::warn!("Fetch for {} returned an update for {}", bucket, update.bucket);
                continue;
            }
            healthy &= self.deliver(update, ApplyMode::Catchup).await;
        }

        let Some(sequencer) = self.buckets.get_mut(&bucket) else {
            return;
        };
        sequencer.fetch_finished();
        if healthy {
            if sequencer.state().seq > before {
                sequencer.record_success();
            } else if sequencer.needs_fetch() {
                if slice.is_final {
                    tracing::info!(
                        "Final slice left {} short of seq {}; repairing",
                        bucket,
                        sequencer.known_head()
                    );
                    sequencer.mark_needs_repair();
                } else {
                    let attempt = sequencer.record_failure();
                    tracing::warn!("Fetch for {} made no progress", bucket);
                    self.schedule_retry(bucket, attempt);
                    return;
                }
            }
        }
        self.pump(bucket);
    }

    // ----- Repair -----

    async fn on_repair_done(
        &mut self,
        bucket: BucketKey,
        result: Result<GetHistoryResult, RpcCallError>,
    ) {
        let window = match result {
            Ok(window) => window,
            Err(e) => {
                self.repair_failed(bucket, &e.to_string());
                return;
            }
        };
        let Some(sequencer) = self.buckets.get(&bucket) else {
            return;
        };
        let expected = sequencer.expected_seq();

        if window.from_seq <= expected {
            for update in window.updates {
                if update.bucket != bucket {
                    continue;
                }
                if !self.deliver(update, ApplyMode::Catchup).await {
                    if let Some(sequencer) = self.buckets.get_mut(&bucket) {
                        sequencer.repair_failed();
                    }
                    return;
                }
            }
        } else {
            tracing::warn!(
                "History for {} starts at seq {}, past seq {}; resetting local state",
                bucket,
                window.from_seq,
                expected
            );
            if let Err(e) = self.domain.reset_bucket(bucket).await {
                self.repair_failed(bucket, &e.to_string());
                return;
            }
            for update in &window.updates {
                if let Err(e) = self.apply_one(update, ApplyMode::Catchup, Source::History).await {
                    self.repair_failed(bucket, &e.to_string());
                    return;
                }
            }
            self.refresh.remove(&bucket);
            self.emit(SyncEvent::BucketReset {
                bucket,
                seq: window.seq,
            });
        }

        let Some(sequencer) = self.buckets.get_mut(&bucket) else {
            return;
        };
        sequencer.repair_complete(window.seq, window.date);
        sequencer.record_success();
        self.dirty.insert(bucket, sequencer.state());
        tracing::info!("Repaired {} at seq {}", bucket, window.seq);
        self.resume(bucket).await;
    }

    fn repair_failed(&mut self, bucket: BucketKey, error: &str) {
        let Some(sequencer) = self.buckets.get_mut(&bucket) else {
            return;
        };
        sequencer.repair_failed();
        let attempt = sequencer.record_failure();
        tracing::warn!("Repairing {} failed (attempt {}): {}", bucket, attempt, error);
        self.schedule_retry(bucket, attempt);
    }

    async fn on_refresh_done(
        &mut self,
        bucket: BucketKey,
        result: Result<GetHistoryResult, RpcCallError>,
    ) {
        let error = match result {
            Ok(window) => {
                let mut error = None;
                for update in &window.updates {
                    if let Err(e) = self.apply_one(update, ApplyMode::Catchup, Source::History).await {
                        error = Some(e.to_string());
                        break;
                    }
                }
                error
            }
            Err(e) => Some(e.to_string()),
        };

        match error {
            None => {
                self.refresh.remove(&bucket);
                tracing::debug!("Refreshed history for {}", bucket);
            }
            Some(e) => {
                self.refresh.insert(bucket, Refresh::Pending);
                let attempt = self
                    .buckets
                    .get_mut(&bucket)
                    .map_or(1, BucketSequencer::record_failure);
                tracing::warn!("Refreshing history for {} failed: {}", bucket, e);
                self.schedule_retry(bucket, attempt);
            }
        }
    }

    // ----- Catch-up -----

    fn request_state(&mut self, generation: u64, since: i64) {
        let api = Arc::clone(&self.api);
        let mailbox = self.mailbox.clone();
        let timeout = self.policy.fetch_timeout();
        self.spawn(async move {
            let result = api
                .get_updates_state(GetUpdatesStateInput { since_date: since }, timeout)
                .await;
            post(
                &mailbox,
                Message::StateDone {
                    generation,
                    since,
                    result,
                },
            );
        });
    }

    async fn on_state_done(
        &mut self,
        generation: u64,
        since: i64,
        result: Result<GetUpdatesStateResult, RpcCallError>,
    ) {
        if !self.is_current(generation) || !self.is_requesting(generation) {
            tracing::debug!("Dropping catch-up state from session {}", generation);
            return;
        }
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                self.catchup_failures = self.catchup_failures.saturating_add(1);
                let delay = fetch_retry_delay(self.catchup_failures);
                tracing::warn!(
                    "Catch-up state request failed (attempt {}): {}",
                    self.catchup_failures,
                    e
                );
                let mailbox = self.mailbox.clone();
                self.spawn(async move {
                    tokio::time::sleep(delay).await;
                    post(&mailbox, Message::RetryCatchup { generation, since });
                });
                return;
            }
        };
        self.catchup_failures = 0;

        let mode = plan_catchup(self.sync_state, state.date, self.policy.bucket_safety_gap_secs);
        if mode == CatchupMode::Full && since != 0 {
            tracing::info!(
                "Sync watermark {} is stale against server date {}; rescanning every bucket",
                since,
                state.date
            );
            self.request_state(generation, 0);
            return;
        }

        tracing::info!(
            "Catch-up ({:?}) found {} changed buckets",
            mode,
            state.buckets.len()
        );
        let mut waiting = HashSet::new();
        for head in state.buckets {
            self.load(head.bucket).await;
            if let Some(sequencer) = self.buckets.get_mut(&head.bucket) {
                sequencer.note_head(head.seq);
                if !sequencer.is_settled() {
                    waiting.insert(head.bucket);
                }
            }
        }
        for bucket in &waiting {
            self.pump(*bucket);
        }
        if let Some(catchup) = self.catchup.as_mut() {
            catchup.phase = Phase::Draining {
                mode,
                date: state.date,
                waiting,
            };
        }
    }

    fn bucket_settled(&self, bucket: &BucketKey) -> bool {
        self.buckets
            .get(bucket)
            .map_or(true, BucketSequencer::is_settled)
            && !self.refresh.contains_key(bucket)
    }

    async fn check_catchup(&mut self) {
        let done = match &self.catchup {
            Some(Catchup {
                generation,
                phase: Phase::Draining { waiting, .. },
            }) => self.is_current(*generation) && waiting.iter().all(|b| self.bucket_settled(b)),
            _ => false,
        };
        if !done {
            return;
        }
        let Some(Catchup {
            generation,
            phase: Phase::Draining {
                mode,
                date,
                waiting,
            },
        }) = self.catchup.take()
        else {
            return;
        };

        // Only now may the global watermark move; flush writes buckets first.
        self.sync_state.advance_to(date);
        self.state_dirty = true;
        self.flush().await;

        tracing::info!(
            "Catch-up for session {} finished ({} buckets)",
            generation,
            waiting.len()
        );
        self.emit(SyncEvent::CatchupFinished {
            session_id: generation,
            mode,
            date,
        });
        self.set_activity(false);
    }

    // ----- Persistence and events -----

    /// Persist dirty watermarks. Bucket states go first; the global state
    /// only follows once they landed.
    async fn flush(&mut self) {
        if !self.dirty.is_empty() {
            if let Err(e) = self.storage.set_bucket_states(&self.dirty).await {
                tracing::warn!(
                    "Persisting {} bucket watermarks failed: {}",
                    self.dirty.len(),
                    e
                );
                return;
            }
            self.dirty.clear();
        }
        if self.state_dirty {
            match self.storage.set_state(self.sync_state).await {
                Ok(()) => self.state_dirty = false,
                Err(e) => tracing::warn!("Persisting sync state failed: {}", e),
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_activity(&self, catching_up: bool) {
        self.activity.send_if_modified(|current| {
            if *current == catching_up {
                false
            } else {
                *current = catching_up;
                true
            }
        });
    }
}
