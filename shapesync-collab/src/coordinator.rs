//! The sync coordinator: one actor task per open document.
//!
//! ```text
//!  tool layer ──┐                         ┌── watch<Snapshot> ──▶ renderer
//!               │ Command (mpsc)          │
//!               ▼                         │
//!        ┌────────────────────────────────┴──┐
//!        │ actor: ShapeStore + session state │◀── TransportEvent (mpsc)
//!        └──────┬─────────────────────┬──────┘
//!               │ send_update/ephem.  │ save(encode_full)
//!               ▼                     ▼
//!           Transport          PersistenceWriter
//! ```
//!
//! The actor owns the store; nothing outside it ever holds a mutable
//! reference. Handles only enqueue commands, so callers never wait on
//! network or disk. The actor restores the stored snapshot on the blocking
//! pool before it reads its first command, so every write and connect
//! queues behind the restore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shapesync_core::{
    FieldKey, FieldValue, ReplicaId, Shape, ShapeId, ShapeStore, Snapshot, StateVector,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::persistence::{PersistenceStore, PersistenceWriter, RestoreOutcome};
use crate::presence::{
    PresenceConfig, PresenceEntry, PresenceMessage, PresenceTracker, PresenceUpdate, SessionId,
};
use crate::protocol::{MessageType, SyncMessage};
use crate::storage::StorageError;
use crate::transport::{ConnectionStatus, Transport, TransportEvent};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// When dirty state is written to the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Quiet period after the last edit
    pub debounce: Duration,
    /// Upper bound between the first unsaved edit and its flush
    pub max_delay: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Base replica id; each `start` runs under a fresh session suffix of it
    pub replica: ReplicaId,
    pub doc_id: Uuid,
    /// Transport room; defaults to the document id
    pub room_id: String,
    pub session_id: SessionId,
    pub user_id: String,
    pub display_name: String,
    pub flush: FlushPolicy,
    pub presence: PresenceConfig,
    /// How long a disconnect may take before it is abandoned
    pub disconnect_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(doc_id: Uuid) -> Self {
        Self {
            replica: ReplicaId::random(),
            doc_id,
            room_id: doc_id.to_string(),
            session_id: Uuid::new_v4(),
            user_id: "anonymous".to_string(),
            display_name: "Anonymous".to_string(),
            flush: FlushPolicy::default(),
            presence: PresenceConfig::default(),
            disconnect_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_replica(mut self, replica: impl Into<ReplicaId>) -> Self {
        self.replica = replica.into();
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.display_name = display_name.into();
        self
    }

    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Public handle
// ───────────────────────────────────────────────────────────────────

/// Output of a drawing tool.
///
/// Creates and updates are both field writes; either one revives a shape whose
/// deletion is older than the write.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Create(Shape),
    Update(Shape),
    Delete(ShapeId),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("Coordinator stopped")]
    Stopped,
    #[error("Flush failed: {0}")]
    Storage(#[from] StorageError),
}

type FlushAck = oneshot::Sender<Result<(), StorageError>>;

enum Command {
    Write {
        shape_id: ShapeId,
        updates: Vec<(FieldKey, FieldValue)>,
    },
    Tool(ToolResult),
    Delete(ShapeId),
    Restore(ShapeId),
    Connect(Arc<dyn Transport>),
    Disconnect,
    Presence(PresenceUpdate),
    RemotePresence(oneshot::Sender<HashMap<SessionId, PresenceEntry>>),
    Flush(Option<FlushAck>),
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct SyncCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    status: watch::Receiver<ConnectionStatus>,
    restored: watch::Receiver<Option<RestoreOutcome>>,
    replica: ReplicaId,
    session_id: SessionId,
}

impl SyncCoordinator {
    /// Start the actor; it restores the document from `persistence` before
    /// handling any command.
    ///
    /// Must be called inside a tokio runtime. Returns without touching disk;
    /// the snapshot stays empty until the restore finished (see
    /// [`restore_outcome`](Self::restore_outcome)).
    pub fn start(config: CoordinatorConfig, persistence: PersistenceStore) -> Self {
        let replica = config.replica.for_session();
        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Snapshot::default());
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let (restored_tx, restored) = watch::channel(None);

        let handle = Self {
            commands,
            snapshot,
            status,
            restored,
            replica: replica.clone(),
            session_id: config.session_id,
        };

        tokio::spawn(async move {
            let (persistence, store, outcome) =
                persistence.restore(ShapeStore::new(replica)).await;
            log::info!(
                "Opened document {} as {} ({:?}, {})",
                config.doc_id,
                store.replica(),
                outcome,
                persistence.backend_name()
            );
            snapshot_tx.send_replace(store.snapshot());
            restored_tx.send_replace(Some(outcome));

            let actor = Actor {
                store,
                config,
                commands: rx,
                snapshot_tx,
                status_tx,
                writer: PersistenceWriter::spawn(persistence),
                session: None,
                presence_seed: PresenceUpdate::default(),
                dirty_since: None,
                flush_at: None,
            };
            actor.run().await;
        });
        handle
    }

    /// Replica id of this session: the configured base plus a session suffix.
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// What the startup restore found in the snapshot store. Resolves once
    /// the restore finished; the snapshot is published before this.
    pub async fn restore_outcome(&self) -> Result<RestoreOutcome, CoordinatorError> {
        let mut restored = self.restored.clone();
        let outcome = *restored
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        outcome.ok_or(CoordinatorError::Stopped)
    }

    pub fn apply(&self, result: ToolResult) -> Result<(), CoordinatorError> {
        self.send(Command::Tool(result))
    }

    pub fn write_fields<I>(&self, shape_id: ShapeId, updates: I) -> Result<(), CoordinatorError>
    where
        I: IntoIterator<Item = (FieldKey, FieldValue)>,
    {
        self.send(Command::Write {
            shape_id,
            updates: updates.into_iter().collect(),
        })
    }

    pub fn delete_shape(&self, shape_id: ShapeId) -> Result<(), CoordinatorError> {
        self.send(Command::Delete(shape_id))
    }

    pub fn restore_shape(&self, shape_id: ShapeId) -> Result<(), CoordinatorError> {
        self.send(Command::Restore(shape_id))
    }

    /// Join the configured room over `transport`, replacing any current session.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), CoordinatorError> {
        self.send(Command::Connect(transport))
    }

    pub fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.send(Command::Disconnect)
    }

    pub fn update_presence(&self, update: PresenceUpdate) -> Result<(), CoordinatorError> {
        self.send(Command::Presence(update))
    }

    /// Live remote sessions (empty while disconnected).
    pub async fn remote_presence(&self) -> Result<HashMap<SessionId, PresenceEntry>, CoordinatorError> {
        self.request(Command::RemotePresence).await
    }

    /// Latest document state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Notified after every change that altered visible state.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Write the current state now, without waiting for the debounce.
    pub fn flush(&self) -> Result<(), CoordinatorError> {
        self.send(Command::Flush(None))
    }

    /// Like [`flush`](Self::flush), but resolves once the write finished.
    pub async fn flushed(&self) -> Result<(), CoordinatorError> {
        let result = self.request(|ack| Command::Flush(Some(ack))).await?;
        result.map_err(CoordinatorError::from)
    }

    /// Force a flush when the process receives Ctrl-C.
    pub fn flush_on_ctrl_c(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Termination signal, flushing document");
                if handle.flushed().await.is_err() {
                    log::warn!("Flush on termination failed");
                }
            }
        })
    }

    /// Resolves once every command sent before it was processed.
    pub async fn sync(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Sync).await
    }

    /// Disconnect, write a final snapshot and stop the actor.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Shutdown).await
    }

    fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.commands
            .send(command)
            .map_err(|_| CoordinatorError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

/// Floor for the presence heartbeat period; a zero period cannot tick.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Everything tied to one transport connection.
struct Session {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    events_closed: bool,
    connect_task: JoinHandle<()>,
    tracker: PresenceTracker,
    heartbeat: Interval,
    /// Throttled cursor move waiting to go out
    presence_due: Option<Instant>,
}

enum Activity {
    Event(Option<TransportEvent>),
    Heartbeat,
    PresenceDue,
}

impl Session {
    async fn next_activity(&mut self) -> Activity {
        tokio::select! {
            event = self.events.recv(), if !self.events_closed => Activity::Event(event),
            _ = self.heartbeat.tick() => Activity::Heartbeat,
            _ = sleep_until(self.presence_due) => Activity::PresenceDue,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connect_task.abort();
    }
}

async fn next_activity(session: &mut Option<Session>) -> Activity {
    match session {
        Some(session) => session.next_activity().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Actor {
    store: ShapeStore,
    config: CoordinatorConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<Snapshot>,
    status_tx: watch::Sender<ConnectionStatus>,
    writer: PersistenceWriter,
    session: Option<Session>,
    /// Accumulated local presence, replayed into every new session
    presence_seed: PresenceUpdate,
    dirty_since: Option<Instant>,
    flush_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self) {
        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                activity = next_activity(&mut self.session) => self.handle_activity(activity),
                _ = sleep_until(self.flush_at) => self.flush(None),
            }
        }

        self.commands.close();
        self.disconnect().await;
        self.flush(None);
        let _ = self.writer.close().await;
        log::info!("Coordinator for {} stopped", self.config.doc_id);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Write { shape_id, updates } => self.write(shape_id, updates),
            Command::Tool(result) => self.apply_tool(result),
            Command::Delete(shape_id) => self.local_edit(|store| store.delete_shape(shape_id)),
            Command::Restore(shape_id) => self.local_edit(|store| store.restore_shape(shape_id)),
            Command::Connect(transport) => self.connect(transport).await,
            Command::Disconnect => self.disconnect().await,
            Command::Presence(update) => self.update_presence(update),
            Command::RemotePresence(reply) => {
                let peers = self
                    .session
                    .as_ref()
                    .map(|session| session.tracker.remote_snapshot())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::Flush(ack) => self.flush(ack),
            Command::Sync(reply) => {
                let _ = reply.send(());
            }
            // Intercepted by `run`.
            Command::Shutdown(_) => {}
        }
    }

    // ─── Local edits ──────────────────────────────────────────────────

    fn apply_tool(&mut self, result: ToolResult) {
        match result {
            ToolResult::Create(shape) | ToolResult::Update(shape) => {
                self.write(shape.id, owned_fields(&shape))
            }
            ToolResult::Delete(shape_id) => self.local_edit(|store| store.delete_shape(shape_id)),
        }
    }

    fn write(&mut self, shape_id: ShapeId, updates: Vec<(FieldKey, FieldValue)>) {
        if updates.is_empty() {
            return;
        }
        self.local_edit(|store| store.apply_local_write(shape_id, updates));
    }

    fn local_edit(&mut self, edit: impl FnOnce(&mut ShapeStore) -> Vec<u8>) {
        let delta = edit(&mut self.store);
        self.publish_snapshot();
        self.mark_dirty();
        // Offline edits, and the rare unencodable one, reach peers through
        // the next handshake.
        if self.session.is_some() && !delta.is_empty() {
            self.send_document(SyncMessage::update(self.store.replica().clone(), delta));
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    async fn connect(&mut self, transport: Arc<dyn Transport>) {
        if self.session.is_some() {
            self.disconnect().await;
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let room_id = self.config.room_id.clone();
        let connecting = transport.clone();
        let connect_task = tokio::spawn(async move {
            if let Err(e) = connecting.connect(&room_id, events_tx.clone()).await {
                log::warn!("Connect to room {room_id} failed: {e}");
                let _ = events_tx.send(TransportEvent::Status(ConnectionStatus::Error));
            }
        });

        let mut tracker = PresenceTracker::new(
            self.config.session_id,
            self.config.user_id.clone(),
            self.config.display_name.clone(),
            self.config.presence.clone(),
        );
        if !self.presence_seed.is_empty() {
            let _ = tracker.update_local(self.presence_seed.clone());
        }

        let period = self.config.presence.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Connecting {} to room {}", self.config.replica, self.config.room_id);
        self.set_status(ConnectionStatus::Connecting);
        self.session = Some(Session {
            transport,
            events,
            events_closed: false,
            connect_task,
            tracker,
            heartbeat,
            presence_due: None,
        });
    }

    async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if self.status().is_connected() {
            match session.tracker.leave_message().encode() {
                Ok(bytes) => session.transport.send_ephemeral(bytes),
                Err(e) => log::warn!("Presence leave could not be encoded: {e}"),
            }
        }
        session.connect_task.abort();

        let timeout = self.config.disconnect_timeout;
        match tokio::time::timeout(timeout, session.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Transport disconnect failed: {e}"),
            Err(_) => log::warn!("Transport disconnect timed out after {timeout:?}"),
        }

        log::info!("Disconnected {} from room {}", self.config.replica, self.config.room_id);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn handle_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Event(Some(event)) => self.handle_event(event),
            Activity::Event(None) => {
                log::debug!("Transport event stream closed");
                if let Some(session) = &mut self.session {
                    session.events_closed = true;
                }
            }
            Activity::Heartbeat => self.heartbeat(),
            Activity::PresenceDue => {
                let Some(session) = &mut self.session else {
                    return;
                };
                session.presence_due = None;
                if session.tracker.has_pending() {
                    let msg = session.tracker.heartbeat();
                    self.send_presence(&msg);
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(ConnectionStatus::Connected) => self.handshake(),
            TransportEvent::Status(status) => self.set_status(status),
            TransportEvent::Update(bytes) => self.handle_document(&bytes),
            TransportEvent::Ephemeral(bytes) => self.handle_presence(&bytes),
            TransportEvent::Resync => {
                log::warn!("Inbound frames lost, requesting full state");
                self.send_hello(&StateVector::new());
            }
        }
    }

    /// Runs on every transition to `Connected`, reconnects included.
    fn handshake(&mut self) {
        self.set_status(ConnectionStatus::Syncing);

        let state_vector = self.store.state_vector().clone();
        self.send_hello(&state_vector);
        match self.store.encode_full() {
            Ok(full) => self.send_document(SyncMessage::update(self.store.replica().clone(), full)),
            Err(e) => log::warn!("Full state could not be encoded: {e}"),
        }
        if let Some(session) = &mut self.session {
            let msg = session.tracker.heartbeat();
            self.send_presence(&msg);
        }

        log::info!("{} synced with room {}", self.config.replica, self.config.room_id);
        self.set_status(ConnectionStatus::Connected);
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    fn handle_document(&mut self, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Discarding malformed document frame: {e}");
                return;
            }
        };
        if &msg.sender == self.store.replica() {
            return;
        }

        match msg.msg_type {
            MessageType::Hello => match msg.state_vector() {
                Ok(remote) => match self.store.delta_since(&remote) {
                    Ok(delta) => {
                        log::debug!("Answering hello from {}", msg.sender);
                        self.send_document(SyncMessage::diff(self.store.replica().clone(), delta));
                    }
                    Err(e) => log::warn!("Diff for {} could not be encoded: {e}", msg.sender),
                },
                Err(e) => log::warn!("Discarding hello from {}: {e}", msg.sender),
            },
            MessageType::Update | MessageType::Diff => {
                match self.store.merge_remote_delta(&msg.payload) {
                    Ok(report) => {
                        log::debug!(
                            "Merged {:?} from {}: {} applied, {} ignored",
                            msg.msg_type,
                            msg.sender,
                            report.applied,
                            report.ignored
                        );
                        if !report.is_noop() {
                            self.publish_snapshot();
                            self.mark_dirty();
                        }
                    }
                    Err(e) => log::warn!("Discarding malformed delta from {}: {e}", msg.sender),
                }
            }
        }
    }

    fn handle_presence(&mut self, bytes: &[u8]) {
        let Some(session) = &mut self.session else {
            return;
        };
        match PresenceMessage::decode(bytes) {
            Ok(msg) => {
                session.tracker.handle_message(&msg);
            }
            Err(e) => log::warn!("Discarding malformed presence frame: {e}"),
        }
    }

    // ─── Presence ─────────────────────────────────────────────────────

    fn update_presence(&mut self, update: PresenceUpdate) {
        self.presence_seed.merge(update.clone());
        let Some(session) = &mut self.session else {
            return;
        };
        match session.tracker.update_local(update) {
            Some(msg) => self.send_presence(&msg),
            None => {
                if session.presence_due.is_none() {
                    let interval = session.tracker.config().min_publish_interval;
                    session.presence_due = Some(Instant::now() + interval);
                }
            }
        }
    }

    fn heartbeat(&mut self) {
        let connected = self.status().is_connected();
        let Some(session) = &mut self.session else {
            return;
        };
        session.tracker.prune_expired();
        if connected {
            let msg = session.tracker.heartbeat();
            self.send_presence(&msg);
        }
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    fn send_hello(&self, state_vector: &StateVector) {
        match SyncMessage::hello(self.store.replica().clone(), state_vector) {
            Ok(msg) => self.send_document(msg),
            Err(e) => log::warn!("Hello could not be encoded: {e}"),
        }
    }

    fn send_document(&self, msg: SyncMessage) {
        let Some(session) = &self.session else {
            return;
        };
        match msg.encode() {
            Ok(bytes) => session.transport.send_update(bytes),
            Err(e) => log::warn!("Document message could not be encoded: {e}"),
        }
    }

    /// Presence goes out only while connected; stale cursors are worthless.
    fn send_presence(&self, msg: &PresenceMessage) {
        if !self.status().is_connected() {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        match msg.encode() {
            Ok(bytes) => {
                log::trace!("Presence publish for {}", msg.session_id());
                session.transport.send_ephemeral(bytes);
            }
            Err(e) => log::warn!("Presence could not be encoded: {e}"),
        }
    }

    // ─── State publication ────────────────────────────────────────────

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::debug!("Coordinator status {current:?} -> {status:?}");
            *current = status;
            true
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.store.snapshot());
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Debounced, but never later than `max_delay` after the first unsaved change.
    fn mark_dirty(&mut self) {
        let now = Instant::now();
        let first = *self.dirty_since.get_or_insert(now);
        let debounced = now + self.config.flush.debounce;
        self.flush_at = Some(debounced.min(first + self.config.flush.max_delay));
    }

    /// Write the current state. Without an ack only dirty state is written.
    fn flush(&mut self, ack: Option<FlushAck>) {
        let dirty = self.dirty_since.is_some();
        self.dirty_since = None;
        self.flush_at = None;
        if !dirty && ack.is_none() {
            return;
        }

        match self.store.encode_full() {
            Ok(snapshot) => {
                log::debug!("Flushing {} ({} bytes)", self.config.doc_id, snapshot.len());
                self.writer.submit(snapshot, ack);
            }
            Err(e) => {
                log::warn!("Snapshot could not be encoded: {e}");
                if let Some(ack) = ack {
                    let _ = ack.send(Err(StorageError::Serialization(e.to_string())));
                }
            }
        }
    }
}

fn owned_fields(shape: &Shape) -> Vec<(FieldKey, FieldValue)> {
    shape
        .fields()
        .map(|(key, value)| (key, value.clone()))
        .collect()
}
