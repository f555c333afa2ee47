//! Room session: the composition root that joins a room and runs it.
//!
//! Architecture:
//! ```text
//!  RoomManager (handle) ── Command (mpsc + oneshot) ──┐
//!                                                     ▼
//!  PresenceService ── ParticipantEvent / leader ──▶ event loop task ──▶ RoomEvent (mpsc) ─▶ UI
//!  Transport ───────── incoming channels ─────────▶   │
//!  ConnectionManager ─ ConnectionEvent ───────────▶   │
//!  Scheduler ───────── TimerFired ────────────────▶   │
//!                                                     ▼
//!                                     MessageRouter<SessionCore>
//!                                     ├── StateService
//!                                     ├── FileService
//!                                     └── LeadershipService
//! ```
//!
//! All session state lives in the event loop task and is only touched
//! from there, so services are plain structs without locks. Dropping the
//! [`RoomManager`] aborts the task like a crashed client: channels close,
//! and presence cleanup is left to the presence service.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStats, ConnectionUpdate};
use crate::files::{FileError, FileService, FileUpload, ReceivedFile};
use crate::leadership::{LeadershipService, LeadershipState, LeadershipTransition};
use crate::presence::{ParticipantEvent, PresenceEntry, PresenceError, PresenceService};
use crate::protocol::{
    FileId, FileMetadata, LeaderRecord, Message, MessageKind, ParticipantId, PeerAddress,
    ProtocolError, RoomId,
};
use crate::router::{HandlerError, MessageRouter};
use crate::scheduler::{Scheduler, TimerFired};
use crate::state::{StateService, TextBuffer};
use crate::transport::{Channel, Transport, TransportError};

// ───────────────────────────────────────────────────────────────────
// Public types
// ───────────────────────────────────────────────────────────────────

/// Notification for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Connected {
        participant_id: ParticipantId,
        address: PeerAddress,
    },
    Disconnected,
    UserJoined(ParticipantId),
    UserLeft(ParticipantId),
    /// Text replaced by a peer or a room snapshot.
    TextUpdated(String),
    /// The shared text is settled and may be edited.
    TextReady,
    FileAdded(FileMetadata),
    FileRemoved(FileId),
    FileReceived(ReceivedFile),
    LeaderChanged(Option<LeaderRecord>),
    /// Transient, non-fatal problem.
    Error(String),
}

/// Snapshot of a session for introspection.
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub address: PeerAddress,
    pub leadership: LeadershipState,
    pub leader: Option<LeaderRecord>,
    pub open_peers: Vec<PeerAddress>,
    pub files: Vec<FileMetadata>,
    pub pending_downloads: Vec<FileId>,
    pub text_loading: bool,
    pub connections: ConnectionStats,
}

/// Room errors.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("presence error: {0}")]
    Presence(#[from] PresenceError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("file error: {0}")]
    File(#[from] FileError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("room session is closed")]
    Closed,
    #[error("no open channel to participant {0}")]
    ParticipantUnavailable(ParticipantId),
}

enum Command {
    SendText {
        text: String,
        reply: oneshot::Sender<()>,
    },
    AddFiles {
        uploads: Vec<FileUpload>,
        reply: oneshot::Sender<Vec<Result<FileId, FileError>>>,
    },
    RemoveFile {
        id: FileId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    RequestFile {
        id: FileId,
        owner: ParticipantId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    Elect {
        reply: oneshot::Sender<Result<LeadershipState, RoomError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Timer {
    Settle,
    TextLoading,
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Handle to a joined room.
pub struct RoomManager {
    room_id: RoomId,
    participant_id: ParticipantId,
    address: PeerAddress,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl RoomManager {
    /// Join `room_id` and start its event loop.
    ///
    /// On failure nothing is left registered or listening.
    pub async fn join(
        room_id: RoomId,
        config: RoomConfig,
        presence: Arc<dyn PresenceService>,
        transport: Arc<dyn Transport>,
        text: Arc<dyn TextBuffer>,
    ) -> Result<(RoomManager, mpsc::UnboundedReceiver<RoomEvent>), RoomError> {
        let participant_id = config
            .participant_id
            .clone()
            .unwrap_or_else(ParticipantId::generate);
        let address = PeerAddress::new(&room_id, &participant_id);
        let entry = PresenceEntry {
            participant_id: participant_id.clone(),
            address: address.clone(),
            joined_at: chrono::Utc::now().timestamp_millis(),
        };

        let incoming = transport.listen(&address).await?;
        let (participants_rx, leader_rx) =
            match subscribe(presence.as_ref(), &room_id, entry.clone()).await {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    transport.unlisten(&address).await;
                    return Err(e.into());
                }
            };

        let mut leadership = LeadershipService::new(room_id.clone(), entry);
        let initial = match leadership.initialize(presence.as_ref()).await {
            Ok(transition) => transition,
            Err(e) => {
                if let Err(cleanup) = presence
                    .unregister_participant(&room_id, &participant_id)
                    .await
                {
                    log::warn!("Failed to unregister from room {room_id} after a failed join: {cleanup}");
                }
                transport.unlisten(&address).await;
                return Err(e.into());
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connections, connection_events) = ConnectionManager::new(
            address.clone(),
            participant_id.clone(),
            Arc::clone(&transport),
            config.channel_capacity,
        );
        let (scheduler, timers) = Scheduler::new();

        let mut session = Session {
            core: SessionCore {
                room_id: room_id.clone(),
                participant_id: participant_id.clone(),
                address: address.clone(),
                files: FileService::new(participant_id.clone(), config.max_file_size),
                state: StateService::new(participant_id.clone(), text),
                config,
                presence,
                transport,
                connections,
                leadership,
                scheduler,
                events: events_tx,
                known_peers: HashSet::new(),
                origin: None,
                deferred: Vec::new(),
            },
            router: MessageRouter::new(),
        };
        session.register_handlers();

        session.core.state.begin_loading();
        let timeout = session.core.config.text_loading_timeout();
        session.core.scheduler.schedule(Timer::TextLoading, timeout);

        session.apply(initial).await;
        session.connect_to_participants().await;

        let mut leader_rx = leader_rx;
        let latest = leader_rx.borrow_and_update().clone();
        session.on_leader_record(latest).await;

        log::info!("Joined room {room_id} as {participant_id}");
        session.core.emit(RoomEvent::Connected {
            participant_id: participant_id.clone(),
            address: address.clone(),
        });

        let (commands, commands_rx) = mpsc::channel(session.core.config.channel_capacity.max(1));
        let event_loop = EventLoop {
            session,
            commands: commands_rx,
            incoming,
            connection_events,
            timers,
            participants: participants_rx,
            leader: leader_rx,
        };
        let task = tokio::spawn(event_loop.run());

        Ok((
            RoomManager {
                room_id,
                participant_id,
                address,
                commands,
                task,
            },
            events_rx,
        ))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Share new text. The leader broadcasts it; followers send it to the
    /// leader, or to everyone when the leader link is down.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), RoomError> {
        let text = text.into();
        self.call(|reply| Command::SendText { text, reply }).await
    }

    /// Share files. Each upload succeeds or fails on its own.
    pub async fn add_files(
        &self,
        uploads: Vec<FileUpload>,
    ) -> Result<Vec<Result<FileId, FileError>>, RoomError> {
        self.call(|reply| Command::AddFiles { uploads, reply }).await
    }

    pub async fn remove_file(&self, id: FileId) -> Result<(), RoomError> {
        self.call(|reply| Command::RemoveFile { id, reply }).await?
    }

    /// Ask `owner` for a file's content; it arrives as [`RoomEvent::FileReceived`].
    pub async fn request_file(&self, id: FileId, owner: ParticipantId) -> Result<(), RoomError> {
        self.call(|reply| Command::RequestFile { id, owner, reply })
            .await?
    }

    pub async fn status(&self) -> Result<RoomStatus, RoomError> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Adopt the stored leader record or run the election again. Use it to
    /// retry after a failed election was reported as [`RoomEvent::Error`].
    pub async fn elect(&self) -> Result<LeadershipState, RoomError> {
        self.call(|reply| Command::Elect { reply }).await?
    }

    /// Leave the room: step down if leading, unregister, close channels
    /// and release file blobs. Every step runs even if an earlier one fails.
    pub async fn disconnect(&self) -> Result<(), RoomError> {
        self.call(|reply| Command::Disconnect { reply }).await?
    }

    /// Whether `room` currently has participants.
    pub async fn room_exists(
        presence: &dyn PresenceService,
        room: &RoomId,
    ) -> Result<bool, RoomError> {
        Ok(presence.room_exists(room).await?)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn subscribe(
    presence: &dyn PresenceService,
    room: &RoomId,
    entry: PresenceEntry,
) -> Result<
    (
        broadcast::Receiver<ParticipantEvent>,
        watch::Receiver<Option<LeaderRecord>>,
    ),
    PresenceError,
> {
    let participants = presence.watch_participants(room).await?;
    let leader = presence.watch_leader(room).await?;
    presence.register_participant(room, entry).await?;
    Ok((participants, leader))
}

// ───────────────────────────────────────────────────────────────────
// Session state
// ───────────────────────────────────────────────────────────────────

/// Everything message handlers may touch.
struct SessionCore {
    room_id: RoomId,
    participant_id: ParticipantId,
    address: PeerAddress,
    config: RoomConfig,
    presence: Arc<dyn PresenceService>,
    transport: Arc<dyn Transport>,
    connections: ConnectionManager,
    leadership: LeadershipService,
    files: FileService,
    state: StateService,
    scheduler: Scheduler<Timer>,
    events: mpsc::UnboundedSender<RoomEvent>,
    known_peers: HashSet<ParticipantId>,
    /// Channel the message being dispatched arrived on.
    origin: Option<PeerAddress>,
    /// Leader announcements to apply once dispatch returns.
    deferred: Vec<LeaderRecord>,
}

impl SessionCore {
    fn emit(&self, event: RoomEvent) {
        // The host may have stopped listening.
        let _ = self.events.send(event);
    }

    fn finish_loading(&mut self) {
        if self.state.finish_loading() {
            self.scheduler.cancel(Timer::TextLoading);
            self.emit(RoomEvent::TextReady);
        }
    }

    /// Reply on the channel the current message came from, or find the
    /// sender's channel.
    fn reply(&mut self, to: &ParticipantId, message: &Message) -> bool {
        if let Some(origin) = self.origin.clone() {
            if self.connections.send_to(&origin, message) {
                return true;
            }
        }
        self.connections.send_to_participant(to, message)
    }

    /// Leader fan-out of a peer's update to everyone but its origin.
    fn relay_if_leader(&mut self, message: &Message) {
        if !self.leadership.is_leader() {
            return;
        }
        let relayed = match self.origin.clone() {
            Some(origin) => self.connections.broadcast_except(message, &origin),
            None => self.connections.broadcast(message),
        };
        log::debug!("Relayed {} from {} to {relayed} peers", message.kind(), message.sender());
    }

    fn request_state_from(&mut self, leader: &PeerAddress) {
        let request = self.state.state_request();
        if self.connections.send_to(leader, &request) {
            log::debug!("Requested room state from {leader}");
        }
    }

    fn on_channel_opened(&mut self, address: &PeerAddress) {
        let from_leader = self.connections.leader() == Some(address);
        if from_leader && !self.leadership.is_leader() && self.state.is_loading() {
            self.request_state_from(address);
        }
    }

    fn on_channel_lost(&mut self, address: &PeerAddress) {
        if let Some(participant) = address.participant() {
            self.known_peers.remove(&participant);
            self.emit(RoomEvent::UserLeft(participant));
        }
    }

    fn status(&self) -> RoomStatus {
        RoomStatus {
            room_id: self.room_id.clone(),
            participant_id: self.participant_id.clone(),
            address: self.address.clone(),
            leadership: self.leadership.state(),
            leader: self.leadership.current_leader().cloned(),
            open_peers: self.connections.open_peers(),
            files: self.files.all_metadata(),
            pending_downloads: self.files.pending(),
            text_loading: self.state.is_loading(),
            connections: self.connections.stats(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Message handlers
// ───────────────────────────────────────────────────────────────────

fn unexpected(message: &Message) -> HandlerError {
    format!("unexpected payload for {}", message.kind()).into()
}

fn on_text_update(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::TextUpdate { sender, data } = message else {
        return Err(unexpected(message));
    };
    if core.state.handle_text_update(sender, data) {
        core.emit(RoomEvent::TextUpdated(data.clone()));
        core.relay_if_leader(message);
    }
    Ok(())
}

fn on_file_metadata(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::FileMetadata { sender, data } = message else {
        return Err(unexpected(message));
    };
    if sender == &core.participant_id {
        return Ok(());
    }
    if core.files.register_shared(data.clone()) {
        core.emit(RoomEvent::FileAdded(data.clone()));
        core.relay_if_leader(message);
    }
    Ok(())
}

fn on_file_request(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::FileRequest { sender, data } = message else {
        return Err(unexpected(message));
    };
    let Some(payload) = core.files.handle_file_request(&data.id) else {
        log::warn!("{sender} requested file {} which is not held here", data.id);
        return Ok(());
    };
    let response = Message::file_response(core.participant_id.clone(), payload);
    if !core.reply(sender, &response) {
        return Err(format!("no channel back to {sender} for file {}", data.id).into());
    }
    log::info!("Sent file {} to {sender}", data.id);
    Ok(())
}

fn on_file_response(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::FileResponse { data, .. } = message else {
        return Err(unexpected(message));
    };
    let received = core.files.handle_file_response(data.clone());
    core.emit(RoomEvent::FileReceived(received));
    Ok(())
}

fn on_user_joined(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::UserJoined { data, .. } = message else {
        return Err(unexpected(message));
    };
    if data.user_id != core.participant_id && core.known_peers.insert(data.user_id.clone()) {
        core.emit(RoomEvent::UserJoined(data.user_id.clone()));
    }
    Ok(())
}

fn on_state_request(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let sender = message.sender().clone();
    let replies = core
        .state
        .on_state_request(&sender, core.files.all_metadata());
    for reply in &replies {
        if !core.reply(&sender, reply) {
            return Err(format!("no channel back to {sender} for room state").into());
        }
    }
    Ok(())
}

fn on_state_response(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::RoomStateResponse { sender, data } = message else {
        return Err(unexpected(message));
    };
    if core.state.on_state_response(sender, data) {
        log::info!("Applied room state from {sender}");
        core.emit(RoomEvent::TextUpdated(data.text.clone()));
        core.finish_loading();
    }
    Ok(())
}

fn on_leader_announcement(core: &mut SessionCore, message: &Message) -> Result<(), HandlerError> {
    let Message::LeaderAnnouncement { data, .. } = message else {
        return Err(unexpected(message));
    };
    if data.participant_id != core.participant_id {
        core.deferred.push(data.clone());
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

struct Session {
    core: SessionCore,
    router: MessageRouter<SessionCore>,
}

impl Session {
    fn register_handlers(&mut self) {
        let router = &mut self.router;
        router.register_handler(MessageKind::TextUpdate, on_text_update);
        router.register_handler(MessageKind::FileMetadata, on_file_metadata);
        router.register_handler(MessageKind::FileRequest, on_file_request);
        router.register_handler(MessageKind::FileResponse, on_file_response);
        router.register_handler(MessageKind::UserJoined, on_user_joined);
        router.register_handler(MessageKind::RoomStateRequest, on_state_request);
        router.register_handler(MessageKind::RoomStateResponse, on_state_response);
        router.register_handler(MessageKind::LeaderAnnouncement, on_leader_announcement);
    }

    async fn dispatch(&mut self, from: PeerAddress, message: Message) {
        self.core.origin = Some(from);
        let report = self.router.dispatch(&mut self.core, &message);
        self.core.origin = None;
        if report.failed > 0 {
            self.core.emit(RoomEvent::Error(format!(
                "{} of {} handlers failed for {}",
                report.failed,
                report.invoked,
                message.kind()
            )));
        }

        for record in std::mem::take(&mut self.core.deferred) {
            self.on_announcement(record).await;
        }
    }

    async fn on_announcement(&mut self, record: LeaderRecord) {
        let presence = Arc::clone(&self.core.presence);
        let transition = self
            .core
            .leadership
            .on_announcement(record, presence.as_ref())
            .await;
        self.apply(transition).await;
    }

    async fn elect(&mut self) -> Result<LeadershipState, RoomError> {
        let presence = Arc::clone(&self.core.presence);
        let transition = self.core.leadership.reconcile(presence.as_ref()).await?;
        self.apply(transition).await;
        Ok(self.core.leadership.state())
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match self.core.connections.handle_event(event) {
            ConnectionUpdate::Opened(address) => self.core.on_channel_opened(&address),
            ConnectionUpdate::Message { from, message } => self.dispatch(from, message).await,
            ConnectionUpdate::Closed(address) => self.core.on_channel_lost(&address),
            ConnectionUpdate::Failed { address, error } => {
                self.core.emit(RoomEvent::Error(format!(
                    "connection with {address} failed: {error}"
                )));
                self.core.on_channel_lost(&address);
            }
            ConnectionUpdate::Ignored => {}
        }
    }

    async fn on_leader_record(&mut self, record: Option<LeaderRecord>) {
        let transition = self.core.leadership.on_leader_record(record);
        self.apply(transition).await;
    }

    async fn apply(&mut self, transition: LeadershipTransition) {
        let core = &mut self.core;
        match transition {
            LeadershipTransition::BecameLeader(record) => {
                core.scheduler.cancel(Timer::Settle);
                core.connections.set_leader(None);
                if let Some(announcement) = core.leadership.announcement() {
                    core.connections.broadcast(&announcement);
                }
                core.emit(RoomEvent::LeaderChanged(Some(record)));
                core.finish_loading();
            }
            LeadershipTransition::Following(Some(record)) => {
                core.scheduler.cancel(Timer::Settle);
                let address = record.address.clone();
                core.connections.set_leader(Some(address.clone()));
                core.emit(RoomEvent::LeaderChanged(Some(record)));
                match core.connections.connect(&address).await {
                    Err(e) => core.emit(RoomEvent::Error(format!(
                        "cannot reach leader {address}: {e}"
                    ))),
                    Ok(_) => {
                        if core.connections.is_open(&address) && core.state.is_loading() {
                            core.request_state_from(&address);
                        }
                    }
                }
            }
            LeadershipTransition::Following(None) => {
                log::debug!("Room {}: waiting for the elected leader", core.room_id);
                let delay = core.config.settle_delay();
                core.scheduler.schedule(Timer::Settle, delay);
            }
            LeadershipTransition::LeaderLost => {
                core.connections.set_leader(None);
                core.emit(RoomEvent::LeaderChanged(None));
                let delay = core.config.settle_delay();
                core.scheduler.schedule(Timer::Settle, delay);
            }
            LeadershipTransition::SteppedDown => {
                core.connections.set_leader(None);
                core.emit(RoomEvent::LeaderChanged(None));
            }
            LeadershipTransition::Unchanged => {}
        }
    }

    async fn on_timer(&mut self, fired: TimerFired<Timer>) {
        if !self.core.scheduler.accept(&fired) {
            return;
        }
        match fired.key {
            Timer::Settle => {
                if let Err(e) = self.elect().await {
                    self.core
                        .emit(RoomEvent::Error(format!("leader election failed: {e}")));
                }
            }
            Timer::TextLoading => {
                if self.core.state.finish_loading() {
                    log::info!(
                        "Room {}: no room state received, using local text",
                        self.core.room_id
                    );
                    self.core.emit(RoomEvent::TextReady);
                }
            }
        }
    }

    async fn on_participant_event(&mut self, event: ParticipantEvent) {
        match event {
            ParticipantEvent::Added(entry) if entry.address != self.core.address => {
                log::debug!("Participant {} joined room {}", entry.participant_id, self.core.room_id);
                if let Err(e) = self.core.connections.connect(&entry.address).await {
                    self.core.emit(RoomEvent::Error(format!(
                        "cannot reach {}: {e}",
                        entry.participant_id
                    )));
                }
            }
            ParticipantEvent::Added(_) => {}
            ParticipantEvent::Removed(participant) => {
                log::debug!("Participant {participant} left room {}", self.core.room_id);
            }
        }
    }

    /// Open channels to everyone registered, the leader first.
    async fn connect_to_participants(&mut self) {
        let presence = Arc::clone(&self.core.presence);
        let entries = match presence.participants(&self.core.room_id).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot list participants of {}: {e}", self.core.room_id);
                self.core.emit(RoomEvent::Error(format!("cannot list participants: {e}")));
                return;
            }
        };
        let addresses = entries
            .into_iter()
            .map(|entry| entry.address)
            .filter(|address| address != &self.core.address)
            .collect();
        for (address, e) in self.core.connections.connect_prioritized(addresses).await {
            self.core
                .emit(RoomEvent::Error(format!("cannot reach {address}: {e}")));
        }
    }

    async fn on_command(&mut self, command: Command) {
        let core = &mut self.core;
        match command {
            Command::SendText { text, reply } => {
                if let Some(message) = core.state.local_update(text) {
                    if core.leadership.is_leader() {
                        core.connections.broadcast(&message);
                    } else {
                        core.connections.send_prioritized(&message);
                    }
                }
                let _ = reply.send(());
            }
            Command::AddFiles { uploads, reply } => {
                let mut results = Vec::with_capacity(uploads.len());
                for upload in uploads {
                    match core.files.add_file(upload) {
                        Ok(metadata) => {
                            let id = metadata.id.clone();
                            let announcement =
                                Message::file_metadata(core.participant_id.clone(), metadata.clone());
                            if core.leadership.is_leader() {
                                core.connections.broadcast(&announcement);
                            } else {
                                core.connections.send_prioritized(&announcement);
                            }
                            core.emit(RoomEvent::FileAdded(metadata));
                            results.push(Ok(id));
                        }
                        Err(e) => {
                            log::warn!("Rejected upload: {e}");
                            results.push(Err(e));
                        }
                    }
                }
                let _ = reply.send(results);
            }
            Command::RemoveFile { id, reply } => {
                let result = core
                    .files
                    .remove_file(&id)
                    .map(|_| core.emit(RoomEvent::FileRemoved(id)))
                    .map_err(RoomError::from);
                let _ = reply.send(result);
            }
            Command::RequestFile { id, owner, reply } => {
                let result = if core.files.is_local(&id) {
                    // Our own file: hand it over directly.
                    match core.files.handle_file_request(&id) {
                        Some(payload) => {
                            let received = core.files.handle_file_response(payload);
                            core.emit(RoomEvent::FileReceived(received));
                            Ok(())
                        }
                        None => Err(RoomError::File(FileError::NotFound(id))),
                    }
                } else {
                    let request = Message::file_request(core.participant_id.clone(), id.clone());
                    if core.connections.send_to_participant(&owner, &request) {
                        core.files.mark_pending(id);
                        Ok(())
                    } else {
                        Err(RoomError::ParticipantUnavailable(owner))
                    }
                };
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(core.status());
            }
            Command::Elect { reply } => {
                let result = self.elect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                // Handled by the event loop.
                let _ = reply.send(Err(RoomError::Closed));
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), RoomError> {
        let core = &mut self.core;
        let mut first_error: Option<RoomError> = None;

        if core.leadership.is_leader() {
            let presence = Arc::clone(&core.presence);
            if let Err(e) = core.leadership.step_down(presence.as_ref()).await {
                log::warn!("Failed to step down in room {}: {e}", core.room_id);
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = core
            .presence
            .unregister_participant(&core.room_id, &core.participant_id)
            .await
        {
            log::warn!("Failed to unregister from room {}: {e}", core.room_id);
            first_error.get_or_insert(e.into());
        }

        core.connections.disconnect_all();
        core.files.clear();
        core.scheduler.cancel_all();
        self.router.clear();
        core.transport.unlisten(&core.address).await;

        log::info!("Left room {} as {}", core.room_id, core.participant_id);
        core.emit(RoomEvent::Disconnected);
        first_error.map_or(Ok(()), Err)
    }
}

// ───────────────────────────────────────────────────────────────────
// Event loop
// ───────────────────────────────────────────────────────────────────

struct EventLoop {
    session: Session,
    commands: mpsc::Receiver<Command>,
    incoming: mpsc::Receiver<Channel>,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired<Timer>>,
    participants: broadcast::Receiver<ParticipantEvent>,
    leader: watch::Receiver<Option<LeaderRecord>>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut accepting = true;
        let mut watching_participants = true;
        let mut watching_leader = true;

        loop {
            // Incoming channels go first so a replacement channel is always
            // accepted before the close of the channel it supersedes.
            tokio::select! {
                biased;

                channel = self.incoming.recv(), if accepting => match channel {
                    Some(channel) => {
                        self.session.core.connections.accept(channel);
                    }
                    None => accepting = false,
                },

                Some(event) = self.connection_events.recv() => {
                    self.session.on_connection_event(event).await;
                }

                event = self.participants.recv(), if watching_participants => match event {
                    Ok(event) => self.session.on_participant_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Presence events lagged by {skipped}, resyncing");
                        self.session.connect_to_participants().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => watching_participants = false,
                },

                changed = self.leader.changed(), if watching_leader => match changed {
                    Ok(()) => {
                        let record = self.leader.borrow_and_update().clone();
                        self.session.on_leader_record(record).await;
                    }
                    Err(_) => watching_leader = false,
                },

                Some(fired) = self.timers.recv() => {
                    self.session.on_timer(fired).await;
                }

                command = self.commands.recv() => match command {
                    Some(Command::Disconnect { reply }) => {
                        let result = self.session.teardown().await;
                        let _ = reply.send(result);
                        break;
                    }
                    Some(command) => self.session.on_command(command).await,
                    None => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use crate::state::SharedText;
    use crate::transport::MemoryTransport;

    async fn join_alone(id: &str) -> (RoomManager, mpsc::UnboundedReceiver<RoomEvent>, Arc<MemoryPresence>) {
        let presence = Arc::new(MemoryPresence::new());
        let transport = Arc::new(MemoryTransport::default());
        let config = RoomConfig::default().with_participant_id(ParticipantId::new(id));
        let (room, events) = RoomManager::join(
            RoomId::new("abc12"),
            config,
            presence.clone(),
            transport,
            Arc::new(SharedText::default()),
        )
        .await
        .unwrap();
        (room, events, presence)
    }

    #[tokio::test]
    async fn test_single_participant_leads() {
        let (room, mut events, presence) = join_alone("calmowl100").await;

        let mut saw_ready = false;
        let mut saw_connected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                RoomEvent::TextReady => saw_ready = true,
                RoomEvent::Connected { .. } => saw_connected = true,
                _ => {}
            }
        }
        assert!(saw_ready && saw_connected);

        let status = room.status().await.unwrap();
        assert_eq!(status.leadership, LeadershipState::Leader);
        assert_eq!(status.address.as_str(), "abc12-calmowl100");
        assert!(!status.text_loading);
        assert!(RoomManager::room_exists(presence.as_ref(), room.room_id())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_request_from_absent_owner() {
        let (room, _events, _) = join_alone("a").await;
        let err = room
            .request_file(FileId::new("f"), ParticipantId::new("ghost"))
            .await
            .unwrap_err();

        assert!(matches!(err, RoomError::ParticipantUnavailable(_)));
        assert!(room.status().await.unwrap().pending_downloads.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove_files() {
        let (room, _events, _) = join_alone("a").await;
        let results = room
            .add_files(vec![
                FileUpload::new("ok.txt", "text/plain", vec![1, 2]),
                FileUpload::new("empty.txt", "text/plain", vec![]),
            ])
            .await
            .unwrap();
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(room.status().await.unwrap().files.len(), 2);

        let id = results[0].clone().unwrap();
        room.remove_file(id.clone()).await.unwrap();
        assert!(matches!(
            room.remove_file(id).await,
            Err(RoomError::File(FileError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_presence() {
        let (room, mut events, presence) = join_alone("a").await;
        room.disconnect().await.unwrap();

        let room_id = RoomId::new("abc12");
        assert!(presence.participants(&room_id).await.unwrap().is_empty());
        assert!(presence.leader(&room_id).await.unwrap().is_none());
        assert!(matches!(room.status().await, Err(RoomError::Closed)));

        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            disconnected |= event == RoomEvent::Disconnected;
        }
        assert!(disconnected);
    }

    #[tokio::test]
    async fn test_join_fails_when_presence_is_down() {
        let presence = Arc::new(MemoryPresence::new());
        presence.set_available(false);
        let transport = Arc::new(MemoryTransport::default());

        let result = RoomManager::join(
            RoomId::new("r"),
            RoomConfig::default().with_participant_id(ParticipantId::new("a")),
            presence,
            transport.clone(),
            Arc::new(SharedText::default()),
        )
        .await;

        assert!(matches!(result, Err(RoomError::Presence(PresenceError::Unavailable))));
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_follower_takes_over_from_silent_winner() {
        let presence = Arc::new(MemoryPresence::new());
        let room_id = RoomId::new("abc12");
        let ghost = ParticipantId::new("ghost");
        presence
            .register_participant(
                &room_id,
                PresenceEntry {
                    address: PeerAddress::new(&room_id, &ghost),
                    participant_id: ghost,
                    joined_at: 1,
                },
            )
            .await
            .unwrap();

        let config = RoomConfig {
            settle_delay_ms: 200,
            ..RoomConfig::default()
        }
        .with_participant_id(ParticipantId::new("b"));
        let (room, mut events) = RoomManager::join(
            room_id.clone(),
            config,
            presence.clone(),
            Arc::new(MemoryTransport::default()),
            Arc::new(SharedText::default()),
        )
        .await
        .unwrap();
        assert_eq!(room.status().await.unwrap().leadership, LeadershipState::Follower);

        let record = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(RoomEvent::LeaderChanged(Some(record))) => return record,
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(record.participant_id.as_str(), "b");
        assert_eq!(room.status().await.unwrap().leadership, LeadershipState::Leader);
        assert_eq!(presence.leader(&room_id).await.unwrap(), Some(record));
    }

    /// Accepts registration, then fails every leader read and unregister.
    struct FailingAfterRegister(MemoryPresence);

    #[async_trait::async_trait]
    impl PresenceService for FailingAfterRegister {
        async fn register_participant(
            &self,
            room: &RoomId,
            entry: PresenceEntry,
        ) -> Result<(), PresenceError> {
            self.0.register_participant(room, entry).await
        }

        async fn unregister_participant(
            &self,
            _room: &RoomId,
            _participant: &ParticipantId,
        ) -> Result<(), PresenceError> {
            Err(PresenceError::Unavailable)
        }

        async fn participants(&self, room: &RoomId) -> Result<Vec<PresenceEntry>, PresenceError> {
            self.0.participants(room).await
        }

        async fn watch_participants(
            &self,
            room: &RoomId,
        ) -> Result<broadcast::Receiver<ParticipantEvent>, PresenceError> {
            self.0.watch_participants(room).await
        }

        async fn set_leader(&self, room: &RoomId, record: LeaderRecord) -> Result<(), PresenceError> {
            self.0.set_leader(room, record).await
        }

        async fn leader(&self, _room: &RoomId) -> Result<Option<LeaderRecord>, PresenceError> {
            Err(PresenceError::Unavailable)
        }

        async fn remove_leader(
            &self,
            room: &RoomId,
            participant: &ParticipantId,
        ) -> Result<(), PresenceError> {
            self.0.remove_leader(room, participant).await
        }

        async fn watch_leader(
            &self,
            room: &RoomId,
        ) -> Result<watch::Receiver<Option<LeaderRecord>>, PresenceError> {
            self.0.watch_leader(room).await
        }

        async fn room_exists(&self, room: &RoomId) -> Result<bool, PresenceError> {
            self.0.room_exists(room).await
        }
    }

    #[tokio::test]
    async fn test_failed_initialize_still_stops_listening() {
        let presence = Arc::new(FailingAfterRegister(MemoryPresence::new()));
        let transport = Arc::new(MemoryTransport::default());
        let room_id = RoomId::new("r");

        let result = RoomManager::join(
            room_id.clone(),
            RoomConfig::default().with_participant_id(ParticipantId::new("a")),
            presence.clone(),
            transport.clone(),
            Arc::new(SharedText::default()),
        )
        .await;

        assert!(matches!(result, Err(RoomError::Presence(PresenceError::Unavailable))));
        assert_eq!(transport.listener_count(), 0);
        // The unregister failure is logged; the entry stays for the store to expire.
        assert_eq!(presence.0.participants(&room_id).await.unwrap().len(), 1);
    }
}
