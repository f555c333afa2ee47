//! Open channels to the other participants of a room.
//!
//! ```text
//!                 ┌────────────────── ConnectionManager ──────────────────┐
//! Transport ─────▶│ accept / connect ─▶ connections: PeerAddress → Channel │
//!                 │                          │ forwarder task per channel  │
//!                 └──────────────────────────┼─────────────────────────────┘
//!                                            ▼
//!                                 ConnectionEvent (mpsc) ─▶ room event loop
//!                                            │
//!                                handle_event() ─▶ ConnectionUpdate
//! ```
//!
//! The manager itself is owned by the room's event loop. Every channel gets
//! a forwarder task that tags its events with the channel's generation id,
//! so events from a replaced channel can be ignored.
//!
//! When two peers connect to each other at once, both sides keep the
//! channel initiated by the smaller address and drop the other one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{Message, ParticipantId, PeerAddress};
use crate::transport::{Channel, ChannelEvent, ChannelSender, Transport, TransportError};

/// Generation id of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// Channel event tagged with its origin.
#[derive(Debug)]
pub struct ConnectionEvent {
    pub address: PeerAddress,
    pub channel: ChannelId,
    pub event: ChannelEvent,
}

/// Result of processing one [`ConnectionEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Opened(PeerAddress),
    Message { from: PeerAddress, message: Message },
    Closed(PeerAddress),
    Failed { address: PeerAddress, error: TransportError },
    /// Stale channel or undecodable frame.
    Ignored,
}

/// How a prioritized send was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Leader,
    /// Fallback: sent to this many open channels.
    Broadcast(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub connections_opened: u64,
    pub connections_failed: u64,
}

struct Connection {
    id: ChannelId,
    sender: ChannelSender,
    open: bool,
    initiated_locally: bool,
    forwarder: JoinHandle<()>,
}

pub struct ConnectionManager {
    local: PeerAddress,
    participant: ParticipantId,
    transport: Arc<dyn Transport>,
    connections: HashMap<PeerAddress, Connection>,
    leader: Option<PeerAddress>,
    events: mpsc::Sender<ConnectionEvent>,
    next_id: u64,
    stats: ConnectionStats,
}

impl ConnectionManager {
    /// Create a manager and the stream of its channel events.
    pub fn new(
        local: PeerAddress,
        participant: ParticipantId,
        transport: Arc<dyn Transport>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                local,
                participant,
                transport,
                connections: HashMap::new(),
                leader: None,
                events,
                next_id: 0,
                stats: ConnectionStats::default(),
            },
            rx,
        )
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    /// Open a channel to `remote`. Returns false if it is us or a channel
    /// already exists.
    pub async fn connect(&mut self, remote: &PeerAddress) -> Result<bool, TransportError> {
        if remote == &self.local || self.connections.contains_key(remote) {
            return Ok(false);
        }
        let transport = Arc::clone(&self.transport);
        match transport.connect(&self.local, remote).await {
            Ok(channel) => {
                self.register(channel, true);
                Ok(true)
            }
            Err(e) => {
                self.stats.connections_failed += 1;
                log::warn!("Failed to connect {} -> {remote}: {e}", self.local);
                Err(e)
            }
        }
    }

    /// Connect to every address, the known leader first.
    pub async fn connect_prioritized(
        &mut self,
        mut addresses: Vec<PeerAddress>,
    ) -> Vec<(PeerAddress, TransportError)> {
        addresses.sort();
        addresses.dedup();
        let leader = self.leader.clone();
        addresses.sort_by_key(|address| Some(address) != leader.as_ref());

        let mut failures = Vec::new();
        for address in addresses {
            if let Err(e) = self.connect(&address).await {
                failures.push((address, e));
            }
        }
        failures
    }

    /// Take a channel opened by a remote peer. Returns whether it was kept.
    pub fn accept(&mut self, channel: Channel) -> bool {
        if channel.remote == self.local {
            log::warn!("Rejected channel from own address {}", self.local);
            channel.sender.close();
            return false;
        }
        self.accept_channel(channel, false)
    }

    fn accept_channel(&mut self, channel: Channel, initiated_locally: bool) -> bool {
        let remote = channel.remote.clone();
        let Some(existing) = self.connections.get(&remote) else {
            self.register(channel, initiated_locally);
            return true;
        };

        // Keep the channel whose initiator has the smaller address.
        let preferred_initiated_locally = self.local < remote;
        if existing.initiated_locally == preferred_initiated_locally
            || initiated_locally != preferred_initiated_locally
        {
            log::debug!("Dropping duplicate channel with {remote}");
            channel.sender.close();
            return false;
        }

        if let Some(replaced) = self.connections.remove(&remote) {
            log::debug!("Replacing channel with {remote}");
            replaced.forwarder.abort();
            replaced.sender.close();
        }
        self.register(channel, initiated_locally);
        true
    }

    fn register(&mut self, channel: Channel, initiated_locally: bool) {
        self.next_id += 1;
        let id = ChannelId(self.next_id);
        let Channel {
            remote,
            sender,
            mut events,
        } = channel;

        let tx = self.events.clone();
        let address = remote.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = matches!(event, ChannelEvent::Close | ChannelEvent::Error(_));
                let tagged = ConnectionEvent {
                    address: address.clone(),
                    channel: id,
                    event,
                };
                if tx.send(tagged).await.is_err() || terminal {
                    return;
                }
            }
            // Remote end dropped without a close.
            let _ = tx
                .send(ConnectionEvent {
                    address,
                    channel: id,
                    event: ChannelEvent::Close,
                })
                .await;
        });

        self.connections.insert(
            remote,
            Connection {
                id,
                sender,
                open: false,
                initiated_locally,
                forwarder,
            },
        );
    }

    /// Apply one channel event.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> ConnectionUpdate {
        let ConnectionEvent {
            address,
            channel,
            event,
        } = event;
        let current = self
            .connections
            .get(&address)
            .is_some_and(|conn| conn.id == channel);
        if !current {
            return ConnectionUpdate::Ignored;
        }

        match event {
            ChannelEvent::Open => {
                let handshake = Message::user_joined(self.participant.clone());
                if let Some(conn) = self.connections.get_mut(&address) {
                    conn.open = true;
                }
                self.stats.connections_opened += 1;
                log::info!("Channel open: {} <-> {address}", self.local);
                self.send_to(&address, &handshake);
                ConnectionUpdate::Opened(address)
            }
            ChannelEvent::Data(bytes) => {
                self.stats.messages_received += 1;
                match Message::decode(&bytes) {
                    Ok(message) => {
                        log::debug!("{} from {}", message.kind(), address);
                        ConnectionUpdate::Message {
                            from: address,
                            message,
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping frame from {address}: {e}");
                        ConnectionUpdate::Ignored
                    }
                }
            }
            ChannelEvent::Close => {
                self.connections.remove(&address);
                log::info!("Channel closed: {} <-> {address}", self.local);
                ConnectionUpdate::Closed(address)
            }
            ChannelEvent::Error(error) => {
                if let Some(conn) = self.connections.remove(&address) {
                    conn.sender.close();
                    conn.forwarder.abort();
                }
                self.stats.connections_failed += 1;
                log::warn!("Channel error with {address}: {error}");
                ConnectionUpdate::Failed { address, error }
            }
        }
    }

    /// Send to every open channel. Returns how many were attempted.
    pub fn broadcast(&mut self, message: &Message) -> usize {
        self.broadcast_filtered(message, None)
    }

    /// Send to every open channel except `except`.
    pub fn broadcast_except(&mut self, message: &Message, except: &PeerAddress) -> usize {
        self.broadcast_filtered(message, Some(except))
    }

    fn broadcast_filtered(&mut self, message: &Message, except: Option<&PeerAddress>) -> usize {
        let Some(bytes) = self.encode(message) else {
            return 0;
        };
        let mut attempted = 0;
        let mut sent = 0;
        let mut dropped = 0;
        for (address, conn) in &self.connections {
            if !conn.open || Some(address) == except {
                continue;
            }
            attempted += 1;
            match conn.sender.send(bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    dropped += 1;
                    log::warn!("Dropped {} to {address}: {e}", message.kind());
                }
            }
        }
        self.stats.messages_sent += sent;
        self.stats.messages_dropped += dropped;
        attempted
    }

    /// Send to one channel. Returns false if it is not open or the frame
    /// could not be queued.
    pub fn send_to(&mut self, address: &PeerAddress, message: &Message) -> bool {
        let open = self
            .connections
            .get(address)
            .is_some_and(|conn| conn.open);
        if !open {
            return false;
        }
        let Some(bytes) = self.encode(message) else {
            return false;
        };
        let result = match self.connections.get(address) {
            Some(conn) => conn.sender.send(bytes),
            None => return false,
        };
        match result {
            Ok(()) => {
                self.stats.messages_sent += 1;
                true
            }
            Err(e) => {
                self.stats.messages_dropped += 1;
                log::warn!("Dropped {} to {address}: {e}", message.kind());
                false
            }
        }
    }

    /// Send to the open channel of `participant`, if any.
    pub fn send_to_participant(&mut self, participant: &ParticipantId, message: &Message) -> bool {
        match self.address_of(participant) {
            Some(address) => self.send_to(&address, message),
            None => {
                log::warn!("No open channel to participant {participant}");
                false
            }
        }
    }

    /// Send to the leader, falling back to everyone when the leader link is down.
    pub fn send_prioritized(&mut self, message: &Message) -> Delivery {
        if let Some(leader) = self.leader.clone() {
            if self.send_to(&leader, message) {
                return Delivery::Leader;
            }
        }
        Delivery::Broadcast(self.broadcast(message))
    }

    /// Address of the leader's channel; None when we lead or nobody does.
    pub fn set_leader(&mut self, leader: Option<PeerAddress>) {
        self.leader = leader.filter(|address| address != &self.local);
    }

    pub fn leader(&self) -> Option<&PeerAddress> {
        self.leader.as_ref()
    }

    /// Open channel address belonging to `participant`.
    pub fn address_of(&self, participant: &ParticipantId) -> Option<PeerAddress> {
        self.connections
            .iter()
            .find(|(address, conn)| conn.open && address.belongs_to(participant))
            .map(|(address, _)| address.clone())
    }

    pub fn is_connected(&self, address: &PeerAddress) -> bool {
        self.connections.contains_key(address)
    }

    pub fn is_open(&self, address: &PeerAddress) -> bool {
        self.connections.get(address).is_some_and(|conn| conn.open)
    }

    /// Addresses with an open channel, sorted.
    pub fn open_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.open)
            .map(|(address, _)| address.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Close every channel. No events are reported for them.
    pub fn disconnect_all(&mut self) {
        for (address, conn) in self.connections.drain() {
            conn.forwarder.abort();
            conn.sender.close();
            log::debug!("Closed channel to {address}");
        }
        self.leader = None;
    }

    fn encode(&mut self, message: &Message) -> Option<Vec<u8>> {
        match message.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!("Failed to encode {}: {e}", message.kind());
                self.stats.messages_dropped += 1;
                None
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for conn in self.connections.values() {
            conn.forwarder.abort();
        }
    }
}
