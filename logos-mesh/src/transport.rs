//! Point-to-point channels between peer addresses.
//!
//! ```text
//!   connect(A, B)                       listen(B)
//!  ┌──────────────┐   Data / Close    ┌──────────────┐
//!  │ Channel @ A  │ ────────────────▶ │ Channel @ B  │
//!  │  sender  ────┼──┐             ┌──┼──── sender   │
//!  │  events ◀────┼──┼─────────────┘  │    events ──▶│
//!  └──────────────┘  └──────────────▶ └──────────────┘
//! ```
//!
//! Each side owns a [`ChannelSender`] that writes into the other side's
//! event queue, so ordering is preserved per direction. Channels are
//! reliable: a send only fails once the remote end is gone. Dropping the
//! sender ends the remote event stream, which the remote reads as a close.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::PeerAddress;

/// Event observed on one end of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Data(Vec<u8>),
    Close,
    Error(TransportError),
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerAddress),
    #[error("channel closed")]
    ChannelClosed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Write half of a channel.
#[derive(Debug)]
pub struct ChannelSender {
    remote: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelSender {
    pub fn new(remote: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { remote }
    }

    /// Queue `bytes` for the remote end without waiting. Nothing is lost
    /// while the remote end is alive.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.remote
            .send(ChannelEvent::Data(bytes))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Tell the remote end the channel is going away.
    pub fn close(&self) {
        let _ = self.remote.send(ChannelEvent::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.remote.is_closed()
    }
}

/// One end of an established channel.
#[derive(Debug)]
pub struct Channel {
    /// Address of the other end.
    pub remote: PeerAddress,
    pub sender: ChannelSender,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Rendezvous and channel factory.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting channels addressed to `local`.
    async fn listen(&self, local: &PeerAddress) -> Result<mpsc::Receiver<Channel>, TransportError>;

    /// Open a channel from `local` to `remote`. The returned channel
    /// reports [`ChannelEvent::Open`] once the remote end is ready.
    async fn connect(
        &self,
        local: &PeerAddress,
        remote: &PeerAddress,
    ) -> Result<Channel, TransportError>;

    /// Stop accepting channels for `local`.
    async fn unlisten(&self, local: &PeerAddress);
}

// ───────────────────────────────────────────────────────────────────
// In-memory implementation
// ───────────────────────────────────────────────────────────────────

/// In-process [`Transport`]: a hub mapping addresses to listeners.
pub struct MemoryTransport {
    listeners: Mutex<HashMap<PeerAddress, mpsc::Sender<Channel>>>,
    capacity: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryTransport {
    /// `capacity` bounds the backlog of channels waiting to be accepted.
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .map(|listeners| listeners.values().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn pair(&self, local: &PeerAddress, remote: &PeerAddress) -> (Channel, Channel) {
        let (to_local, local_events) = mpsc::unbounded_channel();
        let (to_remote, remote_events) = mpsc::unbounded_channel();
        // Both receivers are alive here.
        let _ = to_local.send(ChannelEvent::Open);
        let _ = to_remote.send(ChannelEvent::Open);

        let initiator = Channel {
            remote: remote.clone(),
            sender: ChannelSender::new(to_remote),
            events: local_events,
        };
        let acceptor = Channel {
            remote: local.clone(),
            sender: ChannelSender::new(to_local),
            events: remote_events,
        };
        (initiator, acceptor)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, local: &PeerAddress) -> Result<mpsc::Receiver<Channel>, TransportError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| TransportError::Failed("listener table poisoned".into()))?;
        if listeners.get(local).is_some_and(|existing| !existing.is_closed()) {
            return Err(TransportError::Failed(format!("{local} is already listening")));
        }
        listeners.insert(local.clone(), tx);
        log::debug!("Listening on {local}");
        Ok(rx)
    }

    async fn connect(
        &self,
        local: &PeerAddress,
        remote: &PeerAddress,
    ) -> Result<Channel, TransportError> {
        let listener = {
            let listeners = self
                .listeners
                .lock()
                .map_err(|_| TransportError::Failed("listener table poisoned".into()))?;
            listeners.get(remote).cloned()
        };
        let listener = listener.ok_or_else(|| TransportError::Unreachable(remote.clone()))?;

        let (initiator, acceptor) = self.pair(local, remote);
        listener
            .send(acceptor)
            .await
            .map_err(|_| TransportError::Unreachable(remote.clone()))?;
        Ok(initiator)
    }

    async fn unlisten(&self, local: &PeerAddress) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(local);
        }
    }
}
