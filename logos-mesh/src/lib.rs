//! # logos-mesh — Peer-to-peer room coordination for Logos
//!
//! Lets a set of clients in a named room share one text buffer and
//! exchange files over direct peer channels, with no server relaying
//! payloads. A presence service tracks who is in the room and who leads
//! it; everything else travels peer to peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  register / watch   ┌──────────────────┐
//! │  RoomManager    │ ◄─────────────────► │ PresenceService  │
//! │  (per client)   │                     │ (shared store)   │
//! └────────┬────────┘                     └──────────────────┘
//!          │ event loop
//!          ├── LeadershipService   (earliest joiner leads)
//!          ├── ConnectionManager ◄──── Transport channels ────► other peers
//!          │        │
//!          │        ▼
//!          ├── MessageRouter ──► StateService (text, snapshots)
//!          │                 └─► FileService  (blobs, metadata)
//!          └── Scheduler           (settle delay, loading timeout)
//! ```
//!
//! Followers send updates to the leader, which relays them to everyone
//! else; when the leader link is down they broadcast directly. Text is
//! last-writer-wins.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and identifiers
//! - [`presence`]: presence service contract and in-memory store
//! - [`transport`]: channel contract and in-memory transport
//! - [`connection`]: open channels, handshake, broadcast and unicast
//! - [`router`]: kind-keyed handler dispatch with failure isolation
//! - [`leadership`]: leader election state machine
//! - [`files`]: file blobs and shared metadata
//! - [`state`]: shared text and room snapshots
//! - [`scheduler`]: cancelable session timers
//! - [`room`]: the room session and its public handle

pub mod config;
pub mod connection;
pub mod files;
pub mod identity;
pub mod leadership;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::RoomConfig;
pub use connection::{ConnectionManager, ConnectionStats, ConnectionUpdate, Delivery};
pub use files::{FileError, FileService, FileUpload, ReceivedFile, MAX_FILE_SIZE};
pub use identity::{generate_participant_id, generate_room_id};
pub use leadership::{elect, precedes, LeadershipService, LeadershipState, LeadershipTransition};
pub use presence::{MemoryPresence, ParticipantEvent, PresenceEntry, PresenceError, PresenceService};
pub use protocol::{
    FileId, FileMetadata, FilePayload, LeaderRecord, Message, MessageKind, ParticipantId,
    PeerAddress, ProtocolError, RoomId, RoomSnapshot,
};
pub use room::{RoomError, RoomEvent, RoomManager, RoomStatus};
pub use router::{DispatchReport, HandlerError, HandlerId, MessageRouter};
pub use scheduler::{Scheduler, TimerFired};
pub use state::{SharedText, StateService, TextBuffer};
pub use transport::{Channel, ChannelEvent, ChannelSender, MemoryTransport, Transport, TransportError};
