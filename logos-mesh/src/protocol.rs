//! JSON wire protocol for room coordination messages.
//!
//! Wire format (one JSON object per channel frame):
//! ```text
//! ┌────────────────┬──────────────────┬───────────────────────────┐
//! │ "type"         │ "sender"         │ "data"                    │
//! │ kind tag       │ ParticipantId    │ kind-specific payload     │
//! └────────────────┴──────────────────┴───────────────────────────┘
//! ```
//!
//! The set of kinds is closed: [`Message`] has one variant per kind and
//! each variant fixes its payload shape. Frames with an unknown `"type"`
//! fail to decode and are dropped by the connection layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Short name of an ephemeral collaboration room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one session inside a room (e.g. `swiftfox482`).
///
/// Ordering is lexicographic and is used as the election tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh human-readable id.
    pub fn generate() -> Self {
        crate::identity::generate_participant_id()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport rendezvous address: `<roomId>-<participantId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Derive the address of `participant` in `room`.
    pub fn new(room: &RoomId, participant: &ParticipantId) -> Self {
        Self(format!("{room}-{participant}"))
    }

    /// Wrap an address received from the outside (presence entries, leader records).
    pub fn from_raw(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this address was derived from `participant`.
    pub fn belongs_to(&self, participant: &ParticipantId) -> bool {
        self.0
            .strip_suffix(participant.as_str())
            .is_some_and(|prefix| prefix.ends_with('-'))
    }

    /// Participant part of the address (text after the last `-`).
    pub fn participant(&self) -> Option<ParticipantId> {
        self.0
            .rsplit_once('-')
            .filter(|(room, id)| !room.is_empty() && !id.is_empty())
            .map(|(_, id)| ParticipantId::new(id))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a shared file, generated by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random v4 UUID, rendered as a string.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Metadata of a shared file, without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: FileId,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    /// Participant holding the blob.
    #[serde(rename = "sender")]
    pub owner: ParticipantId,
}

/// A complete file, as carried by a `file-response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub id: FileId,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    #[serde(rename = "sender")]
    pub owner: ParticipantId,
    /// Base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl FilePayload {
    pub fn new(metadata: FileMetadata, content: Vec<u8>) -> Self {
        Self {
            id: metadata.id,
            name: metadata.name,
            mime_type: metadata.mime_type,
            size: metadata.size,
            owner: metadata.owner,
            content,
        }
    }

    /// Metadata part of the payload.
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            owner: self.owner.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    pub id: FileId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoined {
    #[serde(rename = "userId")]
    pub user_id: ParticipantId,
}

/// Point-in-time view of the room sent to late joiners.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub text: String,
    pub files: Vec<FileMetadata>,
}

/// The elected coordinator of a room.
///
/// Stored by the presence service and carried by `leader-announcement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    #[serde(rename = "userId")]
    pub participant_id: ParticipantId,
    #[serde(rename = "peerId")]
    pub address: PeerAddress,
    #[serde(rename = "joinedAt")]
    pub joined_at: i64,
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// Message kinds, used as router keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TextUpdate,
    FileMetadata,
    FileRequest,
    FileResponse,
    UserJoined,
    RoomStateRequest,
    RoomStateResponse,
    LeaderAnnouncement,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::TextUpdate,
        MessageKind::FileMetadata,
        MessageKind::FileRequest,
        MessageKind::FileResponse,
        MessageKind::UserJoined,
        MessageKind::RoomStateRequest,
        MessageKind::RoomStateResponse,
        MessageKind::LeaderAnnouncement,
    ];

    /// Tag string used in the `"type"` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::TextUpdate => "text-update",
            MessageKind::FileMetadata => "file-metadata",
            MessageKind::FileRequest => "file-request",
            MessageKind::FileResponse => "file-response",
            MessageKind::UserJoined => "user-joined",
            MessageKind::RoomStateRequest => "room-state-request",
            MessageKind::RoomStateResponse => "room-state-response",
            MessageKind::LeaderAnnouncement => "leader-announcement",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level protocol message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    TextUpdate {
        sender: ParticipantId,
        data: String,
    },
    FileMetadata {
        sender: ParticipantId,
        data: FileMetadata,
    },
    FileRequest {
        sender: ParticipantId,
        data: FileRequest,
    },
    FileResponse {
        sender: ParticipantId,
        data: FilePayload,
    },
    UserJoined {
        sender: ParticipantId,
        data: UserJoined,
    },
    RoomStateRequest {
        sender: ParticipantId,
    },
    RoomStateResponse {
        sender: ParticipantId,
        data: RoomSnapshot,
    },
    LeaderAnnouncement {
        sender: ParticipantId,
        data: LeaderRecord,
    },
}

impl Message {
    pub fn text_update(sender: ParticipantId, text: impl Into<String>) -> Self {
        Message::TextUpdate {
            sender,
            data: text.into(),
        }
    }

    pub fn file_metadata(sender: ParticipantId, metadata: FileMetadata) -> Self {
        Message::FileMetadata {
            sender,
            data: metadata,
        }
    }

    pub fn file_request(sender: ParticipantId, id: FileId) -> Self {
        Message::FileRequest {
            sender,
            data: FileRequest { id },
        }
    }

    pub fn file_response(sender: ParticipantId, payload: FilePayload) -> Self {
        Message::FileResponse {
            sender,
            data: payload,
        }
    }

    /// Handshake sent on every freshly opened channel.
    pub fn user_joined(sender: ParticipantId) -> Self {
        Message::UserJoined {
            data: UserJoined {
                user_id: sender.clone(),
            },
            sender,
        }
    }

    pub fn room_state_request(sender: ParticipantId) -> Self {
        Message::RoomStateRequest { sender }
    }

    pub fn room_state_response(sender: ParticipantId, snapshot: RoomSnapshot) -> Self {
        Message::RoomStateResponse {
            sender,
            data: snapshot,
        }
    }

    pub fn leader_announcement(sender: ParticipantId, record: LeaderRecord) -> Self {
        Message::LeaderAnnouncement {
            sender,
            data: record,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::TextUpdate { .. } => MessageKind::TextUpdate,
            Message::FileMetadata { .. } => MessageKind::FileMetadata,
            Message::FileRequest { .. } => MessageKind::FileRequest,
            Message::FileResponse { .. } => MessageKind::FileResponse,
            Message::UserJoined { .. } => MessageKind::UserJoined,
            Message::RoomStateRequest { .. } => MessageKind::RoomStateRequest,
            Message::RoomStateResponse { .. } => MessageKind::RoomStateResponse,
            Message::LeaderAnnouncement { .. } => MessageKind::LeaderAnnouncement,
        }
    }

    pub fn sender(&self) -> &ParticipantId {
        match self {
            Message::TextUpdate { sender, .. }
            | Message::FileMetadata { sender, .. }
            | Message::FileRequest { sender, .. }
            | Message::FileResponse { sender, .. }
            | Message::UserJoined { sender, .. }
            | Message::RoomStateRequest { sender }
            | Message::RoomStateResponse { sender, .. }
            | Message::LeaderAnnouncement { sender, .. } => sender,
        }
    }

    /// Serialize to a JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Deserialize from a JSON frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
