//! Room presence: who is in a room, and who leads it.
//!
//! ```text
//! RoomManager ──register / unregister──▶ PresenceService
//!      ▲                                    │
//!      │       ParticipantEvent (broadcast) │
//!      ├────────────────────────────────────┤
//!      │       Option<LeaderRecord> (watch) │
//!      └────────────────────────────────────┘
//! ```
//!
//! The presence service is an external shared store. [`MemoryPresence`]
//! is an in-process implementation used by tests and single-process
//! deployments; it also simulates expiry of abruptly terminated
//! participants and service outages. A room nobody is in, leads or
//! watches is dropped on the next write.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};

use crate::protocol::{LeaderRecord, ParticipantId, PeerAddress, RoomId};

/// Buffered participant events per subscriber before lagging.
const EVENT_CAPACITY: usize = 64;

// ───────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────

/// One participant registered in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub participant_id: ParticipantId,
    pub address: PeerAddress,
    /// Milliseconds since the Unix epoch.
    pub joined_at: i64,
}

impl PresenceEntry {
    pub fn leader_record(&self) -> LeaderRecord {
        LeaderRecord {
            participant_id: self.participant_id.clone(),
            address: self.address.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// Change in a room's participant set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    Added(PresenceEntry),
    Removed(ParticipantId),
}

/// Presence errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("presence service unavailable")]
    Unavailable,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid presence data: {0}")]
    InvalidData(String),
}

/// Shared store of room membership and leader records.
#[async_trait]
pub trait PresenceService: Send + Sync {
    /// Add or replace the entry for `entry.participant_id`.
    async fn register_participant(
        &self,
        room: &RoomId,
        entry: PresenceEntry,
    ) -> Result<(), PresenceError>;

    async fn unregister_participant(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), PresenceError>;

    /// Current entries, ordered by participant id.
    async fn participants(&self, room: &RoomId) -> Result<Vec<PresenceEntry>, PresenceError>;

    /// Subscribe to membership changes.
    async fn watch_participants(
        &self,
        room: &RoomId,
    ) -> Result<broadcast::Receiver<ParticipantEvent>, PresenceError>;

    /// Unconditionally overwrite the leader record.
    async fn set_leader(&self, room: &RoomId, record: LeaderRecord) -> Result<(), PresenceError>;

    async fn leader(&self, room: &RoomId) -> Result<Option<LeaderRecord>, PresenceError>;

    /// Clear the leader record, but only while `participant` holds it.
    async fn remove_leader(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), PresenceError>;

    /// Subscribe to the leader record. The current value is observable immediately.
    async fn watch_leader(
        &self,
        room: &RoomId,
    ) -> Result<watch::Receiver<Option<LeaderRecord>>, PresenceError>;

    /// Whether anyone is registered in `room`.
    async fn room_exists(&self, room: &RoomId) -> Result<bool, PresenceError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory implementation
// ───────────────────────────────────────────────────────────────────

struct RoomPresence {
    participants: BTreeMap<ParticipantId, PresenceEntry>,
    leader: watch::Sender<Option<LeaderRecord>>,
    events: broadcast::Sender<ParticipantEvent>,
}

impl RoomPresence {
    fn new() -> Self {
        let (leader, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            participants: BTreeMap::new(),
            leader,
            events,
        }
    }

    fn remove(&mut self, participant: &ParticipantId) -> bool {
        if self.participants.remove(participant).is_none() {
            return false;
        }
        // No subscribers is fine.
        let _ = self
            .events
            .send(ParticipantEvent::Removed(participant.clone()));
        true
    }

    /// Nothing stored and nobody watching.
    fn is_idle(&self) -> bool {
        self.participants.is_empty()
            && self.leader.borrow().is_none()
            && self.leader.receiver_count() == 0
            && self.events.receiver_count() == 0
    }

    fn clear_leader_if_held(&self, participant: &ParticipantId) -> bool {
        self.leader.send_if_modified(|current| {
            let held = current
                .as_ref()
                .is_some_and(|record| &record.participant_id == participant);
            if held {
                *current = None;
            }
            held
        })
    }
}

/// In-process [`PresenceService`].
pub struct MemoryPresence {
    rooms: RwLock<HashMap<RoomId, RoomPresence>>,
    available: AtomicBool,
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop a participant the way the backing store would after their
    /// session vanished: the entry goes, and the leader record too if held.
    pub async fn expire_participant(&self, room: &RoomId, participant: &ParticipantId) {
        let mut rooms = self.rooms.write().await;
        if let Some(presence) = rooms.get_mut(room) {
            let removed = presence.remove(participant);
            let cleared = presence.clear_leader_if_held(participant);
            log::debug!(
                "Expired {participant} from room {room} (entry: {removed}, leader: {cleared})"
            );
        }
        rooms.retain(|_, presence| !presence.is_idle());
    }

    /// Number of rooms currently held.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    fn check(&self) -> Result<(), PresenceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PresenceError::Unavailable)
        }
    }

    async fn with_room<T>(&self, room: &RoomId, f: impl FnOnce(&mut RoomPresence) -> T) -> T {
        let mut rooms = self.rooms.write().await;
        let presence = rooms.entry(room.clone()).or_insert_with(RoomPresence::new);
        let result = f(presence);
        rooms.retain(|_, presence| !presence.is_idle());
        result
    }
}

#[async_trait]
impl PresenceService for MemoryPresence {
    async fn register_participant(
        &self,
        room: &RoomId,
        entry: PresenceEntry,
    ) -> Result<(), PresenceError> {
        self.check()?;
        if !entry.address.belongs_to(&entry.participant_id) {
            return Err(PresenceError::InvalidData(format!(
                "address {} does not belong to {}",
                entry.address, entry.participant_id
            )));
        }
        self.with_room(room, |presence| {
            presence
                .participants
                .insert(entry.participant_id.clone(), entry.clone());
            let _ = presence.events.send(ParticipantEvent::Added(entry));
        })
        .await;
        Ok(())
    }

    async fn unregister_participant(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), PresenceError> {
        self.check()?;
        self.with_room(room, |presence| {
            presence.remove(participant);
        })
        .await;
        Ok(())
    }

    async fn participants(&self, room: &RoomId) -> Result<Vec<PresenceEntry>, PresenceError> {
        self.check()?;
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(room)
            .map(|presence| presence.participants.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch_participants(
        &self,
        room: &RoomId,
    ) -> Result<broadcast::Receiver<ParticipantEvent>, PresenceError> {
        self.check()?;
        Ok(self
            .with_room(room, |presence| presence.events.subscribe())
            .await)
    }

    async fn set_leader(&self, room: &RoomId, record: LeaderRecord) -> Result<(), PresenceError> {
        self.check()?;
        self.with_room(room, |presence| {
            presence.leader.send_replace(Some(record));
        })
        .await;
        Ok(())
    }

    async fn leader(&self, room: &RoomId) -> Result<Option<LeaderRecord>, PresenceError> {
        self.check()?;
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(room)
            .and_then(|presence| presence.leader.borrow().clone()))
    }

    async fn remove_leader(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), PresenceError> {
        self.check()?;
        self.with_room(room, |presence| {
            presence.clear_leader_if_held(participant);
        })
        .await;
        Ok(())
    }

    async fn watch_leader(
        &self,
        room: &RoomId,
    ) -> Result<watch::Receiver<Option<LeaderRecord>>, PresenceError> {
        self.check()?;
        Ok(self
            .with_room(room, |presence| presence.leader.subscribe())
            .await)
    }

    async fn room_exists(&self, room: &RoomId) -> Result<bool, PresenceError> {
        self.check()?;
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(room)
            .is_some_and(|presence| !presence.participants.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(room: &RoomId, id: &str, joined_at: i64) -> PresenceEntry {
        let participant_id = ParticipantId::new(id);
        PresenceEntry {
            address: PeerAddress::new(room, &participant_id),
            participant_id,
            joined_at,
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("abc12");

        assert!(!presence.room_exists(&room).await.unwrap());

        presence.register_participant(&room, entry(&room, "b", 2)).await.unwrap();
        presence.register_participant(&room, entry(&room, "a", 1)).await.unwrap();

        let list = presence.participants(&room).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].participant_id.as_str(), "a");
        assert!(presence.room_exists(&room).await.unwrap());

        presence.unregister_participant(&room, &ParticipantId::new("a")).await.unwrap();
        assert_eq!(presence.participants(&room).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_foreign_address() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("abc12");
        let mut bad = entry(&room, "a", 1);
        bad.address = PeerAddress::from_raw("abc12-someoneelse");

        let err = presence.register_participant(&room, bad).await.unwrap_err();
        assert!(matches!(err, PresenceError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_participant_events() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("r");
        let mut events = presence.watch_participants(&room).await.unwrap();

        let a = entry(&room, "a", 1);
        presence.register_participant(&room, a.clone()).await.unwrap();
        presence.unregister_participant(&room, &a.participant_id).await.unwrap();
        // Second removal is a no-op and emits nothing.
        presence.unregister_participant(&room, &a.participant_id).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), ParticipantEvent::Added(a.clone()));
        assert_eq!(
            events.recv().await.unwrap(),
            ParticipantEvent::Removed(a.participant_id.clone())
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_leader_only_when_held() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("r");
        let a = entry(&room, "a", 1);
        presence.set_leader(&room, a.leader_record()).await.unwrap();

        presence.remove_leader(&room, &ParticipantId::new("b")).await.unwrap();
        assert_eq!(presence.leader(&room).await.unwrap(), Some(a.leader_record()));

        presence.remove_leader(&room, &a.participant_id).await.unwrap();
        assert_eq!(presence.leader(&room).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_leader_sees_changes() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("r");
        let mut watcher = presence.watch_leader(&room).await.unwrap();
        assert!(watcher.borrow_and_update().is_none());

        let a = entry(&room, "a", 1);
        presence.set_leader(&room, a.leader_record()).await.unwrap();
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow_and_update(), Some(a.leader_record()));
    }

    #[tokio::test]
    async fn test_expire_clears_held_leadership() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("r");
        let a = entry(&room, "a", 1);
        presence.register_participant(&room, a.clone()).await.unwrap();
        presence.set_leader(&room, a.leader_record()).await.unwrap();

        presence.expire_participant(&room, &a.participant_id).await;

        assert!(presence.participants(&room).await.unwrap().is_empty());
        assert!(presence.leader(&room).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_service() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("r");
        presence.set_available(false);

        assert_eq!(
            presence.participants(&room).await.unwrap_err(),
            PresenceError::Unavailable
        );
        assert_eq!(
            presence
                .register_participant(&room, entry(&room, "a", 1))
                .await
                .unwrap_err(),
            PresenceError::Unavailable
        );

        presence.set_available(true);
        assert!(presence.participants(&room).await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_rooms_are_dropped() {
        let presence = MemoryPresence::new();
        let room = RoomId::new("r");
        let a = entry(&room, "a", 1);

        presence.unregister_participant(&room, &a.participant_id).await.unwrap();
        presence.remove_leader(&room, &a.participant_id).await.unwrap();
        assert_eq!(presence.room_count().await, 0);

        let watcher = presence.watch_leader(&room).await.unwrap();
        presence.register_participant(&room, a.clone()).await.unwrap();
        presence.unregister_participant(&room, &a.participant_id).await.unwrap();
        assert_eq!(presence.room_count().await, 1);

        // Once nobody watches, the next write sweeps it.
        drop(watcher);
        presence
            .unregister_participant(&RoomId::new("other"), &a.participant_id)
            .await
            .unwrap();
        assert_eq!(presence.room_count().await, 0);
    }
}
