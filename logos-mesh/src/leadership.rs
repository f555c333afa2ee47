//! Leader election over presence entries.
//!
//! ```text
//!              leader record exists
//!  Unelected ─────────────────────────────▶ Follower
//!      │                                      ▲  │
//!      │ no record                 other wins │  │ record removed
//!      ▼                                      │  ▼
//!  Candidate ──── earliest joiner ───▶ Leader   (settle delay, re-elect)
//! ```
//!
//! The participant with the smallest `joined_at` wins; equal timestamps
//! fall back to the smaller participant id. Only the winner writes the
//! leader record. Two peers electing at once may both write; the record
//! the presence service keeps is adopted by everyone, including its owner
//! if it had already yielded. Peer announcements never override that
//! record.
//!
//! A follower waiting for an elected winner that never writes its record
//! re-runs the election without it once the settle delay passes.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 9

use std::collections::HashSet;

use crate::presence::{PresenceEntry, PresenceError, PresenceService};
use crate::protocol::{LeaderRecord, Message, ParticipantId, RoomId};

/// Election state of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Unelected,
    Candidate,
    Leader,
    Follower,
}

/// What changed after an election step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipTransition {
    BecameLeader(LeaderRecord),
    /// Following a leader, or waiting for the elected one to announce itself.
    Following(Option<LeaderRecord>),
    LeaderLost,
    SteppedDown,
    Unchanged,
}

/// Pick the winner among `entries`.
pub fn elect(entries: &[PresenceEntry]) -> Option<&PresenceEntry> {
    entries
        .iter()
        .min_by(|a, b| (a.joined_at, &a.participant_id).cmp(&(b.joined_at, &b.participant_id)))
}

/// Whether `a` would win an election against `b`.
pub fn precedes(a: &LeaderRecord, b: &LeaderRecord) -> bool {
    (a.joined_at, &a.participant_id) < (b.joined_at, &b.participant_id)
}

pub struct LeadershipService {
    room: RoomId,
    me: LeaderRecord,
    state: LeadershipState,
    current_leader: Option<LeaderRecord>,
    /// Skipped by the next election: a leader whose record vanished, or a
    /// winner that never wrote one. Their presence entries may linger.
    excluded: HashSet<ParticipantId>,
    /// Winner of our last election that has not written its record yet.
    awaited: Option<ParticipantId>,
}

impl LeadershipService {
    pub fn new(room: RoomId, me: PresenceEntry) -> Self {
        Self {
            room,
            me: me.leader_record(),
            state: LeadershipState::Unelected,
            current_leader: None,
            excluded: HashSet::new(),
            awaited: None,
        }
    }

    pub fn state(&self) -> LeadershipState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == LeadershipState::Leader
    }

    pub fn current_leader(&self) -> Option<&LeaderRecord> {
        self.current_leader.as_ref()
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.me.participant_id
    }

    /// Follow the existing leader, or run the first election.
    pub async fn initialize(
        &mut self,
        presence: &dyn PresenceService,
    ) -> Result<LeadershipTransition, PresenceError> {
        let existing = match presence.leader(&self.room).await {
            Ok(existing) => existing,
            Err(e) => {
                self.state = LeadershipState::Unelected;
                return Err(e);
            }
        };
        match existing {
            Some(record) if record.participant_id != self.me.participant_id => {
                Ok(self.follow(record))
            }
            // A stale record of ours from a previous session is overwritten.
            _ => self.run_election(presence).await,
        }
    }

    pub async fn run_election(
        &mut self,
        presence: &dyn PresenceService,
    ) -> Result<LeadershipTransition, PresenceError> {
        self.state = LeadershipState::Candidate;
        let mut entries = match presence.participants(&self.room).await {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Election in room {} failed: {e}", self.room);
                self.state = LeadershipState::Unelected;
                return Err(e);
            }
        };

        entries.retain(|entry| !self.excluded.contains(&entry.participant_id));
        // Our own registration may not be visible yet.
        if !entries
            .iter()
            .any(|entry| entry.participant_id == self.me.participant_id)
        {
            entries.push(PresenceEntry {
                participant_id: self.me.participant_id.clone(),
                address: self.me.address.clone(),
                joined_at: self.me.joined_at,
            });
        }

        let winner = elect(&entries).map(|entry| entry.participant_id.clone());
        if winner.as_ref() == Some(&self.me.participant_id) {
            self.become_leader(presence).await
        } else {
            log::info!(
                "Room {}: {} is the earliest participant, following",
                self.room,
                winner.as_ref().map(ParticipantId::as_str).unwrap_or("?")
            );
            self.state = LeadershipState::Follower;
            self.awaited = winner;
            Ok(LeadershipTransition::Following(self.current_leader.clone()))
        }
    }

    /// Write our leader record.
    pub async fn become_leader(
        &mut self,
        presence: &dyn PresenceService,
    ) -> Result<LeadershipTransition, PresenceError> {
        if let Err(e) = presence.set_leader(&self.room, self.me.clone()).await {
            log::error!("Failed to become leader of room {}: {e}", self.room);
            self.state = LeadershipState::Unelected;
            return Err(e);
        }
        self.state = LeadershipState::Leader;
        self.current_leader = Some(self.me.clone());
        self.excluded.clear();
        self.awaited = None;
        log::info!("Became leader of room {}: {}", self.room, self.me.participant_id);
        Ok(LeadershipTransition::BecameLeader(self.me.clone()))
    }

    /// Remove our leader record. No-op unless leading.
    pub async fn step_down(
        &mut self,
        presence: &dyn PresenceService,
    ) -> Result<LeadershipTransition, PresenceError> {
        if !self.is_leader() {
            return Ok(LeadershipTransition::Unchanged);
        }
        presence
            .remove_leader(&self.room, &self.me.participant_id)
            .await?;
        self.state = LeadershipState::Unelected;
        self.current_leader = None;
        log::info!("Stepped down as leader of room {}: {}", self.room, self.me.participant_id);
        Ok(LeadershipTransition::SteppedDown)
    }

    /// React to the presence service's leader record changing.
    pub fn on_leader_record(&mut self, record: Option<LeaderRecord>) -> LeadershipTransition {
        match record {
            Some(record) if record.participant_id == self.me.participant_id => {
                if self.is_leader() {
                    return LeadershipTransition::Unchanged;
                }
                // We yielded to a rival whose write the store did not keep.
                log::info!("Room {}: leader record is ours, resuming leadership", self.room);
                self.state = LeadershipState::Leader;
                self.current_leader = Some(self.me.clone());
                self.excluded.clear();
                self.awaited = None;
                LeadershipTransition::BecameLeader(self.me.clone())
            }
            Some(record) => {
                if self.state == LeadershipState::Follower
                    && self.current_leader.as_ref() == Some(&record)
                {
                    return LeadershipTransition::Unchanged;
                }
                if self.is_leader() {
                    log::warn!(
                        "Room {}: yielding leadership to {}",
                        self.room,
                        record.participant_id
                    );
                }
                self.follow(record)
            }
            None => {
                let previous = self.current_leader.take();
                if previous.is_none() && !self.is_leader() {
                    return LeadershipTransition::Unchanged;
                }
                if let Some(previous) = previous {
                    self.excluded.insert(previous.participant_id);
                }
                self.state = LeadershipState::Unelected;
                log::info!("Room {}: leader lost", self.room);
                LeadershipTransition::LeaderLost
            }
        }
    }

    /// Adopt the stored leader record, or elect again when there is none.
    ///
    /// Runs when the settle delay passes and when the caller retries a
    /// failed election. A winner we were still waiting for is skipped.
    pub async fn reconcile(
        &mut self,
        presence: &dyn PresenceService,
    ) -> Result<LeadershipTransition, PresenceError> {
        match presence.leader(&self.room).await? {
            Some(record) => Ok(self.on_leader_record(Some(record))),
            None => {
                if let Some(silent) = self.awaited.take() {
                    log::warn!("Room {}: {silent} was elected but never took the lead", self.room);
                    self.excluded.insert(silent);
                }
                self.run_election(presence).await
            }
        }
    }

    /// A peer announced itself as leader. The stored record decides; the
    /// announcement is only weighed while the store cannot be read.
    pub async fn on_announcement(
        &mut self,
        record: LeaderRecord,
        presence: &dyn PresenceService,
    ) -> LeadershipTransition {
        match presence.leader(&self.room).await {
            Ok(Some(stored)) => self.on_leader_record(Some(stored)),
            Ok(None) => LeadershipTransition::Unchanged,
            Err(e) => {
                log::warn!(
                    "Room {}: cannot read leader record ({e}), judging announcement from {}",
                    self.room,
                    record.participant_id
                );
                if self.is_leader() && precedes(&self.me, &record) {
                    LeadershipTransition::Unchanged
                } else {
                    self.on_leader_record(Some(record))
                }
            }
        }
    }

    /// Announcement for a freshly elected leader.
    pub fn announcement(&self) -> Option<Message> {
        self.is_leader()
            .then(|| Message::leader_announcement(self.me.participant_id.clone(), self.me.clone()))
    }

    fn follow(&mut self, record: LeaderRecord) -> LeadershipTransition {
        log::info!("Room {}: following leader {}", self.room, record.participant_id);
        self.state = LeadershipState::Follower;
        self.current_leader = Some(record.clone());
        self.excluded.clear();
        self.awaited = None;
        LeadershipTransition::Following(Some(record))
    }
}
