//! Room session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::files::MAX_FILE_SIZE;
use crate::protocol::ParticipantId;

/// Per-session settings for [`RoomManager::join`](crate::room::RoomManager::join).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Fixed participant id (None = generate one)
    pub participant_id: Option<ParticipantId>,
    /// Wait after losing the leader before re-electing, in milliseconds
    pub settle_delay_ms: u64,
    /// Give up waiting for a room snapshot after this many milliseconds
    pub text_loading_timeout_ms: u64,
    /// Largest accepted file, in bytes
    pub max_file_size: u64,
    /// Capacity of the connection-event and command queues
    pub channel_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            participant_id: None,
            settle_delay_ms: 1000,
            text_loading_timeout_ms: 2000,
            max_file_size: MAX_FILE_SIZE,
            channel_capacity: 256,
        }
    }
}

impl RoomConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_participant_id(mut self, id: ParticipantId) -> Self {
        self.participant_id = Some(id);
        self
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn text_loading_timeout(&self) -> Duration {
        Duration::from_millis(self.text_loading_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RoomConfig::default();
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.text_loading_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_file_size, 50 * 1024 * 1024);
        assert!(config.participant_id.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RoomConfig::from_json(r#"{"settle_delay_ms": 50, "participant_id": "calmowl1"}"#)
            .unwrap();
        assert_eq!(config.settle_delay_ms, 50);
        assert_eq!(config.participant_id, Some(ParticipantId::new("calmowl1")));
        assert_eq!(config.text_loading_timeout_ms, 2000);
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_invalid_json() {
        assert!(RoomConfig::from_json("{not json").is_err());
    }
}
