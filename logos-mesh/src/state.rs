//! Shared text and room snapshots for late joiners.
//!
//! Text is last-writer-wins: a text update or a snapshot replaces the
//! whole buffer. A joining follower stays in the loading state until a
//! snapshot arrives or the session gives up waiting.

use std::sync::{Arc, RwLock};

use crate::protocol::{FileMetadata, Message, ParticipantId, RoomSnapshot};

/// Text storage owned by the host application (e.g. an editor widget).
pub trait TextBuffer: Send + Sync {
    fn text(&self) -> String;
    fn replace(&self, text: String);
}

/// Plain in-memory [`TextBuffer`]. Clones share the same text.
#[derive(Debug, Clone, Default)]
pub struct SharedText(Arc<RwLock<String>>);

impl SharedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(text.into())))
    }
}

impl TextBuffer for SharedText {
    fn text(&self) -> String {
        match self.0.read() {
            Ok(text) => text.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, text: String) {
        match self.0.write() {
            Ok(mut current) => *current = text,
            Err(poisoned) => *poisoned.into_inner() = text,
        }
    }
}

pub struct StateService {
    participant: ParticipantId,
    buffer: Arc<dyn TextBuffer>,
    loading: bool,
    /// Last text applied from a peer, for echo suppression.
    last_remote: Option<String>,
}

impl StateService {
    pub fn new(participant: ParticipantId, buffer: Arc<dyn TextBuffer>) -> Self {
        Self {
            participant,
            buffer,
            loading: false,
            last_remote: None,
        }
    }

    pub fn text(&self) -> String {
        self.buffer.text()
    }

    pub fn create_snapshot(&self, files: Vec<FileMetadata>) -> RoomSnapshot {
        RoomSnapshot {
            text: self.buffer.text(),
            files,
        }
    }

    /// Apply a peer's text. Our own updates echoed back are ignored.
    pub fn handle_text_update(&mut self, sender: &ParticipantId, text: &str) -> bool {
        if sender == &self.participant {
            return false;
        }
        self.apply_remote(text);
        true
    }

    /// Messages answering a state request: the snapshot, then every
    /// known file's metadata on its own.
    pub fn on_state_request(
        &self,
        requester: &ParticipantId,
        files: Vec<FileMetadata>,
    ) -> Vec<Message> {
        log::debug!("Preparing room state for {requester}");
        let mut replies = Vec::with_capacity(files.len() + 1);
        replies.push(Message::room_state_response(
            self.participant.clone(),
            self.create_snapshot(files.clone()),
        ));
        replies.extend(
            files
                .into_iter()
                .map(|meta| Message::file_metadata(self.participant.clone(), meta)),
        );
        replies
    }

    /// Apply a snapshot's text unconditionally. File entries are expected
    /// through the metadata messages that follow it.
    pub fn on_state_response(&mut self, sender: &ParticipantId, snapshot: &RoomSnapshot) -> bool {
        if sender == &self.participant {
            return false;
        }
        self.apply_remote(&snapshot.text);
        true
    }

    /// Store local text and build its update, unless it only echoes the
    /// text a peer just gave us.
    pub fn local_update(&mut self, text: String) -> Option<Message> {
        if self.last_remote.take().as_deref() == Some(text.as_str()) {
            log::debug!("Suppressed echo of remote text");
            return None;
        }
        self.buffer.replace(text.clone());
        Some(Message::text_update(self.participant.clone(), text))
    }

    pub fn state_request(&self) -> Message {
        Message::room_state_request(self.participant.clone())
    }

    pub fn begin_loading(&mut self) {
        self.loading = true;
    }

    /// Returns true if we were loading.
    pub fn finish_loading(&mut self) -> bool {
        std::mem::replace(&mut self.loading, false)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    fn apply_remote(&mut self, text: &str) {
        self.buffer.replace(text.to_string());
        self.last_remote = Some(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileId;

    fn service(text: &str) -> (StateService, SharedText) {
        let buffer = SharedText::new(text);
        (
            StateService::new(ParticipantId::new("a"), Arc::new(buffer.clone())),
            buffer,
        )
    }

    fn meta(id: &str) -> FileMetadata {
        FileMetadata {
            id: FileId::new(id),
            name: format!("{id}.txt"),
            mime_type: "text/plain".into(),
            size: 1,
            owner: ParticipantId::new("a"),
        }
    }

    #[test]
    fn test_text_update_from_peer_replaces_buffer() {
        let (mut state, buffer) = service("old");
        assert!(state.handle_text_update(&ParticipantId::new("b"), "hello"));
        assert_eq!(buffer.text(), "hello");
    }

    #[test]
    fn test_own_text_update_ignored() {
        let (mut state, buffer) = service("mine");
        assert!(!state.handle_text_update(&ParticipantId::new("a"), "echo"));
        assert_eq!(buffer.text(), "mine");
    }

    #[test]
    fn test_state_request_reply() {
        let (state, _) = service("doc");
        let replies = state.on_state_request(&ParticipantId::new("b"), vec![meta("f1"), meta("f2")]);

        assert_eq!(replies.len(), 3);
        match &replies[0] {
            Message::RoomStateResponse { data, .. } => {
                assert_eq!(data.text, "doc");
                assert_eq!(data.files.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(replies[1..]
            .iter()
            .all(|m| matches!(m, Message::FileMetadata { .. })));
    }

    #[test]
    fn test_state_response_applies_empty_text() {
        let (mut state, buffer) = service("stale");
        let snapshot = RoomSnapshot {
            text: String::new(),
            files: vec![],
        };
        assert!(state.on_state_response(&ParticipantId::new("b"), &snapshot));
        assert_eq!(buffer.text(), "");
    }

    #[test]
    fn test_local_update_suppresses_echo_once() {
        let (mut state, buffer) = service("");
        state.handle_text_update(&ParticipantId::new("b"), "remote");

        assert!(state.local_update("remote".into()).is_none());
        assert!(state.local_update("remote".into()).is_some());

        let msg = state.local_update("typed".into()).unwrap();
        assert_eq!(msg, Message::text_update(ParticipantId::new("a"), "typed"));
        assert_eq!(buffer.text(), "typed");
    }

    #[test]
    fn test_loading_flag() {
        let (mut state, _) = service("");
        assert!(!state.finish_loading());
        state.begin_loading();
        assert!(state.is_loading());
        assert!(state.finish_loading());
        assert!(!state.is_loading());
    }
}
