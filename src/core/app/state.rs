use tokio::sync::watch;

use crate::core::app::actions::{reduce, TurnAction};
use crate::core::character::{Character, Persona};
use crate::core::message::{EntryId, Message, Session, TranscriptEntry};

/// The request currently streaming and the transcript entries it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRequest {
    pub request_id: String,
    pub targets: Vec<EntryId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageActionMode {
    #[default]
    View,
    Edit,
}

/// The per-message action panel (copy/edit/pin/variants) the UI may have open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageActionPanel {
    pub message: Message,
    pub mode: MessageActionMode,
    pub draft: String,
}

#[derive(Debug, Clone, Default)]
pub struct TurnState {
    /// Session header. Its `messages` are kept in `transcript` while loaded.
    pub session: Option<Session>,
    pub transcript: Vec<TranscriptEntry>,
    pub character: Option<Character>,
    pub persona: Option<Persona>,
    pub sending: bool,
    pub active_request: Option<ActiveRequest>,
    pub regenerating_message_id: Option<String>,
    pub message_action: Option<MessageActionPanel>,
    /// Error banner text for the last failed turn.
    pub error: Option<String>,
    /// Bumped once per dispatched action (a batch counts once).
    pub revision: u64,
}

impl TurnState {
    pub fn is_busy(&self) -> bool {
        self.sending || self.regenerating_message_id.is_some()
    }

    pub fn entry(&self, id: &EntryId) -> Option<&TranscriptEntry> {
        self.transcript.iter().find(|entry| entry.matches(id))
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.transcript
            .iter()
            .filter_map(TranscriptEntry::as_persisted)
            .find(|message| message.id == message_id)
    }

    pub fn last_entry(&self) -> Option<&TranscriptEntry> {
        self.transcript.last()
    }

    /// The session exactly as it may be written to the store: placeholders are
    /// excluded.
    pub fn persistable_session(&self) -> Option<Session> {
        let mut session = self.session.clone()?;
        session.messages = self
            .transcript
            .iter()
            .filter_map(TranscriptEntry::as_persisted)
            .cloned()
            .collect();
        Some(session)
    }
}

/// Owner of the reducer state. Every change goes through [`StateHandle::dispatch`]
/// and is published to watchers as one revision.
pub struct StateHandle {
    tx: watch::Sender<TurnState>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new(TurnState::default())
    }
}

impl StateHandle {
    pub fn new(initial: TurnState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn dispatch(&self, action: TurnAction) {
        self.tx.send_modify(|state| {
            let previous = std::mem::take(state);
            *state = reduce(previous, action);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TurnState {
        self.tx.borrow().clone()
    }

    /// Read without cloning. The closure must not dispatch.
    pub fn read<R>(&self, f: impl FnOnce(&TurnState) -> R) -> R {
        f(&self.tx.borrow())
    }
}
