//! The chat controller: turn orchestration, session synchronization, and
//! variant selection over one shared [`TurnState`].
//!
//! All entry points take `&self` so an abort can be issued from another task
//! while a turn is streaming. State changes go through [`StateHandle`] and
//! reach observers as `watch` revisions.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::backend::CompletionService;
use crate::core::character::{seed_starting_scene, Character, Persona};
use crate::core::chat_stream::LegacyFormatPolicy;
use crate::core::config::Config;
use crate::core::message::Message;
use crate::core::store::{SessionStore, StoreError};
use crate::core::stream_bus::StreamEventBus;

pub mod actions;
pub mod state;
pub mod sync;
pub mod turns;
pub mod variants;

#[cfg(test)]
mod tests;

pub use actions::{reduce, TurnAction};
pub use state::{ActiveRequest, MessageActionMode, MessageActionPanel, StateHandle, TurnState};
pub use sync::SessionSynchronizer;
pub use turns::TurnOutcome;
pub use variants::{SwipeDirection, SwipeGesture, VariantResolver};

/// Errors returned by controller entry points.
///
/// Backend failures are not in here: the orchestrator absorbs them into the
/// error banner and a resync, and reports them through [`TurnOutcome`].
#[derive(Debug)]
pub enum TurnError {
    /// The request was rejected before any side effect.
    Validation(&'static str),
    NoSession,
    NoCharacter,
    /// A regeneration is in flight.
    Busy,
    /// The operation would remove or rewrite past a pinned message.
    Pinned { message_id: String },
    NotFound(String),
    Store(StoreError),
}

impl std::fmt::Display for TurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnError::Validation(reason) => write!(f, "{reason}"),
            TurnError::NoSession => write!(f, "No session is loaded"),
            TurnError::NoCharacter => write!(f, "No character is loaded"),
            TurnError::Busy => write!(f, "A turn is in progress"),
            TurnError::Pinned { message_id } => write!(f, "Message '{message_id}' is pinned"),
            TurnError::NotFound(what) => write!(f, "{what} not found"),
            TurnError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TurnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TurnError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for TurnError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => TurnError::NotFound(format!("Session '{id}'")),
            other => TurnError::Store(other),
        }
    }
}

/// Tunables the controller reads from [`Config`].
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub frame_interval: Duration,
    pub legacy_format: LegacyFormatPolicy,
    pub swipe_threshold_px: f32,
    pub aborted_phrases: Vec<String>,
    /// Ask the backend to stream deltas.
    pub stream: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for TurnSettings {
    fn from(config: &Config) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            legacy_format: config.stream.legacy_format,
            swipe_threshold_px: config.gestures.swipe_threshold_px,
            aborted_phrases: config.turns.aborted_phrases.clone(),
            stream: true,
        }
    }
}

/// Whether `text` carries one of the configured "aborted by user" signatures.
pub fn is_abort_message(text: &str, phrases: &[String]) -> bool {
    let text = text.to_lowercase();
    phrases
        .iter()
        .filter(|phrase| !phrase.is_empty())
        .any(|phrase| text.contains(&phrase.to_lowercase()))
}

pub(crate) struct ActiveTurn {
    pub request_id: String,
    pub cancel: CancellationToken,
    /// Cancelled once the turn loop has landed its last deltas.
    pub drained: CancellationToken,
    /// Pre-regeneration copy of the target message.
    pub restore: Option<Message>,
}

pub struct ChatController {
    state: StateHandle,
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn CompletionService>,
    bus: StreamEventBus,
    settings: TurnSettings,
    active_turn: Mutex<Option<ActiveTurn>>,
}

impl ChatController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn CompletionService>,
        bus: StreamEventBus,
        settings: TurnSettings,
    ) -> Self {
        Self {
            state: StateHandle::default(),
            store,
            backend,
            bus,
            settings,
            active_turn: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> TurnState {
        self.state.snapshot()
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn synchronizer(&self) -> SessionSynchronizer<'_> {
        SessionSynchronizer::new(&self.state, self.store.as_ref())
    }

    pub fn variants(&self) -> VariantResolver<'_> {
        VariantResolver::new(
            &self.state,
            self.synchronizer(),
            self.settings.swipe_threshold_px,
        )
    }

    pub fn active_request_id(&self) -> Option<String> {
        self.state.read(|state| {
            state
                .active_request
                .as_ref()
                .map(|request| request.request_id.clone())
        })
    }

    pub fn load_character(&self, character: Character) {
        self.state.dispatch(TurnAction::LoadCharacter(character));
    }

    pub fn set_persona(&self, persona: Option<Persona>) {
        self.state.dispatch(TurnAction::LoadPersona(persona));
    }

    /// Load a stored session into the transcript.
    pub async fn open_session(&self, session_id: &str) -> Result<(), TurnError> {
        self.synchronizer().load(session_id).await
    }

    /// Create a session for `character`, seed its starting scene, and load it.
    pub async fn start_session(
        &self,
        character: Character,
        title: &str,
        persona_id: Option<&str>,
        starting_scene_id: Option<&str>,
    ) -> Result<String, TurnError> {
        let mut session = self
            .store
            .create(&character.id, title, persona_id, starting_scene_id)
            .await?;
        seed_starting_scene(&mut session, &character, starting_scene_id);
        self.store.save(&session).await?;

        let session_id = session.id.clone();
        self.state.dispatch(TurnAction::Batch(vec![
            TurnAction::LoadCharacter(character),
            TurnAction::LoadSession(session),
        ]));
        Ok(session_id)
    }

    pub fn open_message_action(&self, message_id: &str) -> Result<(), TurnError> {
        if self.state.read(|state| state.message(message_id).is_none()) {
            return Err(TurnError::NotFound(format!("Message '{message_id}'")));
        }
        self.state.dispatch(TurnAction::OpenMessageAction {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    pub fn close_message_action(&self) {
        self.state.dispatch(TurnAction::CloseMessageAction);
    }

    pub fn set_message_action_mode(&self, mode: MessageActionMode) {
        self.state.dispatch(TurnAction::SetMessageActionMode(mode));
    }

    pub fn set_message_action_draft(&self, draft: impl Into<String>) {
        self.state
            .dispatch(TurnAction::SetMessageActionDraft(draft.into()));
    }

    /// Save the open panel's draft as the message's new content and return
    /// the panel to view mode.
    pub async fn commit_message_edit(&self) -> Result<(), TurnError> {
        let Some((message_id, draft)) = self.state.read(|state| {
            state
                .message_action
                .as_ref()
                .filter(|panel| panel.mode == MessageActionMode::Edit)
                .map(|panel| (panel.message.id.clone(), panel.draft.clone()))
        }) else {
            return Err(TurnError::Validation("No message is being edited"));
        };
        self.synchronizer().edit(&message_id, draft).await?;
        self.state
            .dispatch(TurnAction::SetMessageActionMode(MessageActionMode::View));
        Ok(())
    }

    fn lock_active_turn(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active_turn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
