use tracing::{debug, info};

use crate::core::app::actions::{reduce, TurnAction};
use crate::core::app::state::StateHandle;
use crate::core::app::TurnError;
use crate::core::message::{EntryId, Message, TranscriptEntry};
use crate::core::store::SessionStore;

/// Reconciles in-memory state with the store and owns the structural edits
/// (edit, delete, rewind, pin).
///
/// Edits are saved before they are applied, so a failed save leaves the
/// transcript untouched. Every edit is refused while a turn is in flight:
/// the in-memory transcript then holds placeholders or a cleared
/// regeneration target that must not reach the store.
pub struct SessionSynchronizer<'a> {
    state: &'a StateHandle,
    store: &'a dyn SessionStore,
}

impl<'a> SessionSynchronizer<'a> {
    pub fn new(state: &'a StateHandle, store: &'a dyn SessionStore) -> Self {
        Self { state, store }
    }

    /// Replace the loaded session with the store's copy.
    pub async fn reload(&self) -> Result<(), TurnError> {
        let session_id = self
            .state
            .read(|state| state.session.as_ref().map(|session| session.id.clone()))
            .ok_or(TurnError::NoSession)?;
        self.load(&session_id).await
    }

    pub async fn load(&self, session_id: &str) -> Result<(), TurnError> {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| TurnError::NotFound(format!("Session '{session_id}'")))?;
        session.sort_messages();
        info!(
            session_id,
            messages = session.messages.len(),
            "session loaded from store"
        );
        self.state.dispatch(TurnAction::LoadSession(session));
        Ok(())
    }

    /// Rewrite a message's content, and its current variant's content when it
    /// has variants.
    pub async fn edit(&self, message_id: &str, content: String) -> Result<(), TurnError> {
        let mut message = self.require_message(message_id)?;
        if let Some(index) = message.current_variant_index() {
            message.variants[index].content = content.clone();
        }
        message.content = content;
        self.commit(TurnAction::ReplaceMessage {
            message_id: message_id.to_string(),
            message,
        })
        .await
    }

    pub async fn delete(&self, message_id: &str) -> Result<(), TurnError> {
        self.ensure_idle()?;
        let message = self.require_message(message_id)?;
        if message.is_pinned {
            return Err(TurnError::Pinned {
                message_id: message.id,
            });
        }
        self.commit(TurnAction::RemoveEntry(EntryId::Persisted(message.id)))
            .await
    }

    /// Drop everything after `message_id`. Rejected when a later message is
    /// pinned.
    pub async fn rewind_to(&self, message_id: &str) -> Result<(), TurnError> {
        self.ensure_idle()?;
        let (index, len, pinned) = self
            .state
            .read(|state| {
                let index = state.transcript.iter().position(|entry| {
                    entry.matches(&EntryId::Persisted(message_id.to_string()))
                })?;
                let pinned = state.transcript[index + 1..]
                    .iter()
                    .filter_map(TranscriptEntry::as_persisted)
                    .find(|message| message.is_pinned)
                    .map(|message| message.id.clone());
                Some((index, state.transcript.len(), pinned))
            })
            .ok_or_else(|| TurnError::NotFound(format!("Message '{message_id}'")))?;

        if let Some(pinned_id) = pinned {
            return Err(TurnError::Pinned {
                message_id: pinned_id,
            });
        }
        if index + 1 == len {
            debug!(message_id, "rewind target is already the last message");
            return Ok(());
        }
        self.commit(TurnAction::TruncateAfter {
            message_id: message_id.to_string(),
        })
        .await
    }

    /// Flip the pin flag and return the new value.
    pub async fn toggle_pin(&self, message_id: &str) -> Result<bool, TurnError> {
        let mut message = self.require_message(message_id)?;
        message.is_pinned = !message.is_pinned;
        let pinned = message.is_pinned;
        self.commit(TurnAction::ReplaceMessage {
            message_id: message_id.to_string(),
            message,
        })
        .await?;
        Ok(pinned)
    }

    /// Save the session as it would look after `action`, then apply it.
    pub(crate) async fn commit(&self, action: TurnAction) -> Result<(), TurnError> {
        self.ensure_idle()?;
        let preview = reduce(self.state.snapshot(), action.clone());
        let session = preview.persistable_session().ok_or(TurnError::NoSession)?;
        self.store.save(&session).await?;
        self.state.dispatch(action);
        Ok(())
    }

    fn require_message(&self, message_id: &str) -> Result<Message, TurnError> {
        self.state
            .read(|state| state.message(message_id).cloned())
            .ok_or_else(|| TurnError::NotFound(format!("Message '{message_id}'")))
    }

    fn ensure_idle(&self) -> Result<(), TurnError> {
        if self.state.read(|state| state.is_busy()) {
            return Err(TurnError::Busy);
        }
        Ok(())
    }
}
