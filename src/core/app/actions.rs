//! The turn state machine.
//!
//! [`reduce`] is a pure `(state, action) -> state` function. Actions that
//! address entries which no longer exist are no-ops, which is what makes
//! reconciliation idempotent and safe to apply after an abort has already
//! cleaned up.

use crate::core::app::state::{ActiveRequest, MessageActionMode, MessageActionPanel, TurnState};
use crate::core::character::{Character, Persona};
use crate::core::message::{EntryId, Message, PlaceholderId, Session, TranscriptEntry};

#[derive(Debug, Clone)]
pub enum TurnAction {
    /// Replace the loaded session wholesale; messages become the transcript.
    LoadSession(Session),
    LoadCharacter(Character),
    LoadPersona(Option<Persona>),
    SetSending(bool),
    SetActiveRequest(Option<ActiveRequest>),
    SetRegenerating(Option<String>),
    SetError(Option<String>),
    AppendEntry(TranscriptEntry),
    AppendContent {
        target: EntryId,
        text: String,
    },
    ClearContent {
        target: EntryId,
    },
    /// Swap a placeholder for its persisted counterpart, keeping its position.
    ReplacePlaceholder {
        placeholder: PlaceholderId,
        message: Message,
    },
    /// Swap a persisted message for a newer version (the id may change).
    ReplaceMessage {
        message_id: String,
        message: Message,
    },
    /// Keep an unconfirmed placeholder as a permanent message under `message_id`.
    PromotePlaceholder {
        placeholder: PlaceholderId,
        message_id: String,
    },
    RemoveEntry(EntryId),
    /// Drop every entry after the persisted message `message_id`.
    TruncateAfter {
        message_id: String,
    },
    SetSelectedScene(Option<String>),
    OpenMessageAction {
        message_id: String,
    },
    SetMessageActionMode(MessageActionMode),
    SetMessageActionDraft(String),
    CloseMessageAction,
    /// Clear in-flight flags, but only if `request_id` is still the active one.
    FinishTurn {
        request_id: String,
    },
    /// Several actions applied as one transition.
    Batch(Vec<TurnAction>),
}

pub fn reduce(mut state: TurnState, action: TurnAction) -> TurnState {
    apply(&mut state, action);
    state.revision += 1;
    state
}

fn apply(state: &mut TurnState, action: TurnAction) {
    match action {
        TurnAction::LoadSession(mut session) => {
            let messages = std::mem::take(&mut session.messages);
            state.transcript = messages.into_iter().map(TranscriptEntry::Persisted).collect();
            state.session = Some(session);
            refresh_message_action(state);
        }
        TurnAction::LoadCharacter(character) => state.character = Some(character),
        TurnAction::LoadPersona(persona) => state.persona = persona,
        TurnAction::SetSending(sending) => state.sending = sending,
        TurnAction::SetActiveRequest(request) => state.active_request = request,
        TurnAction::SetRegenerating(message_id) => state.regenerating_message_id = message_id,
        TurnAction::SetError(error) => state.error = error,
        TurnAction::AppendEntry(entry) => {
            let id = entry.id();
            if state.entry(&id).is_none() {
                state.transcript.push(entry);
            }
        }
        TurnAction::AppendContent { target, text } => {
            if let Some(entry) = entry_mut(state, &target) {
                match entry {
                    TranscriptEntry::Placeholder(placeholder) => {
                        placeholder.content.push_str(&text)
                    }
                    TranscriptEntry::Persisted(message) => message.content.push_str(&text),
                }
            }
        }
        TurnAction::ClearContent { target } => {
            if let Some(entry) = entry_mut(state, &target) {
                match entry {
                    TranscriptEntry::Placeholder(placeholder) => placeholder.content.clear(),
                    TranscriptEntry::Persisted(message) => {
                        message.content.clear();
                        // Show the cleared body while streaming, not a variant.
                        message.variants.clear();
                        message.selected_variant_id = None;
                    }
                }
            }
        }
        TurnAction::ReplacePlaceholder {
            placeholder,
            message,
        } => {
            let Some(index) = position(state, &EntryId::Placeholder(placeholder)) else {
                return;
            };
            let duplicate = position(state, &EntryId::Persisted(message.id.clone()));
            match duplicate {
                Some(existing) => {
                    state.transcript[existing] = TranscriptEntry::Persisted(message);
                    state.transcript.remove(index);
                }
                None => state.transcript[index] = TranscriptEntry::Persisted(message),
            }
            refresh_message_action(state);
        }
        TurnAction::ReplaceMessage {
            message_id,
            message,
        } => {
            let Some(index) = position(state, &EntryId::Persisted(message_id.clone())) else {
                return;
            };
            if message.id != message_id
                && position(state, &EntryId::Persisted(message.id.clone())).is_some()
            {
                state.transcript.remove(index);
            } else {
                state.transcript[index] = TranscriptEntry::Persisted(message.clone());
            }
            retarget_message_action(state, &message_id, message);
        }
        TurnAction::PromotePlaceholder {
            placeholder,
            message_id,
        } => {
            let Some(index) = position(state, &EntryId::Placeholder(placeholder)) else {
                return;
            };
            if let TranscriptEntry::Placeholder(pending) = state.transcript[index].clone() {
                state.transcript[index] = TranscriptEntry::Persisted(pending.into_message(message_id));
            }
        }
        TurnAction::RemoveEntry(id) => {
            state.transcript.retain(|entry| !entry.matches(&id));
            if let (EntryId::Persisted(message_id), Some(panel)) = (&id, &state.message_action) {
                if panel.message.id == *message_id {
                    state.message_action = None;
                }
            }
        }
        TurnAction::TruncateAfter { message_id } => {
            if let Some(index) = position(state, &EntryId::Persisted(message_id)) {
                state.transcript.truncate(index + 1);
                refresh_message_action(state);
            }
        }
        TurnAction::SetSelectedScene(scene_id) => {
            if let Some(session) = state.session.as_mut() {
                session.selected_scene_id = scene_id;
            }
        }
        TurnAction::OpenMessageAction { message_id } => {
            if let Some(message) = state.message(&message_id).cloned() {
                let draft = message.display_content().to_string();
                state.message_action = Some(MessageActionPanel {
                    message,
                    mode: MessageActionMode::View,
                    draft,
                });
            }
        }
        TurnAction::SetMessageActionMode(mode) => {
            if let Some(panel) = state.message_action.as_mut() {
                panel.mode = mode;
                if mode == MessageActionMode::Edit {
                    panel.draft = panel.message.display_content().to_string();
                }
            }
        }
        TurnAction::SetMessageActionDraft(draft) => {
            if let Some(panel) = state.message_action.as_mut() {
                panel.draft = draft;
            }
        }
        TurnAction::CloseMessageAction => state.message_action = None,
        TurnAction::FinishTurn { request_id } => {
            let matches = state
                .active_request
                .as_ref()
                .is_none_or(|active| active.request_id == request_id);
            if matches {
                state.sending = false;
                state.active_request = None;
                state.regenerating_message_id = None;
            }
        }
        TurnAction::Batch(actions) => {
            for action in actions {
                apply(state, action);
            }
        }
    }
}

fn position(state: &TurnState, id: &EntryId) -> Option<usize> {
    state.transcript.iter().position(|entry| entry.matches(id))
}

fn entry_mut<'a>(state: &'a mut TurnState, id: &EntryId) -> Option<&'a mut TranscriptEntry> {
    state.transcript.iter_mut().find(|entry| entry.matches(id))
}

/// Re-read the open panel's message from the transcript, closing the panel
/// if the message is gone.
fn refresh_message_action(state: &mut TurnState) {
    let Some(panel) = state.message_action.as_ref() else {
        return;
    };
    let id = panel.message.id.clone();
    match state.message(&id).cloned() {
        Some(message) => {
            if let Some(panel) = state.message_action.as_mut() {
                panel.message = message;
            }
        }
        None => state.message_action = None,
    }
}

fn retarget_message_action(state: &mut TurnState, old_id: &str, message: Message) {
    if let Some(panel) = state.message_action.as_mut() {
        if panel.message.id == old_id {
            if panel.mode == MessageActionMode::View {
                panel.draft = message.display_content().to_string();
            }
            panel.message = message;
        }
    }
}
