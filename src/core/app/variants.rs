//! Alternate generations and starting scenes.
//!
//! Assistant messages carry variants; scene messages swipe through the
//! character's scene list. Both are only swipeable on the last message of the
//! transcript.

use tracing::debug;

use crate::core::app::actions::TurnAction;
use crate::core::app::state::StateHandle;
use crate::core::app::sync::SessionSynchronizer;
use crate::core::app::TurnError;
use crate::core::message::{Message, Role, TranscriptEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Next,
    Prev,
}

impl SwipeDirection {
    /// Map a horizontal drag offset to a direction once it crosses
    /// `threshold`. Dragging left reveals the next variant.
    pub fn from_offset(offset_x: f32, threshold: f32) -> Option<Self> {
        if offset_x <= -threshold {
            Some(SwipeDirection::Next)
        } else if offset_x >= threshold {
            Some(SwipeDirection::Prev)
        } else {
            None
        }
    }

    fn step(self, index: usize, len: usize) -> usize {
        match self {
            SwipeDirection::Next => (index + 1).min(len.saturating_sub(1)),
            SwipeDirection::Prev => index.saturating_sub(1),
        }
    }
}

/// Tracks one continuous drag so it yields at most one swipe.
#[derive(Debug, Clone)]
pub struct SwipeGesture {
    threshold: f32,
    fired: bool,
}

impl SwipeGesture {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            fired: false,
        }
    }

    pub fn update(&mut self, offset_x: f32) -> Option<SwipeDirection> {
        if self.fired {
            return None;
        }
        let direction = SwipeDirection::from_offset(offset_x, self.threshold)?;
        self.fired = true;
        Some(direction)
    }

    /// Call when the pointer is released.
    pub fn reset(&mut self) {
        self.fired = false;
    }
}

pub struct VariantResolver<'a> {
    state: &'a StateHandle,
    sync: SessionSynchronizer<'a>,
    swipe_threshold_px: f32,
}

impl<'a> VariantResolver<'a> {
    pub fn new(state: &'a StateHandle, sync: SessionSynchronizer<'a>, swipe_threshold_px: f32) -> Self {
        Self {
            state,
            sync,
            swipe_threshold_px,
        }
    }

    pub fn gesture(&self) -> SwipeGesture {
        SwipeGesture::new(self.swipe_threshold_px)
    }

    /// Make `variant_id` the message's current variant and persist it.
    pub async fn apply_variant_selection(
        &self,
        message_id: &str,
        variant_id: &str,
    ) -> Result<(), TurnError> {
        if self
            .state
            .read(|state| state.regenerating_message_id.is_some())
        {
            return Err(TurnError::Busy);
        }
        let mut message = self
            .state
            .read(|state| state.message(message_id).cloned())
            .ok_or_else(|| TurnError::NotFound(format!("Message '{message_id}'")))?;
        let variant = message
            .variants
            .iter()
            .find(|variant| variant.id == variant_id)
            .cloned()
            .ok_or_else(|| TurnError::NotFound(format!("Variant '{variant_id}'")))?;

        message.content = variant.content;
        message.usage = variant.usage;
        message.reasoning = variant.reasoning;
        message.attachments = variant.attachments;
        message.selected_variant_id = Some(variant.id);
        self.sync
            .commit(TurnAction::ReplaceMessage {
                message_id: message_id.to_string(),
                message,
            })
            .await
    }

    /// Move one step through the last message's alternatives. Returns whether
    /// anything changed.
    pub async fn swipe(&self, message_id: &str, direction: SwipeDirection) -> Result<bool, TurnError> {
        let Some(message) = self.state.read(|state| match state.last_entry() {
            Some(TranscriptEntry::Persisted(message)) if message.id == message_id => {
                Some(message.clone())
            }
            _ => None,
        }) else {
            debug!(message_id, "swipe ignored: not the last message");
            return Ok(false);
        };

        match message.role {
            Role::Assistant => self.swipe_variant(&message, direction).await,
            Role::Scene => self.swipe_scene(message, direction).await,
            Role::User => Ok(false),
        }
    }

    /// Turn a drag offset into at most one swipe.
    pub async fn drag(&self, message_id: &str, offset_x: f32) -> Result<bool, TurnError> {
        match SwipeDirection::from_offset(offset_x, self.swipe_threshold_px) {
            Some(direction) => self.swipe(message_id, direction).await,
            None => Ok(false),
        }
    }

    async fn swipe_variant(
        &self,
        message: &Message,
        direction: SwipeDirection,
    ) -> Result<bool, TurnError> {
        if message.variants.len() < 2 {
            return Ok(false);
        }
        let Some(current) = message.current_variant_index() else {
            return Ok(false);
        };
        let next = direction.step(current, message.variants.len());
        if next == current {
            return Ok(false);
        }
        let variant_id = message.variants[next].id.clone();
        self.apply_variant_selection(&message.id, &variant_id).await?;
        Ok(true)
    }

    async fn swipe_scene(
        &self,
        mut message: Message,
        direction: SwipeDirection,
    ) -> Result<bool, TurnError> {
        let Some((scenes, current)) = self.state.read(|state| {
            let character = state.character.as_ref()?;
            let current = state
                .session
                .as_ref()
                .and_then(|session| session.selected_scene_id.as_deref())
                .and_then(|id| character.scene_index(id))
                .unwrap_or(0);
            Some((character.scenes.clone(), current))
        }) else {
            return Err(TurnError::NoCharacter);
        };
        if scenes.len() < 2 {
            return Ok(false);
        }
        let next = direction.step(current, scenes.len());
        if next == current {
            return Ok(false);
        }

        let scene = &scenes[next];
        message.content = scene.display_content().to_string();
        let message_id = message.id.clone();
        self.sync
            .commit(TurnAction::Batch(vec![
                TurnAction::SetSelectedScene(Some(scene.id.clone())),
                TurnAction::ReplaceMessage {
                    message_id,
                    message,
                },
            ]))
            .await?;
        Ok(true)
    }
}
