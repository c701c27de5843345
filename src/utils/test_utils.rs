use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::app::TurnState;
use crate::core::backend::{
    AssistantTurnResponse, BackendError, CompletionService, ContinueTurnRequest,
    RegenerateRequest, SendTurnRequest, SendTurnResponse,
};
use crate::core::character::{Character, Scene};
use crate::core::message::{Message, Session, Variant};
use crate::core::store::{MemorySessionStore, SessionStore};
use crate::core::stream_bus::{NormalizedEvent, StreamEventBus};

pub fn create_test_character() -> Character {
    let scene = |id: &str, content: &str| Scene {
        id: id.to_string(),
        content: content.to_string(),
        variants: Vec::new(),
        selected_variant_id: None,
    };
    Character {
        id: "aria".to_string(),
        name: "Aria".to_string(),
        description: "A wandering bard.".to_string(),
        system_prompt: None,
        scenes: vec![
            scene("scene-a", "A quiet tavern."),
            scene("scene-b", "A stormy harbor."),
            scene("scene-c", "A moonlit garden."),
        ],
        default_scene_id: None,
    }
}

/// A session whose messages are spaced 10ms apart, in the given order.
pub fn create_test_session(messages: Vec<Message>) -> Session {
    let mut session = Session::new("aria", "Test chat");
    session.messages = messages
        .into_iter()
        .enumerate()
        .map(|(index, mut message)| {
            message.created_at = 1_000 + index as i64 * 10;
            message
        })
        .collect();
    session
}

pub fn assistant_with_variants(contents: &[&str]) -> Message {
    let mut message = Message::assistant(contents.last().copied().unwrap_or_default());
    message.variants = contents.iter().map(|content| Variant::new(*content)).collect();
    message
}

#[derive(Clone, Debug)]
pub enum Emission {
    Normalized(NormalizedEvent),
    Raw(String),
}

pub fn delta(text: &str) -> Emission {
    Emission::Normalized(NormalizedEvent::Delta {
        text: text.to_string(),
    })
}

pub fn raw_delta(text: &str) -> String {
    format!(
        "data: {}\n",
        serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
    )
}

#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    /// Persist the reply like a real backend and return it.
    Succeed,
    Fail(String),
    /// Wait for `abort_request`, then report the abort.
    HangUntilAborted,
}

/// A completion service that replays scripted stream events against the
/// shared bus and persists into a [`MemorySessionStore`].
pub struct ScriptedBackend {
    bus: StreamEventBus,
    store: Arc<MemorySessionStore>,
    emissions: Vec<Emission>,
    reply: String,
    outcome: ScriptedOutcome,
    aborted: CancellationToken,
    emitted: CancellationToken,
    abort_calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(bus: StreamEventBus, store: Arc<MemorySessionStore>) -> Self {
        Self {
            bus,
            store,
            emissions: Vec::new(),
            reply: "Hello world".to_string(),
            outcome: ScriptedOutcome::Succeed,
            aborted: CancellationToken::new(),
            emitted: CancellationToken::new(),
            abort_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_emissions(mut self, emissions: Vec<Emission>) -> Self {
        self.emissions = emissions;
        self
    }

    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    pub fn with_outcome(mut self, outcome: ScriptedOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn abort_calls(&self) -> Vec<String> {
        self.abort_calls.lock().unwrap().clone()
    }

    /// Resolves once a call has published all of its scripted emissions.
    pub async fn emitted(&self) {
        self.emitted.cancelled().await;
    }

    async fn play(&self, request_id: &str) -> Result<(), BackendError> {
        for emission in &self.emissions {
            match emission {
                Emission::Normalized(event) => {
                    self.bus.publish_normalized(request_id, event.clone());
                }
                Emission::Raw(chunk) => {
                    self.bus.publish_raw(request_id, chunk.clone());
                }
            }
        }
        self.emitted.cancel();
        match &self.outcome {
            ScriptedOutcome::Succeed => Ok(()),
            ScriptedOutcome::Fail(message) => Err(BackendError::Api(message.clone())),
            ScriptedOutcome::HangUntilAborted => {
                self.aborted.cancelled().await;
                Err(BackendError::Aborted)
            }
        }
    }

    async fn session(&self, session_id: &str) -> Result<Session, BackendError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("Session '{session_id}'")))
    }
}

#[async_trait]
impl CompletionService for ScriptedBackend {
    async fn send_turn(&self, request: SendTurnRequest) -> Result<SendTurnResponse, BackendError> {
        self.play(&request.request_id).await?;
        let mut session = self.session(&request.session_id).await?;
        let mut user_message = Message::user(request.text);
        user_message.attachments = request.attachments;
        let mut assistant_message = Message::assistant(self.reply.clone());
        assistant_message.created_at = user_message.created_at + 1;
        session.messages.push(user_message.clone());
        session.messages.push(assistant_message.clone());
        self.store.save(&session).await?;
        Ok(SendTurnResponse {
            user_message,
            assistant_message,
            usage: None,
        })
    }

    async fn continue_turn(
        &self,
        request: ContinueTurnRequest,
    ) -> Result<AssistantTurnResponse, BackendError> {
        self.play(&request.request_id).await?;
        let mut session = self.session(&request.session_id).await?;
        let assistant_message = Message::assistant(self.reply.clone());
        session.messages.push(assistant_message.clone());
        self.store.save(&session).await?;
        Ok(AssistantTurnResponse { assistant_message })
    }

    async fn regenerate(
        &self,
        request: RegenerateRequest,
    ) -> Result<AssistantTurnResponse, BackendError> {
        self.play(&request.request_id).await?;
        let mut session = self.session(&request.session_id).await?;
        let message = session
            .messages
            .iter_mut()
            .find(|message| message.id == request.message_id)
            .ok_or_else(|| BackendError::NotFound(request.message_id.clone()))?;
        if message.variants.is_empty() {
            message.variants.push(Variant::new(message.content.clone()));
        }
        let variant = Variant::new(self.reply.clone());
        message.content = variant.content.clone();
        message.selected_variant_id = Some(variant.id.clone());
        message.variants.push(variant);
        let assistant_message = message.clone();
        self.store.save(&session).await?;
        Ok(AssistantTurnResponse { assistant_message })
    }

    async fn abort_request(&self, request_id: &str) -> Result<(), BackendError> {
        self.abort_calls.lock().unwrap().push(request_id.to_string());
        self.aborted.cancel();
        Ok(())
    }
}

/// Wait until `predicate` holds for the published state.
pub async fn wait_for(
    rx: &mut watch::Receiver<TurnState>,
    predicate: impl Fn(&TurnState) -> bool,
) -> TurnState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for state")
}
