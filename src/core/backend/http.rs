//! Completion service backed by an OpenAI-compatible `chat/completions`
//! endpoint.
//!
//! The service streams the provider's SSE body, republishes it on the event
//! bus (normalized deltas, or the raw SSE lines when configured for legacy
//! consumers), and persists the finished messages through the session store.
//! Nothing is persisted for a request that fails or is aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memrchr;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    AssistantTurnResponse, BackendError, CompletionService, ContinueTurnRequest,
    RegenerateRequest, SendTurnRequest, SendTurnResponse,
};
use crate::api::{ChatMessage, ChatRequest, StreamOptions};
use crate::core::character::{Character, CharacterCatalog, Persona};
use crate::core::chat_stream::{format_api_error, LegacyChunk, LegacyFormatPolicy, LegacyStreamParser};
use crate::core::ids::now_ms;
use crate::core::message::{Message, Session, Usage, Variant};
use crate::core::store::SessionStore;
use crate::core::stream_bus::{NormalizedEvent, StreamEventBus};

pub struct HttpBackendParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub emit_normalized: bool,
}

#[derive(Debug, Default)]
struct Completion {
    content: String,
    usage: Option<Usage>,
}

pub struct HttpCompletionService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    emit_normalized: bool,
    store: Arc<dyn SessionStore>,
    characters: CharacterCatalog,
    personas: Vec<Persona>,
    bus: StreamEventBus,
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// Removes a request's cancellation token once its stream ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(&self.request_id);
    }
}

fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Split off everything up to and including the last newline.
fn take_complete_lines(pending: &mut Vec<u8>) -> Option<String> {
    let end = memrchr(b'\n', pending)?;
    let lines: Vec<u8> = pending.drain(..=end).collect();
    Some(String::from_utf8_lossy(&lines).into_owned())
}

/// Whatever is left once the body ends, newline-terminated so line-based
/// consumers still see it.
fn take_remainder(pending: &mut Vec<u8>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let mut tail = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    tail.push('\n');
    Some(tail)
}

impl HttpCompletionService {
    pub fn new(
        params: HttpBackendParams,
        store: Arc<dyn SessionStore>,
        characters: CharacterCatalog,
        bus: StreamEventBus,
    ) -> Self {
        let HttpBackendParams {
            client,
            base_url,
            api_key,
            model,
            emit_normalized,
        } = params;
        Self {
            client,
            base_url,
            api_key,
            model,
            emit_normalized,
            store,
            characters,
            personas: Vec::new(),
            bus,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_personas(mut self, personas: Vec<Persona>) -> Self {
        self.personas = personas;
        self
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, request_id: &str) -> (CancellationToken, InFlightGuard) {
        let token = CancellationToken::new();
        self.lock_in_flight()
            .insert(request_id.to_string(), token.clone());
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            request_id: request_id.to_string(),
        };
        (token, guard)
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, BackendError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("Session '{session_id}'")))
    }

    fn load_character(&self, character_id: &str) -> Result<Character, BackendError> {
        self.characters
            .load(character_id)
            .map_err(|err| BackendError::NotFound(err.to_string()))
    }

    fn build_history(
        &self,
        character: &Character,
        persona_id: Option<&str>,
        messages: &[Message],
    ) -> Vec<ChatMessage> {
        let persona = persona_id.and_then(|id| self.personas.iter().find(|p| p.id == id));
        let mut history = vec![ChatMessage {
            role: "system".to_string(),
            content: character.build_system_prompt(persona),
        }];
        history.extend(messages.iter().map(|message| ChatMessage {
            role: message.role.to_api_role().to_string(),
            content: message.display_content().to_string(),
        }));
        history
    }

    async fn complete(
        &self,
        request_id: &str,
        messages: Vec<ChatMessage>,
        stream: bool,
    ) -> Result<Completion, BackendError> {
        let (token, _guard) = self.register(request_id);
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };

        let http_request = self
            .client
            .post(endpoint_url(&self.base_url, "chat/completions"))
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&request);

        debug!(request_id, stream, "sending completion request");
        let response = tokio::select! {
            _ = token.cancelled() => return Err(BackendError::Aborted),
            response = http_request.send() => {
                response.map_err(|err| BackendError::Request(err.to_string()))?
            }
        };

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(BackendError::Api(format_api_error(&error_text)));
        }

        if !stream {
            let body: Value = tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Aborted),
                body = response.json() => {
                    body.map_err(|err| BackendError::Request(err.to_string()))?
                }
            };
            return Ok(Completion {
                content: body
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                usage: body
                    .get("usage")
                    .cloned()
                    .and_then(|usage| serde_json::from_value::<crate::api::ChatUsage>(usage).ok())
                    .map(Usage::from),
            });
        }

        let mut body = response.bytes_stream();
        let mut parser = LegacyStreamParser::new(LegacyFormatPolicy::Lenient);
        let mut raw_pending: Vec<u8> = Vec::new();
        let mut completion = Completion::default();

        'stream: loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Aborted),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk.map_err(|err| BackendError::Request(err.to_string()))?;

            if !self.emit_normalized {
                raw_pending.extend_from_slice(&bytes);
                if let Some(lines) = take_complete_lines(&mut raw_pending) {
                    self.bus.publish_raw(request_id, lines);
                }
            }

            for event in parser.feed_bytes(&bytes) {
                match event {
                    LegacyChunk::Text(text) => {
                        completion.content.push_str(&text);
                        if self.emit_normalized {
                            self.bus
                                .publish_normalized(request_id, NormalizedEvent::Delta { text });
                        }
                    }
                    LegacyChunk::Usage(usage) => completion.usage = Some(usage),
                    LegacyChunk::Error(message) => {
                        if self.emit_normalized {
                            self.bus.publish_normalized(
                                request_id,
                                NormalizedEvent::Error {
                                    message: message.clone(),
                                },
                            );
                        }
                        return Err(BackendError::Api(message));
                    }
                    LegacyChunk::Done => break 'stream,
                }
            }
        }

        if let Some(tail) = take_remainder(&mut raw_pending) {
            self.bus.publish_raw(request_id, tail);
        }

        info!(
            request_id,
            chars = completion.content.len(),
            "completion finished"
        );
        Ok(completion)
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn send_turn(&self, request: SendTurnRequest) -> Result<SendTurnResponse, BackendError> {
        let mut session = self.load_session(&request.session_id).await?;
        let character = self.load_character(&request.character_id)?;

        let mut user_message = Message::user(request.text);
        user_message.attachments = request.attachments;

        let mut history =
            self.build_history(&character, request.persona_id.as_deref(), &session.messages);
        history.push(ChatMessage {
            role: "user".to_string(),
            content: user_message.content.clone(),
        });

        let completion = self
            .complete(&request.request_id, history, request.stream)
            .await?;

        let mut assistant_message = Message::assistant(completion.content);
        assistant_message.usage = completion.usage.clone();
        assistant_message.created_at = now_ms().max(user_message.created_at + 1);

        session.messages.push(user_message.clone());
        session.messages.push(assistant_message.clone());
        session.touch();
        self.store.save(&session).await?;

        Ok(SendTurnResponse {
            user_message,
            assistant_message,
            usage: completion.usage,
        })
    }

    async fn continue_turn(
        &self,
        request: ContinueTurnRequest,
    ) -> Result<AssistantTurnResponse, BackendError> {
        let mut session = self.load_session(&request.session_id).await?;
        let character = self.load_character(&request.character_id)?;
        let history =
            self.build_history(&character, request.persona_id.as_deref(), &session.messages);

        let completion = self
            .complete(&request.request_id, history, request.stream)
            .await?;

        let mut assistant_message = Message::assistant(completion.content);
        assistant_message.usage = completion.usage;
        if let Some(last) = session.messages.last() {
            assistant_message.created_at = assistant_message.created_at.max(last.created_at + 1);
        }
        session.messages.push(assistant_message.clone());
        session.touch();
        self.store.save(&session).await?;

        Ok(AssistantTurnResponse { assistant_message })
    }

    async fn regenerate(
        &self,
        request: RegenerateRequest,
    ) -> Result<AssistantTurnResponse, BackendError> {
        let mut session = self.load_session(&request.session_id).await?;
        let index = session
            .messages
            .iter()
            .position(|message| message.id == request.message_id)
            .ok_or_else(|| BackendError::NotFound(format!("Message '{}'", request.message_id)))?;
        if !session.messages[index].is_assistant() {
            return Err(BackendError::Api(
                "Only assistant messages can be regenerated".to_string(),
            ));
        }
        let character = self.load_character(&session.character_id)?;
        let history = self.build_history(
            &character,
            session.persona_id.as_deref(),
            &session.messages[..index],
        );

        let completion = self
            .complete(&request.request_id, history, request.stream)
            .await?;

        let message = &mut session.messages[index];
        if message.variants.is_empty() {
            // Keep the original generation reachable by swiping back.
            let mut original = Variant::new(message.content.clone());
            original.created_at = message.created_at;
            original.usage = message.usage.clone();
            original.reasoning = message.reasoning.clone();
            message.variants.push(original);
        }
        let mut variant = Variant::new(completion.content);
        variant.usage = completion.usage;
        message.content = variant.content.clone();
        message.usage = variant.usage.clone();
        message.selected_variant_id = Some(variant.id.clone());
        message.variants.push(variant);
        let assistant_message = message.clone();

        session.touch();
        self.store.save(&session).await?;
        Ok(AssistantTurnResponse { assistant_message })
    }

    async fn abort_request(&self, request_id: &str) -> Result<(), BackendError> {
        if let Some(token) = self.lock_in_flight().remove(request_id) {
            debug!(request_id, "cancelling in-flight completion");
            token.cancel();
        }
        Ok(())
    }
}
