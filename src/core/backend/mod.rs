//! The completion service contract.
//!
//! The controller only knows this trait. Implementations persist the messages
//! they produce and publish streamed deltas on the [`StreamEventBus`] under the
//! request id they were given.
//!
//! [`StreamEventBus`]: crate::core::stream_bus::StreamEventBus

pub mod http;

use async_trait::async_trait;

use crate::core::message::{Attachment, Message, Usage};
use crate::core::store::StoreError;

#[derive(Debug, Clone)]
pub struct SendTurnRequest {
    pub session_id: String,
    pub character_id: String,
    pub text: String,
    pub persona_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub stream: bool,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct SendTurnResponse {
    pub user_message: Message,
    pub assistant_message: Message,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct ContinueTurnRequest {
    pub session_id: String,
    pub character_id: String,
    pub persona_id: Option<String>,
    pub stream: bool,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct RegenerateRequest {
    pub session_id: String,
    pub message_id: String,
    pub stream: bool,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct AssistantTurnResponse {
    pub assistant_message: Message,
}

/// Errors surfaced by a completion service.
#[derive(Debug)]
pub enum BackendError {
    /// The request could not be sent or the connection failed mid-stream.
    Request(String),
    /// The provider answered with an error.
    Api(String),
    /// The request was cancelled through `abort_request`.
    Aborted,
    /// The backend's own persistence failed.
    Store(StoreError),
    /// The request referenced something the backend cannot find.
    NotFound(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Request(msg) => write!(f, "Request failed: {msg}"),
            BackendError::Api(msg) => write!(f, "{msg}"),
            BackendError::Aborted => write!(f, "Request aborted by user"),
            BackendError::Store(err) => write!(f, "{err}"),
            BackendError::NotFound(what) => write!(f, "{what} not found"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        BackendError::Store(err)
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn send_turn(&self, request: SendTurnRequest) -> Result<SendTurnResponse, BackendError>;

    async fn continue_turn(
        &self,
        request: ContinueTurnRequest,
    ) -> Result<AssistantTurnResponse, BackendError>;

    async fn regenerate(
        &self,
        request: RegenerateRequest,
    ) -> Result<AssistantTurnResponse, BackendError>;

    async fn abort_request(&self, request_id: &str) -> Result<(), BackendError>;
}
