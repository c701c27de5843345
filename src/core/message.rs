use serde::{Deserialize, Serialize};

use crate::core::ids::{new_id, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Scene,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Scene => "scene",
        }
    }

    /// Role used when replaying this message to a chat-completions API.
    /// Scenes are spoken by the character, so they travel as assistant turns.
    pub fn to_api_role(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant | Role::Scene => "assistant",
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "scene" => Ok(Role::Scene),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub mime_type: String,
    /// Opaque payload (typically a data URL or base64 body); never inspected here.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// One alternate generation for a message slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Variant {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            content: content.into(),
            created_at: now_ms(),
            usage: None,
            attachments: Vec::new(),
            reasoning: None,
        }
    }
}

/// A message confirmed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variant_id: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            created_at: now_ms(),
            variants: Vec::new(),
            selected_variant_id: None,
            is_pinned: false,
            attachments: Vec::new(),
            reasoning: None,
            usage: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn scene(content: impl Into<String>) -> Self {
        Self::new(Role::Scene, content)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn is_scene(&self) -> bool {
        self.role == Role::Scene
    }

    /// The variant currently shown for this message: the explicitly selected
    /// one if it still exists, otherwise the most recent.
    pub fn current_variant(&self) -> Option<&Variant> {
        self.current_variant_index().map(|index| &self.variants[index])
    }

    pub fn current_variant_index(&self) -> Option<usize> {
        if self.variants.is_empty() {
            return None;
        }
        self.selected_variant_id
            .as_deref()
            .and_then(|selected| self.variants.iter().position(|v| v.id == selected))
            .or(Some(self.variants.len() - 1))
    }

    /// Text to display: the current variant's body, or the message's own
    /// content when it carries no variants.
    pub fn display_content(&self) -> &str {
        self.current_variant()
            .map(|variant| variant.content.as_str())
            .unwrap_or(&self.content)
    }
}

/// Identifier of a not-yet-persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaceholderId(String);

impl PlaceholderId {
    pub fn generate(role: Role) -> Self {
        Self(format!("pending-{}-{}", role.as_str(), new_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transient message shown between turn start and reconciliation.
/// It has no `Serialize` impl so it cannot reach the store by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub id: PlaceholderId,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    pub attachments: Vec<Attachment>,
}

impl Placeholder {
    pub fn new(role: Role, content: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: PlaceholderId::generate(role),
            role,
            content: content.into(),
            created_at,
            attachments: Vec::new(),
        }
    }

    /// Turn this placeholder into a durable message under a fresh id.
    pub fn into_message(self, id: String) -> Message {
        Message {
            id,
            role: self.role,
            content: self.content,
            created_at: self.created_at,
            variants: Vec::new(),
            selected_variant_id: None,
            is_pinned: false,
            attachments: self.attachments,
            reasoning: None,
            usage: None,
        }
    }
}

/// Addresses one transcript slot regardless of whether it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Persisted(String),
    Placeholder(PlaceholderId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Persisted(Message),
    Placeholder(Placeholder),
}

impl TranscriptEntry {
    pub fn id(&self) -> EntryId {
        match self {
            TranscriptEntry::Persisted(message) => EntryId::Persisted(message.id.clone()),
            TranscriptEntry::Placeholder(placeholder) => {
                EntryId::Placeholder(placeholder.id.clone())
            }
        }
    }

    pub fn matches(&self, id: &EntryId) -> bool {
        match (self, id) {
            (TranscriptEntry::Persisted(message), EntryId::Persisted(target)) => {
                message.id == *target
            }
            (TranscriptEntry::Placeholder(placeholder), EntryId::Placeholder(target)) => {
                placeholder.id == *target
            }
            _ => false,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            TranscriptEntry::Persisted(message) => message.role,
            TranscriptEntry::Placeholder(placeholder) => placeholder.role,
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            TranscriptEntry::Persisted(message) => message.created_at,
            TranscriptEntry::Placeholder(placeholder) => placeholder.created_at,
        }
    }

    pub fn display_content(&self) -> &str {
        match self {
            TranscriptEntry::Persisted(message) => message.display_content(),
            TranscriptEntry::Placeholder(placeholder) => &placeholder.content,
        }
    }

    pub fn as_persisted(&self) -> Option<&Message> {
        match self {
            TranscriptEntry::Persisted(message) => Some(message),
            TranscriptEntry::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, TranscriptEntry::Placeholder(_))
    }
}

/// The durable conversation record. Read and written wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub character_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_scene_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(character_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            character_id: character_id.into(),
            title: title.into(),
            persona_id: None,
            selected_scene_id: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Stable sort by creation time; equal timestamps keep their relative order.
    pub fn sort_messages(&mut self) {
        self.messages.sort_by_key(|message| message.created_at);
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}
