//! Characters, their predefined starting scenes, and user personas.
//!
//! Characters are owned by an external editor; this crate only reads them.
//! [`CharacterCatalog`] loads them from `<data_dir>/characters/<id>.json`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::ids::is_safe_id;
use crate::core::message::{Message, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneVariant {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub created_at: i64,
}

/// A predefined roleplay starting point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<SceneVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variant_id: Option<String>,
}

impl Scene {
    /// Same resolution rule as message variants: explicit selection if valid,
    /// otherwise the last variant, otherwise the scene's own content.
    pub fn display_content(&self) -> &str {
        if self.variants.is_empty() {
            return &self.content;
        }
        self.selected_variant_id
            .as_deref()
            .and_then(|selected| self.variants.iter().find(|v| v.id == selected))
            .or_else(|| self.variants.last())
            .map(|variant| variant.content.as_str())
            .unwrap_or(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_scene_id: Option<String>,
}

impl Character {
    pub fn scene(&self, id: &str) -> Option<&Scene> {
        self.scenes.iter().find(|scene| scene.id == id)
    }

    pub fn scene_index(&self, id: &str) -> Option<usize> {
        self.scenes.iter().position(|scene| scene.id == id)
    }

    /// The scene a new session opens with, if the character defines any.
    pub fn starting_scene(&self, requested: Option<&str>) -> Option<&Scene> {
        requested
            .and_then(|id| self.scene(id))
            .or_else(|| self.default_scene_id.as_deref().and_then(|id| self.scene(id)))
            .or_else(|| self.scenes.first())
    }

    /// Build the system prompt sent ahead of the history.
    pub fn build_system_prompt(&self, persona: Option<&Persona>) -> String {
        let mut prompt = String::new();
        if let Some(system_prompt) = &self.system_prompt {
            prompt.push_str(system_prompt);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!("Character: {}\n", self.name));
        if !self.description.is_empty() {
            prompt.push_str(&format!("Description: {}\n", self.description));
        }
        if let Some(persona) = persona {
            prompt.push_str(&format!("You are talking with {}.\n", persona.display_name));
        }
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub display_name: String,
}

/// Append the character's starting scene to a fresh session and point the
/// session's scene selector at it.
pub fn seed_starting_scene(session: &mut Session, character: &Character, requested: Option<&str>) {
    if let Some(scene) = character.starting_scene(requested) {
        session.selected_scene_id = Some(scene.id.clone());
        session.messages.push(Message::scene(scene.display_content()));
    }
}

/// Errors that can occur while loading characters.
#[derive(Debug)]
pub enum CharacterError {
    /// No character file exists for the id.
    NotFound(String),
    /// The id contains characters that are not allowed in file names.
    InvalidId(String),
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for CharacterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CharacterError::NotFound(id) => write!(f, "Character '{id}' not found"),
            CharacterError::InvalidId(id) => write!(f, "Invalid character id: {id}"),
            CharacterError::Io(err) => write!(f, "I/O error: {err}"),
            CharacterError::Parse(err) => write!(f, "Invalid character file: {err}"),
        }
    }
}

impl std::error::Error for CharacterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CharacterError::Io(err) => Some(err),
            CharacterError::Parse(err) => Some(err),
            CharacterError::NotFound(_) | CharacterError::InvalidId(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CharacterCatalog {
    dir: PathBuf,
}

impl CharacterCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, id: &str) -> Result<Character, CharacterError> {
        if !is_safe_id(id) {
            return Err(CharacterError::InvalidId(id.to_string()));
        }
        let path = self.dir.join(format!("{id}.json"));
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CharacterError::NotFound(id.to_string()))
            }
            Err(err) => return Err(CharacterError::Io(err)),
        };
        serde_json::from_str(&contents).map_err(CharacterError::Parse)
    }

    /// Ids of every character file in the catalog, sorted.
    pub fn list_ids(&self) -> Result<Vec<String>, CharacterError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CharacterError::Io(err)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(CharacterError::Io)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
