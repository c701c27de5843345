//! Session persistence.
//!
//! [`SessionStore`] is the only durability boundary: nothing a turn produces
//! is durable until `save` resolves. Two implementations ship with the crate:
//! [`FileSessionStore`] (one JSON document per session, written atomically)
//! and [`MemorySessionStore`] (process-local, with failure injection for
//! exercising recovery paths).

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::core::ids::is_safe_id;
use crate::core::message::Session;

/// Errors that can occur while reading or writing sessions.
#[derive(Debug)]
pub enum StoreError {
    /// No session exists with the given id.
    NotFound(String),
    /// The id cannot be mapped onto the store's namespace.
    InvalidId(String),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    /// Failure reported by a store that is not backed by the filesystem.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "Session '{id}' not found"),
            StoreError::InvalidId(id) => write!(f, "Invalid session id: {id}"),
            StoreError::Io(err) => write!(f, "Session store I/O error: {err}"),
            StoreError::Serialization(err) => write!(f, "Session serialization error: {err}"),
            StoreError::Unavailable(msg) => write!(f, "Session store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            StoreError::Serialization(err) => Some(err),
            StoreError::NotFound(_) | StoreError::InvalidId(_) | StoreError::Unavailable(_) => {
                None
            }
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    async fn create(
        &self,
        character_id: &str,
        title: &str,
        persona_id: Option<&str>,
        starting_scene_id: Option<&str>,
    ) -> Result<Session, StoreError>;

    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}

fn new_session(
    character_id: &str,
    title: &str,
    persona_id: Option<&str>,
    starting_scene_id: Option<&str>,
) -> Session {
    let mut session = Session::new(character_id, title);
    session.persona_id = persona_id.map(str::to_owned);
    session.selected_scene_id = starting_scene_id.map(str::to_owned);
    session
}

pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn write_atomically(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path_for(&session.id)?;
        fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_vec_pretty(session)?;

        // Write beside the target so the rename stays on one filesystem.
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&contents)?;
        temp.flush()?;
        temp.persist(&path).map_err(|err| StoreError::Io(err.error))?;
        debug!(session_id = %session.id, path = %path.display(), "session saved");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.path_for(id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.write_atomically(session)
    }

    async fn create(
        &self,
        character_id: &str,
        title: &str,
        persona_id: Option<&str>,
        starting_scene_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let session = new_session(character_id, title, persona_id, starting_scene_id);
        self.write_atomically(&session)?;
        Ok(session)
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
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

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    fail_gets: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let store = Self::new();
        {
            let mut map = store.lock();
            for session in sessions {
                map.insert(session.id.clone(), session);
            }
        }
        store
    }

    /// Make subsequent `get` calls fail until reset.
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `save`/`create` calls fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Synchronous peek for tests and diagnostics.
    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_saves(&self) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes are disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads are disabled".into()));
        }
        Ok(self.lock().get(id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.check_saves()?;
        self.lock().insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn create(
        &self,
        character_id: &str,
        title: &str,
        persona_id: Option<&str>,
        starting_scene_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        self.check_saves()?;
        let session = new_session(character_id, title, persona_id, starting_scene_id);
        self.lock().insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
