//! Conversation persistence.
//!
//! The committed conversation is written as one JSON document,
//! `{"messages": [...], "systemPrompt": "..."}`, after every mutation and
//! read back on start. Writes go to a sibling temp file first and are then
//! renamed over the session file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ClientConfig;
use crate::error::StoreError;
use crate::types::ConversationState;

/// File name of the persisted session.
pub const SESSION_FILE: &str = "chat_session_v2.json";

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// JSON file holding the persisted conversation.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    /// Store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `storage_path` if configured, otherwise
    /// `<data dir>/streamchat/chat_session_v2.json`.
    ///
    /// # Errors
    ///
    /// Returns `NoStorageDir` if no path is configured and the platform has
    /// no data directory.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        if let Some(path) = &config.storage_path {
            return Ok(Self::new(path));
        }
        let dir = dirs::data_dir().ok_or(StoreError::NoStorageDir)?;
        Ok(Self::new(dir.join("streamchat").join(SESSION_FILE)))
    }

    /// Path of the session file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored conversation. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<ConversationState>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: ConversationState = serde_json::from_str(&data)?;
        tracing::debug!(path = %self.path.display(), turns = state.turns.len(), "Loaded session");
        Ok(Some(state))
    }

    /// Write the conversation, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, state: &ConversationState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        tracing::trace!(path = %self.path.display(), turns = state.turns.len(), "Saved session");
        Ok(())
    }

    /// Load, falling back to a seeded conversation when the file is
    /// missing, unreadable or empty. Failures are logged, never returned.
    #[must_use]
    pub fn load_or_seed(&self, default_prompt: &str) -> ConversationState {
        match self.load() {
            Ok(Some(state)) if !state.turns.is_empty() => state,
            Ok(Some(state)) => ConversationState::seeded(if state.system_prompt.is_empty() {
                default_prompt.to_string()
            } else {
                state.system_prompt
            }),
            Ok(None) => ConversationState::seeded(default_prompt),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to load session, starting fresh");
                ConversationState::seeded(default_prompt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationTurn, SEED_GREETING};

    #[test]
    fn missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join(SESSION_FILE));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_restores_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("nested").join(SESSION_FILE));

        let mut state = ConversationState::seeded("be terse");
        state.turns.push(ConversationTurn::user("2+2?"));
        state.turns.push(ConversationTurn::assistant("4"));
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_falls_back_to_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        fs::write(&path, "{ not json").unwrap();
        let store = ConversationStore::new(&path);

        assert!(matches!(store.load(), Err(StoreError::Json(_))));
        let state = store.load_or_seed("default");
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].content, SEED_GREETING);
        assert_eq!(state.system_prompt, "default");
    }

    #[test]
    fn empty_history_is_reseeded_keeping_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join(SESSION_FILE));
        store
            .save(&ConversationState { turns: Vec::new(), system_prompt: "custom".into() })
            .unwrap();

        let state = store.load_or_seed("default");
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.system_prompt, "custom");
    }

    #[test]
    fn reads_session_written_by_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        fs::write(
            &path,
            r#"{"messages":[{"id":"6f1c1e4e-8d0a-4b8e-9a51-1f0a2f3c4d5e","role":"user","content":"hi"}],"systemPrompt":"sys"}"#,
        )
        .unwrap();

        let state = ConversationStore::new(&path).load().unwrap().unwrap();
        assert_eq!(state.turns[0].content, "hi");
        assert_eq!(state.system_prompt, "sys");
    }

    #[test]
    fn configured_path_wins() {
        let mut config = ClientConfig::default();
        config.storage_path = Some(PathBuf::from("/tmp/x/session.json"));
        let store = ConversationStore::from_config(&config).unwrap();
        assert_eq!(store.path(), Path::new("/tmp/x/session.json"));
    }
}
