use crate::cache::TtlCache;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reply_stream::{FinalizedTurn, MessageStore};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Stores each conversation as a JSON array of finished turns
pub struct FileMessageStore {
    root_dir: PathBuf,
    history: Mutex<TtlCache<String, Vec<FinalizedTurn>>>,
}

pub fn default_root_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reply-stream")
}

impl FileMessageStore {
    pub fn new(root_dir: impl Into<PathBuf>, history_ttl: Duration) -> Self {
        let root_dir = root_dir.into();
        info!("Storing conversations in: {}", root_dir.display());
        Self {
            root_dir,
            history: Mutex::new(TtlCache::new(history_ttl)),
        }
    }

    fn cache(&self) -> MutexGuard<'_, TtlCache<String, Vec<FinalizedTurn>>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_conversations_dir(&self) -> Result<PathBuf> {
        let dir = self.root_dir.join("conversations");
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(dir)
    }

    fn conversation_file_path(&self, conversation_id: &str) -> Result<PathBuf> {
        let dir = self.ensure_conversations_dir()?;
        Ok(dir.join(format!("{}.json", file_stem(conversation_id))))
    }

    /// Finished turns of a conversation, oldest first
    pub fn load_history(&self, conversation_id: &str) -> Result<Vec<FinalizedTurn>> {
        let key = conversation_id.to_string();
        if let Some(turns) = self.cache().get(&key) {
            debug!("History for {} served from cache", conversation_id);
            return Ok(turns.clone());
        }

        let path = self.conversation_file_path(conversation_id)?;
        let turns = read_turns(&path)?;

        let mut cache = self.cache();
        let purged = cache.purge_expired();
        if !purged.is_empty() {
            debug!("Purged expired histories: {:?}", purged);
        }
        cache.insert(key, turns.clone());
        Ok(turns)
    }

    fn append_turn(&self, turn: &FinalizedTurn) -> Result<()> {
        let path = self.conversation_file_path(&turn.conversation_id)?;
        let mut turns = read_turns(&path)?;
        turns.push(turn.clone());

        debug!("Saving {} turns to {}", turns.len(), path.display());
        let json = serde_json::to_string_pretty(&turns)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        self.cache().invalidate(&turn.conversation_id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn save_turn(&self, turn: &FinalizedTurn) -> Result<()> {
        self.append_turn(turn)
    }
}

fn read_turns(path: &Path) -> Result<Vec<FinalizedTurn>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))
}

// Conversation ids come from the command line, keep them out of other directories
fn file_stem(conversation_id: &str) -> String {
    conversation_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
