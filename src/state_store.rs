//! Server-side session state bag.
//!
//! The voice-agent backend polls this state (asset id, mode, voice flags)
//! rather than relying on message ordering. It used to be a global mutable
//! bag; here it is an explicit [`StateStore`] interface injected into the
//! route handlers, with in-memory and file-backed implementations.
//!
//! Scope stays single-user: concurrent writers last-write-win, which is
//! accepted for the demo but isolated behind the trait so a multi-tenant
//! store can be swapped in.

use crate::error::{AvatarError, Result};
use crate::protocol::SessionMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// The state record shared with the polling agent.
///
/// Field casing is part of the polling contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AvatarStateRecord {
    /// Current avatar asset id, if one has been created.
    pub asset_id: Option<String>,
    /// Conversation mode the agent should be in.
    pub mode: SessionMode,
    /// Signals the agent to adopt the cloned voice.
    pub switch_voice: bool,
    /// Whether the user opted into voice cloning.
    pub voice_cloning_enabled: bool,
    /// Voice id produced by the cloning pipeline, if any.
    pub custom_voice_id: Option<String>,
}

/// Key-value store interface for the session state bag.
pub trait StateStore: Send + Sync {
    /// Read the current record.
    fn get(&self) -> Result<AvatarStateRecord>;
    /// Replace the record.
    fn set(&self, record: &AvatarStateRecord) -> Result<()>;
    /// Reset the record to defaults.
    fn clear(&self) -> Result<()>;

    /// Read-modify-write helper.
    fn update(&self, apply: &mut dyn FnMut(&mut AvatarStateRecord)) -> Result<()> {
        let mut record = self.get()?;
        apply(&mut record);
        self.set(&record)
    }
}

/// Process-memory store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    record: Mutex<AvatarStateRecord>,
}

impl StateStore for MemoryStateStore {
    fn get(&self) -> Result<AvatarStateRecord> {
        self.record
            .lock()
            .map(|g| g.clone())
            .map_err(|e| AvatarError::State(format!("state lock poisoned: {e}")))
    }

    fn set(&self, record: &AvatarStateRecord) -> Result<()> {
        let mut guard = self
            .record
            .lock()
            .map_err(|e| AvatarError::State(format!("state lock poisoned: {e}")))?;
        *guard = record.clone();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.set(&AvatarStateRecord::default())
    }
}

/// JSON-file-backed store.
///
/// A corrupt or missing file degrades to the default record with a warning
/// so the API keeps serving rather than wedging on bad state.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location under the app data directory.
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(crate::app_dirs::state_bag_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn get(&self) -> Result<AvatarStateRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AvatarStateRecord::default());
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(path = %self.path.display(), "corrupt state bag, using defaults: {e}");
                Ok(AvatarStateRecord::default())
            }
        }
    }

    fn set(&self, record: &AvatarStateRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| AvatarError::State(format!("cannot serialize state: {e}")))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write the restart sentinel observed by the out-of-band backend process.
///
/// The file content is the request timestamp in RFC 3339.
pub fn write_restart_sentinel(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, chrono::Utc::now().to_rfc3339())?;
    Ok(())
}
