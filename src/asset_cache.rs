//! Durable cache of the current avatar asset id.
//!
//! A single string key persisted under the app data directory so a session
//! can resume with its existing avatar after a reload. Cleared on setup
//! reset.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct CachedAsset {
    asset_id: String,
}

/// File-backed single-key cache.
#[derive(Debug, Clone)]
pub struct AssetCache {
    path: PathBuf,
}

impl AssetCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache at the default location under the app data directory.
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(crate::app_dirs::asset_cache_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached asset id.
    ///
    /// A missing file is an empty cache; a corrupt file degrades to empty
    /// with a warning rather than blocking session start.
    pub fn load(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CachedAsset>(&content) {
            Ok(cached) if !cached.asset_id.trim().is_empty() => Some(cached.asset_id),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.path.display(), "corrupt asset cache, ignoring: {e}");
                None
            }
        }
    }

    /// Persist the asset id, creating parent directories as needed.
    pub fn store(&self, asset_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&CachedAsset {
            asset_id: asset_id.to_owned(),
        })
        .map_err(|e| crate::error::AvatarError::State(format!("cannot serialize cache: {e}")))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Delete the cached asset id. Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn temp_cache() -> (AssetCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path().join("avatar_asset.json"));
        (cache, dir)
    }

    #[test]
    fn empty_cache_loads_none() {
        let (cache, _dir) = temp_cache();
        assert_eq!(cache.load(), None);
    }

    #[test]
    fn store_then_load_round_trips() {
        let (cache, _dir) = temp_cache();
        cache.store("asset-42").unwrap();
        assert_eq!(cache.load(), Some("asset-42".to_owned()));
    }

    #[test]
    fn clear_empties_the_cache() {
        let (cache, _dir) = temp_cache();
        cache.store("asset-42").unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.load(), None);
        // Clearing twice is fine.
        cache.clear().unwrap();
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let (cache, _dir) = temp_cache();
        std::fs::write(cache.path(), "{ not json").unwrap();
        assert_eq!(cache.load(), None);
    }

    #[test]
    fn blank_asset_id_loads_none() {
        let (cache, _dir) = temp_cache();
        std::fs::write(cache.path(), r#"{"asset_id": "  "}"#).unwrap();
        assert_eq!(cache.load(), None);
    }
}
