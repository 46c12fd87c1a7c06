//! Centralized application directory paths for Visage.
//!
//! Provides a single source of truth for the filesystem paths used by the
//! session engine. Uses the [`dirs`] crate for platform-appropriate directory
//! resolution.
//!
//! # Environment Overrides
//!
//! All paths can be overridden for testing or custom deployments:
//! - `VISAGE_DATA_DIR` — overrides [`data_dir`]
//! - `VISAGE_CONFIG_DIR` — overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Used for persistent session data: the cached avatar asset id, the
/// server-side state bag, and the restart sentinel.
///
/// Resolves to `dirs::data_dir()/visage/` by default. Override with the
/// `VISAGE_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VISAGE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("visage"))
        .unwrap_or_else(|| PathBuf::from("/tmp/visage-data"))
}

/// Application config directory.
///
/// Used for `config.toml`.
///
/// Resolves to `dirs::config_dir()/visage/` by default. Override with the
/// `VISAGE_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VISAGE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("visage"))
        .unwrap_or_else(|| PathBuf::from("/tmp/visage-config"))
}

/// Path of the durable avatar asset id cache (`data_dir()/avatar_asset.json`).
#[must_use]
pub fn asset_cache_path() -> PathBuf {
    data_dir().join("avatar_asset.json")
}

/// Path of the file-backed state bag (`data_dir()/avatar_state.json`).
#[must_use]
pub fn state_bag_path() -> PathBuf {
    data_dir().join("avatar_state.json")
}

/// Path of the restart sentinel (`data_dir()/restart_requested`).
#[must_use]
pub fn restart_sentinel_path() -> PathBuf {
    data_dir().join("restart_requested")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_honors_override() {
        // Serialize env mutation against other tests in this module.
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("VISAGE_DATA_DIR", "/tmp/visage-test-data");
        }
        assert_eq!(data_dir(), PathBuf::from("/tmp/visage-test-data"));
        unsafe {
            std::env::remove_var("VISAGE_DATA_DIR");
        }
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        let root = data_dir();
        assert!(asset_cache_path().starts_with(&root));
        assert!(state_bag_path().starts_with(&root));
        assert!(restart_sentinel_path().starts_with(&root));
    }

    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
