//! Persisted local UI settings (theme, sidebar state).
//!
//! A small TOML key-value file under the user config dir. No concurrency
//! concerns: reads and writes happen from the UI thread.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSettings {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "default_sidebar_open")]
    pub sidebar_open: bool,
}

fn default_sidebar_open() -> bool {
    true
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            sidebar_open: default_sidebar_open(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Settings file under the platform config dir, e.g.
    /// `~/.config/<app>/settings.toml`.
    pub fn new(app_name: &str) -> Option<Self> {
        let path = dirs::config_dir()?.join(app_name).join("settings.toml");
        Some(Self { path })
    }

    /// Settings file at an explicit path (tests, portable installs).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load settings; a missing file yields defaults.
    pub fn load(&self) -> Result<UiSettings, SyncError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(UiSettings::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, settings: &UiSettings) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, toml::to_string_pretty(settings)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("settings.toml"));
        let settings = store.load().unwrap();
        assert_eq!(settings.theme, Theme::System);
        assert!(settings.sidebar_open);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("nested").join("settings.toml"));
        let settings = UiSettings {
            theme: Theme::Dark,
            sidebar_open: false,
        };
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap(), settings);
    }
}
