// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration persistence (save/load) and per-node EQ preset storage.

use crate::config::AppConfig;
use directories::ProjectDirs;
use eqsplice_dsp::EqPreset;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where EQ presets are kept, keyed by target node name.
pub trait PresetStore: Send + Sync {
    fn load(&self, node_name: &str) -> Result<Option<EqPreset>, ConfigError>;

    fn save(&self, node_name: &str, preset: &EqPreset) -> Result<(), ConfigError>;

    fn remove(&self, node_name: &str) -> Result<(), ConfigError>;

    /// Names of all nodes with a stored preset.
    fn node_names(&self) -> Result<Vec<String>, ConfigError>;
}

/// Manages configuration file persistence.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager, initializing directories.
    pub fn new() -> Result<Self, ConfigError> {
        let project_dirs =
            ProjectDirs::from("", "", "eqsplice").ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(project_dirs.config_dir())
    }

    /// Use an explicit directory instead of the XDG location.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir)?;
        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the path to the main config file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Get the path to the per-node EQ preset file.
    pub fn presets_path(&self) -> PathBuf {
        self.config_dir.join("eq_presets.json")
    }

    /// Load the service config; a missing file yields defaults.
    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let path = self.config_path();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(AppConfig::from_toml(&content)?)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Save the service config.
    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = config.to_toml()?;
        write_replace(&self.config_path(), content.as_bytes())?;
        Ok(())
    }

    /// Open the preset file for this config directory.
    pub fn preset_store(&self) -> JsonPresetStore {
        JsonPresetStore::new(self.presets_path())
    }
}

/// Write through a temporary sibling so readers never see a partial file.
fn write_replace(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

/// JSON file `{ "<node name>": <EqPreset>, ... }`, cached after first read.
pub struct JsonPresetStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, EqPreset>>>,
}

impl JsonPresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<BTreeMap<String, EqPreset>, ConfigError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let presets: BTreeMap<String, EqPreset> = serde_json::from_str(&content)?;
        debug!("Loaded {} EQ preset(s) from {:?}", presets.len(), self.path);
        Ok(presets)
    }

    fn with_presets<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, EqPreset>) -> R,
    ) -> Result<R, ConfigError> {
        let mut cache = self.cache.lock();
        if cache.is_none() {
            *cache = Some(self.read_file()?);
        }
        match cache.as_mut() {
            Some(presets) => Ok(f(presets)),
            None => Ok(f(&mut BTreeMap::new())),
        }
    }

    /// Apply `edit` to a copy of the presets and persist it. The cache only
    /// takes the new map once it is on disk. `edit` returns false for a
    /// no-op, which skips the write.
    fn commit(
        &self,
        edit: impl FnOnce(&mut BTreeMap<String, EqPreset>) -> bool,
    ) -> Result<(), ConfigError> {
        let mut cache = self.cache.lock();
        let mut presets = match cache.as_ref() {
            Some(presets) => presets.clone(),
            None => self.read_file()?,
        };
        if edit(&mut presets) {
            self.write_file(&presets)?;
        }
        *cache = Some(presets);
        Ok(())
    }

    fn write_file(&self, presets: &BTreeMap<String, EqPreset>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(presets)?;
        write_replace(&self.path, content.as_bytes())?;
        Ok(())
    }
}

impl PresetStore for JsonPresetStore {
    fn load(&self, node_name: &str) -> Result<Option<EqPreset>, ConfigError> {
        self.with_presets(|presets| presets.get(node_name).cloned())
    }

    fn save(&self, node_name: &str, preset: &EqPreset) -> Result<(), ConfigError> {
        self.commit(|presets| {
            presets.insert(node_name.to_string(), preset.clone());
            true
        })
        .inspect_err(|e| {
            warn!("Failed to persist EQ preset for '{}': {}", node_name, e);
        })
    }

    fn remove(&self, node_name: &str) -> Result<(), ConfigError> {
        self.commit(|presets| presets.remove(node_name).is_some())
    }

    fn node_names(&self) -> Result<Vec<String>, ConfigError> {
        self.with_presets(|presets| presets.keys().cloned().collect())
    }
}

/// In-memory preset store for embedding and tests.
#[derive(Default)]
pub struct MemoryPresetStore {
    presets: Mutex<BTreeMap<String, EqPreset>>,
}

impl MemoryPresetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresetStore for MemoryPresetStore {
    fn load(&self, node_name: &str) -> Result<Option<EqPreset>, ConfigError> {
        Ok(self.presets.lock().get(node_name).cloned())
    }

    fn save(&self, node_name: &str, preset: &EqPreset) -> Result<(), ConfigError> {
        self.presets
            .lock()
            .insert(node_name.to_string(), preset.clone());
        Ok(())
    }

    fn remove(&self, node_name: &str) -> Result<(), ConfigError> {
        self.presets.lock().remove(node_name);
        Ok(())
    }

    fn node_names(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.presets.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        assert_eq!(manager.load_config().unwrap(), AppConfig::default());
    }

    #[test]
    fn test_config_save_load() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("nested")).unwrap();
        let mut config = AppConfig::default();
        config.graph.debounce_ms = 75;
        manager.save_config(&config).unwrap();
        assert_eq!(manager.load_config().unwrap().graph.debounce_ms, 75);
        assert!(!manager.config_path().with_extension("tmp").exists());
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        fs::write(manager.config_path(), "[graph]\ndebounce_ms = \"soon\"").unwrap();
        assert!(matches!(manager.load_config(), Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();

        let store = manager.preset_store();
        assert!(store.load("alsa_output.usb").unwrap().is_none());
        store
            .save("alsa_output.usb", &EqPreset::bass_boost())
            .unwrap();
        store.save("mic", &EqPreset::flat()).unwrap();

        let reopened = manager.preset_store();
        assert_eq!(
            reopened.load("alsa_output.usb").unwrap(),
            Some(EqPreset::bass_boost())
        );
        assert_eq!(reopened.node_names().unwrap(), vec!["alsa_output.usb", "mic"]);

        reopened.remove("mic").unwrap();
        assert_eq!(manager.preset_store().node_names().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_preset_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonPresetStore::new(dir.path().join("eq_presets.json"));
        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.load("x"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_failed_write_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = JsonPresetStore::new(dir.path().join("eq_presets.json"));
        store.save("sink", &EqPreset::flat()).unwrap();

        // A directory in place of the temp file makes every write fail.
        fs::create_dir(dir.path().join("eq_presets.tmp")).unwrap();

        assert!(store.save("mic", &EqPreset::bass_boost()).is_err());
        assert!(store.load("mic").unwrap().is_none());

        assert!(store.remove("sink").is_err());
        assert_eq!(store.load("sink").unwrap(), Some(EqPreset::flat()));
        assert_eq!(store.node_names().unwrap(), vec!["sink"]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryPresetStore::new();
        store.save("sink", &EqPreset::loudness()).unwrap();
        assert_eq!(store.load("sink").unwrap().map(|p| p.name), Some("Loudness".into()));
        store.remove("sink").unwrap();
        assert!(store.load("sink").unwrap().is_none());
    }
}
