use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for settings operations
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),

    #[error("Setting not found: {0}")]
    SettingNotFound(String),

    #[error("Invalid settings: {0}")]
    Invalid(#[from] autocrawl_core::Error),
}

/// Result type for settings operations
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Settings format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Toml,
    Json,
}

impl SettingsFormat {
    /// Detect the format from a file path
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|ext| {
            match ext.to_string_lossy().to_lowercase().as_str() {
                "toml" => Some(Self::Toml),
                "json" => Some(Self::Json),
                _ => None,
            }
        })
    }
}

/// Flat key/value settings, usually loaded from a file.
///
/// Keys are upper case by convention (`MAX_CONCURRENCY`, `STORAGE_DIR`);
/// see [`crate::config_adapters`] for the keys that are understood.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Raw settings as key-value pairs
    #[serde(flatten)]
    pub raw: HashMap<String, serde_json::Value>,

    /// Path to the settings file, if loaded from a file
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a `.toml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = SettingsFormat::from_path(path)
            .ok_or_else(|| SettingsError::UnknownFormat(path.to_string_lossy().to_string()))?;

        let contents = std::fs::read_to_string(path)?;
        let mut settings = match format {
            SettingsFormat::Toml => Self::from_toml(&contents)?,
            SettingsFormat::Json => Self::from_json(&contents)?,
        };

        settings.file_path = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: HashMap<String, serde_json::Value> =
            toml::from_str(contents).map_err(|e| SettingsError::TomlParse(e.to_string()))?;
        Ok(Self {
            raw,
            file_path: None,
        })
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(contents)?;
        Ok(Self {
            raw,
            file_path: None,
        })
    }

    /// Get a setting as a specific type
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T> {
        self.raw
            .get(key)
            .ok_or_else(|| SettingsError::SettingNotFound(key.to_string()))
            .and_then(|value| {
                serde_json::from_value(value.clone()).map_err(SettingsError::JsonParse)
            })
    }

    /// Get a setting, falling back to `default` when it is missing or malformed
    pub fn get_or<T: for<'de> Deserialize<'de>>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Get an optional setting; a present but malformed value is an error
    pub fn get_opt<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.raw.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.raw.insert(key.to_string(), value);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.raw.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.raw.remove(key)
    }

    pub fn all(&self) -> &HashMap<String, serde_json::Value> {
        &self.raw
    }

    /// Save settings to a file, in the format its extension names
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = SettingsFormat::from_path(path)
            .ok_or_else(|| SettingsError::UnknownFormat(path.to_string_lossy().to_string()))?;

        let contents = match format {
            SettingsFormat::Toml => {
                toml::to_string(&self.raw).map_err(|e| SettingsError::TomlParse(e.to_string()))?
            }
            SettingsFormat::Json => serde_json::to_string_pretty(&self.raw)?,
        };

        std::fs::write(path, contents)?;
        Ok(())
    }
}
