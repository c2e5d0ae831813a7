// ConfigManager Service
// Persists the configuration document: favorites plus last-used values

use std::path::PathBuf;
use std::sync::RwLock;

use thiserror::Error;

use crate::models::{AppConfig, FavoriteServer};

/// Errors from favorites CRUD and document persistence
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("A favorite named '{0}' already exists")]
    DuplicateName(String),

    #[error("No favorite named '{0}'")]
    NotFound(String),

    #[error("Favorite {0} must not be empty")]
    EmptyField(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Manages the persisted configuration document.
///
/// The document is read once and cached; every mutation rewrites the file
/// wholesale (write to a temp file, then rename over the document) before
/// the call returns, so a successful mutation survives a crash immediately
/// after it.
pub struct ConfigManager {
    config_path: PathBuf,
    cache: RwLock<Option<AppConfig>>,
}

impl ConfigManager {
    /// Create a manager storing the document at `config_dir/config.json`
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.json");
        Self {
            config_path,
            cache: RwLock::new(None),
        }
    }

    /// Load the document, or defaults when the file is missing or unusable.
    /// Never fails the caller; a missing document and an unparsable one only
    /// differ in what gets logged.
    pub fn load(&self) -> AppConfig {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref config) = *cache {
                return config.clone();
            }
        }

        let config = self.read_from_disk();

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(config.clone());
        }

        config
    }

    fn read_from_disk(&self) -> AppConfig {
        if !self.config_path.exists() {
            log::info!(
                "No config at {}, starting with defaults",
                self.config_path.display()
            );
            return AppConfig::default();
        }

        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "Failed to read {}: {e}, starting with defaults",
                    self.config_path.display()
                );
                return AppConfig::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => {
                log::debug!("Loaded config from {}", self.config_path.display());
                config
            }
            Err(e) => {
                log::warn!(
                    "Failed to parse {}: {e}, starting with defaults",
                    self.config_path.display()
                );
                AppConfig::default()
            }
        }
    }

    /// Persist `config` wholesale and refresh the cache
    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.config_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(config)?;

        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.config_path)?;

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(config.clone());
        }

        log::debug!("Saved config to {}", self.config_path.display());
        Ok(())
    }

    /// Ordered snapshot of the saved favorites
    pub fn favorites(&self) -> Vec<FavoriteServer> {
        self.load().favorites
    }

    /// Append a favorite and persist. Rejects blank fields and names already
    /// taken (case-sensitive).
    pub fn add_favorite(&self, favorite: FavoriteServer) -> Result<(), ConfigError> {
        validate_favorite(&favorite)?;

        let mut config = self.load();
        if config.favorites.iter().any(|f| f.name == favorite.name) {
            return Err(ConfigError::DuplicateName(favorite.name));
        }

        log::info!("Adding favorite '{}'", favorite.name);
        config.favorites.push(favorite);
        self.save(&config)
    }

    /// Replace the favorite currently named `original_name`, keeping its
    /// position in the list. Renaming onto another existing favorite is
    /// rejected; the remembered last favorite follows a rename.
    pub fn update_favorite(
        &self,
        original_name: &str,
        favorite: FavoriteServer,
    ) -> Result<(), ConfigError> {
        validate_favorite(&favorite)?;

        let mut config = self.load();
        let index = config
            .favorites
            .iter()
            .position(|f| f.name == original_name)
            .ok_or_else(|| ConfigError::NotFound(original_name.to_string()))?;

        let renamed = favorite.name != original_name;
        if renamed && config.favorites.iter().any(|f| f.name == favorite.name) {
            return Err(ConfigError::DuplicateName(favorite.name));
        }

        if renamed && config.last_favorite_name.as_deref() == Some(original_name) {
            config.last_favorite_name = Some(favorite.name.clone());
        }

        log::info!("Updating favorite '{original_name}'");
        config.favorites[index] = favorite;
        self.save(&config)
    }

    /// Remove the favorite named `name` and persist. Clears the remembered
    /// last favorite when it pointed at the removed entry.
    pub fn remove_favorite(&self, name: &str) -> Result<(), ConfigError> {
        let mut config = self.load();
        let index = config
            .favorites
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;

        config.favorites.remove(index);
        if config.last_favorite_name.as_deref() == Some(name) {
            config.last_favorite_name = None;
        }

        log::info!("Removed favorite '{name}'");
        self.save(&config)
    }

    /// Look up the (url, key) pair of the favorite named `name`. Pure read,
    /// no side effect.
    pub fn resolve_favorite(&self, name: &str) -> Result<(String, String), ConfigError> {
        let config = self.load();
        config
            .favorites
            .iter()
            .find(|f| f.name == name)
            .map(|f| (f.url.clone(), f.key.clone()))
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))
    }

    /// Stream key from the most recent start request
    pub fn last_stream_key(&self) -> String {
        self.load().last_stream_key
    }

    /// Remember `key` as the last-used stream key and persist
    pub fn set_last_stream_key(&self, key: &str) -> Result<(), ConfigError> {
        let mut config = self.load();
        config.last_stream_key = key.to_string();
        self.save(&config)
    }

    /// Name of the favorite last selected by the operator, if any
    pub fn last_favorite_name(&self) -> Option<String> {
        self.load().last_favorite_name
    }

    /// Remember (or clear) the operator's favorite selection and persist
    pub fn set_last_favorite_name(&self, name: Option<&str>) -> Result<(), ConfigError> {
        let mut config = self.load();
        config.last_favorite_name = name.map(|n| n.to_string());
        self.save(&config)
    }
}

fn validate_favorite(favorite: &FavoriteServer) -> Result<(), ConfigError> {
    if favorite.name.trim().is_empty() {
        return Err(ConfigError::EmptyField("name"));
    }
    if favorite.url.trim().is_empty() {
        return Err(ConfigError::EmptyField("url"));
    }
    if favorite.key.trim().is_empty() {
        return Err(ConfigError::EmptyField("key"));
    }
    Ok(())
}
