// AppConfig Model
// The persisted configuration document

use serde::{Deserialize, Serialize};

use crate::models::FavoriteServer;

/// The configuration document persisted to disk as a single JSON file.
///
/// Missing fields fall back to their defaults so older or hand-edited
/// documents still load; unknown fields are ignored. The whole document is
/// rewritten on every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Stream key from the most recent start request
    #[serde(default)]
    pub last_stream_key: String,
    /// Name of the favorite last selected by the operator, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_favorite_name: Option<String>,
    /// Ordered list of saved destination profiles
    #[serde(default)]
    pub favorites: Vec<FavoriteServer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());

        let config: AppConfig =
            serde_json::from_str(r#"{"last_stream_key": "abc"}"#).unwrap();
        assert_eq!(config.last_stream_key, "abc");
        assert!(config.favorites.is_empty());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config: AppConfig =
            serde_json::from_str(r#"{"last_stream_key": "abc", "theme": "dark"}"#).unwrap();
        assert_eq!(config.last_stream_key, "abc");
    }

    #[test]
    fn test_last_favorite_name_omitted_when_unset() {
        let json = serde_json::to_string(&AppConfig::default()).unwrap();
        assert!(!json.contains("last_favorite_name"));

        let config = AppConfig {
            last_favorite_name: Some("Telegram".to_string()),
            ..AppConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("last_favorite_name"));
    }
}
