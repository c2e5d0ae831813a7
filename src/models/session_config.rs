// SessionConfig Model
// Input for one streaming session

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything needed to start one streaming session: a source (local file or
/// remote page URL) plus the destination endpoint.
///
/// Both source fields are representable so a UI form can hand its input over
/// as-is; the controller's pre-flight validation rejects configs where both
/// or neither are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Path to a local video file, if streaming from disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Page or direct URL of a remote video, if streaming from the network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Ingest base URL of the destination server
    pub destination_url: String,
    /// Secret stream key for the destination
    pub stream_key: String,
}

impl SessionConfig {
    /// Full publish target: destination URL joined with the stream key.
    /// Trailing slashes on the base are dropped first so the join never
    /// produces a double slash.
    pub fn publish_url(&self) -> String {
        let mut base = self.destination_url.trim().to_string();
        while base.ends_with('/') {
            base.pop();
        }
        format!("{}/{}", base, self.stream_key.trim())
    }
}

/// A validated session source, produced by the controller's pre-flight
/// validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// Stream an existing local file
    LocalFile(PathBuf),
    /// Stream a remote video; the URL still needs resolving into a direct
    /// media address before the encoder can consume it
    RemoteUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_url_joins_with_single_slash() {
        let config = SessionConfig {
            destination_url: "rtmps://dc4-1.rtmp.t.me/s".to_string(),
            stream_key: "abc123".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(config.publish_url(), "rtmps://dc4-1.rtmp.t.me/s/abc123");
    }

    #[test]
    fn test_publish_url_trims_trailing_slashes() {
        let config = SessionConfig {
            destination_url: "rtmps://dc4-1.rtmp.t.me/s///".to_string(),
            stream_key: "abc123".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(config.publish_url(), "rtmps://dc4-1.rtmp.t.me/s/abc123");
    }

    #[test]
    fn test_publish_url_trims_whitespace() {
        let config = SessionConfig {
            destination_url: " rtmp://ingest.example/live/ ".to_string(),
            stream_key: " key ".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(config.publish_url(), "rtmp://ingest.example/live/key");
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let config = SessionConfig {
            source_path: Some("/tmp/clip.mp4".to_string()),
            ..SessionConfig::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert!(value.get("sourcePath").is_some());
        assert!(value.get("destinationUrl").is_some());
        assert!(value.get("streamKey").is_some());
        assert!(value.get("sourceUrl").is_none());
    }
}
