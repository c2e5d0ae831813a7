// FavoriteServer Model
// A named ingest endpoint saved for quick reuse

use serde::{Deserialize, Serialize};

/// A saved destination profile: a display name plus the (url, key) pair
/// needed to publish to an RTMP/RTMPS ingest endpoint.
///
/// Names are unique within the store (case-sensitive). The key is stored in
/// plaintext on disk but must never be shown unmasked in the UI; see
/// [`mask_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteServer {
    /// Display label, unique within the store
    pub name: String,
    /// Ingest base URL, e.g. "rtmps://dc4-1.rtmp.t.me/s"
    pub url: String,
    /// Secret stream key appended to the URL when publishing
    pub key: String,
}

/// Shorten a stream key for display. Keys longer than ten characters keep
/// their first ten followed by "..."; shorter keys pass through unchanged.
pub fn mask_key(key: &str) -> String {
    if key.chars().count() > 10 {
        let prefix: String = key.chars().take(10).collect();
        format!("{prefix}...")
    } else {
        key.to_string()
    }
}
