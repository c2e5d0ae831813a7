// TeleStream Core
// Stream session control and favorites persistence for the TeleStream TUI

pub mod models;
pub mod services;

pub use models::{
    mask_key, AppConfig, FavoriteServer, SessionConfig, SessionState, StatusReport, StreamSource,
};
pub use services::{
    ConfigError, ConfigManager, ResolveError, SessionController, SessionError, SourceResolver,
    YtDlpResolver,
};
