// TeleStream Models
// Plain data types shared across the service layer

mod app_config;
mod favorite;
mod session;
mod session_config;

pub use app_config::*;
pub use favorite::*;
pub use session::*;
pub use session_config::*;
