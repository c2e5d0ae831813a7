// TeleStream Services
// Business logic layer

mod config_manager;
mod resolver;
mod stream_session;

pub use config_manager::*;
pub use resolver::*;
pub use stream_session::*;
