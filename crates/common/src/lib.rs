pub mod config;
pub mod logging;

pub use config::{ChannelSettings, Environment};
pub use logging::setup_logging;
