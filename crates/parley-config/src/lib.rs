pub mod loader;
pub mod schema;

pub use loader::{global_config_path, ConfigLoader};
pub use schema::{
    AuthConfig, ClientSettings, Config, ConfigError, LogConfig, NotificationConfig,
    ReconnectConfig, ReconnectPolicy, ResyncConfig, ResyncPolicy, ServerConfig,
};
