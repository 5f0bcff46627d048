// Configuration module for Airlink
// Loads network, signaling server and responder settings from a TOML file

pub mod loader;
pub mod types;

pub use loader::{create_default_config, get_config_path, load_config};
pub use types::{AirgapConfig, Config, NetworkConfig, ServerConfig, Wallet};
