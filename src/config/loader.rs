// Configuration file loading and creation

use super::types::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("airlink");

    // Create config directory if it doesn't exist
    fs::create_dir_all(&path).ok();

    path.push("config.toml");
    path
}

/// Load configuration from file, or create default if it doesn't exist
pub fn load_config() -> Result<Config, io::Error> {
    load_config_from(&get_config_path())
}

fn load_config_from(path: &Path) -> Result<Config, io::Error> {
    if !path.exists() {
        create_default_config(path)?;
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)?;
    match toml::from_str(&contents) {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("Failed to parse config file {}: {}", path.display(), e);
            warn!("Using default configuration");
            Ok(Config::default())
        }
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<(), io::Error> {
    let config = Config::default();
    let toml_string = toml::to_string_pretty(&config).map_err(io::Error::other)?;

    let commented_toml = format!(
        "# Airlink Configuration File\n\
         # Restart after editing for changes to take effect\n\
         #\n\
         # network.fallback_delay_ms: how long to try a direct WebRTC link\n\
         #                            before relaying through the signaling server\n\
         # network.stun_server:       leave empty to skip STUN\n\
         #\n\
         # Wallets served by the airgapped side, for example:\n\
         # [[airgap.wallets]]\n\
         # blockchain = \"eth\"\n\
         # address = \"0x...\"\n\n\
         {}",
        toml_string
    );

    fs::write(path, commented_toml)?;
    info!("Created default config file at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        let parsed: Config = toml::from_str(&toml_string).unwrap();

        assert_eq!(parsed.network.signaling_server, config.network.signaling_server);
        assert_eq!(parsed.network.fallback_delay_ms, 5000);
        assert!(!parsed.network.force_fallback);
        assert_eq!(parsed.server.listen_addr, "0.0.0.0:8080");
        assert!(parsed.airgap.wallets.is_empty());
    }

    #[test]
    fn test_partial_config_with_defaults() {
        let partial_toml = r#"
            [network]
            force_fallback = true

            [[airgap.wallets]]
            blockchain = "eth"
            address = "0xabc"
        "#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        // Custom values
        assert!(config.network.force_fallback);
        assert_eq!(config.airgap.wallets.len(), 1);
        assert_eq!(config.airgap.wallets[0].blockchain, "eth");

        // Default values should still be there
        assert_eq!(config.network.fallback_delay_ms, 5000);
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_file_is_created_and_broken_file_falls_back() {
        let dir = std::env::temp_dir().join(format!("airlink-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);

        let config = load_config_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.network.fallback_delay_ms, 5000);

        // The generated file parses back
        let reloaded = load_config_from(&path).unwrap();
        assert_eq!(reloaded.server.listen_addr, config.server.listen_addr);

        fs::write(&path, "network = [not toml").unwrap();
        let fallback = load_config_from(&path).unwrap();
        assert_eq!(fallback.network.fallback_delay_ms, 5000);

        fs::remove_dir_all(&dir).unwrap();
    }
}
