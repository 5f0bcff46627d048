// Airlink configuration types
// Every section has defaults, so a partial file is enough

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub airgap: AirgapConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    // Signaling server WebSocket URL
    pub signaling_server: String,

    // STUN server for the server reflexive candidate (empty disables STUN)
    pub stun_server: String,

    // How long the ICE phase may run before switching to the relay
    pub fallback_delay_ms: u64,

    // Skip straight to the relay (the ICE phase gets 1 ms)
    pub force_fallback: bool,

    // Upper bound for the whole handshake, in seconds
    pub connection_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_server: "ws://127.0.0.1:8080".to_string(),
            stun_server: "stun.cloudflare.com:3478".to_string(),
            fallback_delay_ms: 5000,
            force_fallback: false,
            connection_timeout_secs: 300, // plenty of time for STUN/ICE negotiation
        }
    }
}

impl NetworkConfig {
    pub fn stun_server(&self) -> Option<&str> {
        let server = self.stun_server.trim();
        (!server.is_empty()).then_some(server)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    // Address the signaling server binds to
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AirgapConfig {
    // Wallets reported by the responder for getWalletList
    pub wallets: Vec<Wallet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Wallet {
    pub blockchain: String,
    pub address: String,
}

impl AirgapConfig {
    /// Wallets on any of `blockchains`, or all of them when the filter is empty
    pub fn wallets_for(&self, blockchains: &[String]) -> Vec<Wallet> {
        self.wallets
            .iter()
            .filter(|wallet| blockchains.is_empty() || blockchains.contains(&wallet.blockchain))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_filter() {
        let airgap = AirgapConfig {
            wallets: vec![
                Wallet {
                    blockchain: "eth".into(),
                    address: "0xabc".into(),
                },
                Wallet {
                    blockchain: "btc".into(),
                    address: "bc1q".into(),
                },
            ],
        };
        assert_eq!(airgap.wallets_for(&[]).len(), 2);
        let eth = airgap.wallets_for(&["eth".to_string()]);
        assert_eq!(eth.len(), 1);
        assert_eq!(eth[0].address, "0xabc");
        assert!(airgap.wallets_for(&["sol".to_string()]).is_empty());
    }

    #[test]
    fn test_blank_stun_server_disables_stun() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.stun_server(), Some("stun.cloudflare.com:3478"));
        network.stun_server = "  ".into();
        assert_eq!(network.stun_server(), None);
    }
}
