// Airlink Signaling Server
// Pairs initiators and responders and relays handshake and fallback traffic
//
// Usage: cargo run --bin signaling-server [listen-addr]

use tokio::net::TcpListener;
use tracing::{info, warn};

use airlink::config::{self, Config};
use airlink::signaling::SignalingHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    airlink::debug::init(false)?;

    let config = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    });
    let addr = std::env::args()
        .nth(1)
        .unwrap_or(config.server.listen_addr);

    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Signaling server listening on {}", addr);

    SignalingHub::new().serve(listener).await
}
