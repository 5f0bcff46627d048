// Peer-to-peer networking
// Transport adapters, the WebRTC handshake and the glue that turns a
// negotiated link into a connected RPC engine

pub mod fallback;
pub mod handshake;
pub mod peer;
pub mod queue;
pub mod str0m_peer;
pub mod webrtc;
pub mod websocket;

pub use fallback::FallbackTransport;
pub use handshake::{Handshake, HandshakeConfig, HandshakeStatus, Link, Role};
pub use peer::{PeerConnection, PeerEvent};
pub use str0m_peer::Str0mPeer;
pub use webrtc::WebRtcTransport;
pub use websocket::WebSocketTransport;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::connection::{Connection, ConnectionHandle};
use crate::rpc::{RequestHandler, RpcEngine};

/// Put an engine on top of a negotiated link.
/// Returns the engine and whether it runs over the relay.
pub fn bind<P: PeerConnection>(link: Link<P>, handler: RequestHandler) -> (RpcEngine, bool) {
    match link {
        Link::Direct { peer, events } => {
            let transport = Arc::new(WebRtcTransport::new(peer, events));
            (RpcEngine::new(transport, handler), false)
        }
        Link::Relay {
            signaling,
            inbound,
            backlog,
        } => {
            let transport = Arc::new(FallbackTransport::with_inbound(signaling, inbound, backlog));
            (RpcEngine::new(transport, handler), true)
        }
    }
}

/// Run the handshake, bind the result and install it as the current
/// connection
pub async fn establish<P, F>(
    handle: &ConnectionHandle,
    role: Role,
    peer: P,
    config: HandshakeConfig,
    handler: RequestHandler,
    on_sid: F,
) -> Result<Arc<Connection>>
where
    P: PeerConnection,
    F: FnOnce(&str) + Send,
{
    let link = Handshake::new(role, peer, config).run(on_sid).await?;
    let (rpc, using_fallback) = bind(link, handler);
    info!(
        "Connection ready ({})",
        if using_fallback { "relay" } else { "direct" }
    );
    Ok(handle.install(rpc, using_fallback))
}
