// Peer connection capability driven by the handshake and the WebRTC transport

use anyhow::Result;
use tokio::sync::mpsc;

/// Events surfaced by a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate that must reach the remote side
    IceCandidate(String),

    /// Data channel is open and writable
    Connect,

    /// Text message received on the data channel
    Data(String),

    /// Connection lost or closed
    Closed,
}

/// One side of a peer-to-peer data channel.
///
/// SDP and candidate operations are synchronous; everything the connection
/// reports afterwards arrives on the receiver returned by `take_events`.
pub trait PeerConnection: Send + 'static {
    /// Create the data channel and return the local SDP offer (Initiator)
    fn create_offer(&mut self) -> Result<String>;

    /// Apply a remote offer and return the local SDP answer (Responder)
    fn accept_offer(&mut self, sdp: &str) -> Result<String>;

    /// Apply the remote answer to the offer created earlier (Initiator)
    fn accept_answer(&mut self, sdp: &str) -> Result<()>;

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()>;

    /// Write a text message on the data channel
    fn send(&mut self, data: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Event stream; only the first call returns `Some`
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    fn close(&mut self);
}
