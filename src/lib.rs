// Airlink: JSON-RPC between a browser-side initiator and an airgapped
// responder, over a WebRTC data channel with a signaling-server relay as
// fallback

pub mod config;
pub mod connection;
pub mod debug;
pub mod network;
pub mod rpc;
pub mod signaling;

mod poison;

#[cfg(test)]
mod testing;
