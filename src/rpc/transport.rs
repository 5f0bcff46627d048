// Transport capability the RPC engine is parameterized by

use std::sync::Arc;

/// Callback receiving one inbound wire string
pub type InboundSink = Arc<dyn Fn(String) + Send + Sync>;

/// A channel an [`RpcEngine`](super::RpcEngine) can speak over.
///
/// Implementations queue outgoing messages until the channel is ready and
/// flush them in FIFO order. `on_receive` is called exactly once, when the
/// engine is constructed; the transport starts listening at that point and
/// stays bound for the lifetime of the underlying channel.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, wire: String);

    fn on_receive(&self, sink: InboundSink);

    fn ready(&self) -> bool;
}
