// Fallback transport adapter
// Tunnels an engine's traffic through `fallback` calls on an already
// connected engine, normally the signaling WebSocket

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::queue::SendQueue;
use crate::poison::lock;
use crate::rpc::{handler, invalid_params, InboundSink, RpcEngine, RpcRequest, Transport, FALLBACK_METHOD};

pub struct FallbackTransport {
    outer: RpcEngine,
    queue: Arc<SendQueue>,
    inbound: mpsc::UnboundedSender<String>,
    delivered: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl FallbackTransport {
    pub fn new(outer: RpcEngine) -> Self {
        let (inbound, delivered) = mpsc::unbounded_channel();
        Self::with_inbound(outer, inbound, delivered)
    }

    /// Share a tunnel channel that an earlier handler on `outer` already
    /// feeds. Whatever it buffered is delivered first, and every tunneled
    /// message, old handler or new, reaches the inner engine in channel order.
    pub fn with_inbound(
        outer: RpcEngine,
        inbound: mpsc::UnboundedSender<String>,
        delivered: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outer,
            queue: Arc::new(SendQueue::new()),
            inbound,
            delivered: Mutex::new(Some(delivered)),
        }
    }
}

/// The tunneled message is the single positional parameter
pub(crate) fn tunneled_payload(params: &Value) -> Option<String> {
    match params {
        Value::Array(items) if items.len() == 1 => items[0].as_str().map(str::to_string),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Error object for a tunneled message nobody is left to receive
pub(crate) fn tunnel_closed() -> Value {
    json!({
        "code": -32603,
        "message": "fallback tunnel closed",
    })
}

impl Transport for FallbackTransport {
    fn send(&self, wire: String) {
        self.queue.push(wire);
    }

    fn on_receive(&self, sink: InboundSink) {
        let inbound = self.inbound.clone();
        self.outer.rebind_with(move |previous| {
            handler(move |request: RpcRequest| {
                let previous = previous.clone();
                let inbound = inbound.clone();
                async move {
                    if request.method != FALLBACK_METHOD {
                        return previous(request).await;
                    }
                    let inner = tunneled_payload(&request.params).ok_or_else(|| {
                        invalid_params("fallback expects a single string parameter")
                    })?;
                    inbound.send(inner).map_err(|_| tunnel_closed())?;
                    Ok(json!("ok"))
                }
            })
        });

        match lock(&self.delivered).take() {
            Some(mut delivered) => {
                tokio::spawn(async move {
                    while let Some(inner) = delivered.recv().await {
                        sink(inner);
                    }
                    debug!("Fallback tunnel inbound side finished");
                });
            }
            None => warn!("Fallback tunnel bound twice, inbound side already taken"),
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let flushed = self.queue.open(tx);
        debug!("Fallback tunnel bound, flushed {} queued messages", flushed);

        let outer = self.outer.clone();
        tokio::spawn(async move {
            while let Some(wire) = rx.recv().await {
                match outer.tunnel(wire) {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            if let Err(e) = pending.wait().await {
                                debug!("Tunneled message not acknowledged: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to tunnel message: {}", e),
                }
            }
        });
    }

    fn ready(&self) -> bool {
        self.queue.is_open() && self.outer.is_ready()
    }
}
