// WebRTC data channel transport adapter

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::peer::{PeerConnection, PeerEvent};
use super::queue::SendQueue;
use crate::poison::lock;
use crate::rpc::{InboundSink, Transport};

pub struct WebRtcTransport<P: PeerConnection> {
    queue: Arc<SendQueue>,
    start: Mutex<Option<(P, mpsc::UnboundedReceiver<PeerEvent>)>>,
}

impl<P: PeerConnection> WebRtcTransport<P> {
    /// Wrap a peer and the event stream taken from it. Works both for a
    /// peer that is already connected and for one still negotiating.
    pub fn new(peer: P, events: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        Self {
            queue: Arc::new(SendQueue::new()),
            start: Mutex::new(Some((peer, events))),
        }
    }
}

impl<P: PeerConnection> Transport for WebRtcTransport<P> {
    fn send(&self, wire: String) {
        self.queue.push(wire);
    }

    fn on_receive(&self, sink: InboundSink) {
        let Some((peer, events)) = lock(&self.start).take() else {
            warn!("WebRTC transport is already bound");
            return;
        };
        tokio::spawn(pump(peer, events, self.queue.clone(), sink));
    }

    fn ready(&self) -> bool {
        self.queue.is_open()
    }
}

async fn pump<P: PeerConnection>(
    mut peer: P,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    queue: Arc<SendQueue>,
    sink: InboundSink,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tx = Some(tx);

    if peer.is_connected() {
        if let Some(tx) = tx.take() {
            queue.open(tx);
        }
    }

    loop {
        tokio::select! {
            Some(wire) = rx.recv() => {
                if let Err(e) = peer.send(&wire) {
                    warn!("Data channel write failed: {}", e);
                }
            }
            event = events.recv() => match event {
                Some(PeerEvent::Connect) => {
                    if let Some(tx) = tx.take() {
                        let flushed = queue.open(tx);
                        info!("🔗 Data channel open, flushed {} queued messages", flushed);
                    }
                }
                Some(PeerEvent::Data(text)) => sink(text),
                Some(PeerEvent::IceCandidate(_)) => {
                    debug!("Ignoring ICE candidate gathered after negotiation");
                }
                Some(PeerEvent::Closed) | None => break,
            },
        }
    }

    queue.close();
    peer.close();
    info!("❌ Data channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{handler, RpcEngine, RpcRequest};
    use crate::testing::{settle, LoopbackPeer};
    use serde_json::json;

    #[tokio::test]
    async fn test_queues_until_connect_then_flushes() {
        let (mut local, mut remote) = LoopbackPeer::pair(true);
        let local_events = local.take_events().unwrap();
        let mut remote_events = remote.take_events().unwrap();

        let transport = Arc::new(WebRtcTransport::new(local.clone(), local_events));
        let engine = RpcEngine::new(transport.clone(), crate::rpc::method_not_found());

        engine.push("first", json!(1), false).unwrap();
        engine.push("second", json!(2), false).unwrap();
        settle().await;
        assert!(!engine.is_ready());
        assert_eq!(local.sent_count(), 0);

        let offer = local.create_offer().unwrap();
        let answer = remote.accept_offer(&offer).unwrap();
        local.accept_answer(&answer).unwrap();
        settle().await;

        assert!(engine.is_ready());
        let mut data = Vec::new();
        while let Ok(event) = remote_events.try_recv() {
            if let PeerEvent::Data(text) = event {
                data.push(text);
            }
        }
        assert_eq!(data.len(), 2);
        assert!(data[0].contains("\"first\""));
        assert!(data[1].contains("\"second\""));
    }

    #[tokio::test]
    async fn test_call_over_connected_pair() {
        let (mut browser, mut airgap) = LoopbackPeer::pair(true);
        let offer = browser.create_offer().unwrap();
        let answer = airgap.accept_offer(&offer).unwrap();
        browser.accept_answer(&answer).unwrap();

        let browser_events = browser.take_events().unwrap();
        let airgap_events = airgap.take_events().unwrap();

        let caller = RpcEngine::new(
            Arc::new(WebRtcTransport::new(browser, browser_events)),
            crate::rpc::method_not_found(),
        );
        let _answerer = RpcEngine::new(
            Arc::new(WebRtcTransport::new(airgap, airgap_events)),
            handler(|request: RpcRequest| async move {
                Ok(json!({"echo": request.params}))
            }),
        );

        let result = caller.call("echo", vec![json!("hi")]).await.unwrap();
        assert_eq!(result, json!({"echo": ["hi"]}));
    }
}
