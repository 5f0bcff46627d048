// In-memory transports and peers for unit tests

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use crate::network::peer::{PeerConnection, PeerEvent};
use crate::rpc::{InboundSink, Transport};

/// Let spawned tasks run to completion on the current-thread test runtime
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Records everything sent; `deliver` injects inbound messages.
/// A paired transport forwards its sends to the other side's sink.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<String>>,
    sink: Mutex<Option<InboundSink>>,
    other: Mutex<Option<Weak<MemoryTransport>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let left = Arc::new(MemoryTransport::new());
        let right = Arc::new(MemoryTransport::new());
        *left.other.lock().unwrap() = Some(Arc::downgrade(&right));
        *right.other.lock().unwrap() = Some(Arc::downgrade(&left));
        (left, right)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn deliver(&self, raw: &str) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(raw.to_string());
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, wire: String) {
        self.sent.lock().unwrap().push(wire.clone());
        let other = self.other.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let Some(other) = other {
            other.deliver(&wire);
        }
    }

    fn on_receive(&self, sink: InboundSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn ready(&self) -> bool {
        true
    }
}

/// The host candidate each end of a [`LoopbackPeer`] pair gathers
pub const LOOPBACK_CANDIDATES: [&str; 2] = [
    "candidate:a 1 udp 1 10.0.0.1 5000 typ host",
    "candidate:b 1 udp 1 10.0.0.2 5000 typ host",
];

#[derive(Default)]
struct Side {
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
    remote_applied: bool,
    remote_candidates: Vec<String>,
    connected: bool,
}

struct Link {
    sides: [Side; 2],
    reachable: bool,
}

/// One end of an in-memory peer pair. Both ends connect once each side has
/// applied the other's description and received at least one of its
/// candidates, unless the pair was created unreachable.
#[derive(Clone)]
pub struct LoopbackPeer {
    link: Arc<Mutex<Link>>,
    side: usize,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>>,
    sent: Arc<AtomicUsize>,
}

impl LoopbackPeer {
    pub fn pair(reachable: bool) -> (LoopbackPeer, LoopbackPeer) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        tx_a.send(PeerEvent::IceCandidate(LOOPBACK_CANDIDATES[0].into()))
            .unwrap();
        tx_b.send(PeerEvent::IceCandidate(LOOPBACK_CANDIDATES[1].into()))
            .unwrap();

        let mut sides = [Side::default(), Side::default()];
        sides[0].events = Some(tx_a);
        sides[1].events = Some(tx_b);
        let link = Arc::new(Mutex::new(Link { sides, reachable }));

        let make = |side, rx| LoopbackPeer {
            link: link.clone(),
            side,
            events: Arc::new(Mutex::new(Some(rx))),
            sent: Arc::new(AtomicUsize::new(0)),
        };
        (make(0, rx_a), make(1, rx_b))
    }

    /// Messages written on this end's data channel
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Remote candidates applied to this end, in arrival order
    pub fn remote_candidates(&self) -> Vec<String> {
        self.link.lock().unwrap().sides[self.side].remote_candidates.clone()
    }

    fn apply_remote(&self) {
        self.link.lock().unwrap().sides[self.side].remote_applied = true;
        self.try_connect();
    }

    fn try_connect(&self) {
        let mut link = self.link.lock().unwrap();
        let both = link
            .sides
            .iter()
            .all(|side| side.remote_applied && !side.remote_candidates.is_empty());
        if both && link.reachable {
            for side in link.sides.iter_mut() {
                if !side.connected {
                    side.connected = true;
                    if let Some(events) = &side.events {
                        let _ = events.send(PeerEvent::Connect);
                    }
                }
            }
        }
    }
}

impl PeerConnection for LoopbackPeer {
    fn create_offer(&mut self) -> Result<String> {
        Ok(format!("loopback-offer-{}", self.side))
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<String> {
        if !sdp.starts_with("loopback-offer") {
            return Err(anyhow!("unexpected offer: {}", sdp));
        }
        self.apply_remote();
        Ok(format!("loopback-answer-{}", self.side))
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<()> {
        if !sdp.starts_with("loopback-answer") {
            return Err(anyhow!("unexpected answer: {}", sdp));
        }
        self.apply_remote();
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()> {
        self.link.lock().unwrap().sides[self.side]
            .remote_candidates
            .push(candidate.to_string());
        self.try_connect();
        Ok(())
    }

    fn send(&mut self, data: &str) -> Result<()> {
        let link = self.link.lock().unwrap();
        if !link.sides[self.side].connected {
            return Err(anyhow!("data channel not open"));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        let remote = &link.sides[1 - self.side];
        if let Some(events) = &remote.events {
            let _ = events.send(PeerEvent::Data(data.to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.lock().unwrap().sides[self.side].connected
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().unwrap().take()
    }

    fn close(&mut self) {
        let mut link = self.link.lock().unwrap();
        link.sides[self.side].connected = false;
        if let Some(events) = link.sides[self.side].events.take() {
            let _ = events.send(PeerEvent::Closed);
        }
    }
}
