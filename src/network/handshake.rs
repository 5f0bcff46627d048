// WebRTC handshake state machine
// The session state is kept separate from the async driver so transitions
// and ICE buffering can be checked without any I/O.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::fallback::{tunnel_closed, tunneled_payload};
use super::peer::{PeerConnection, PeerEvent};
use super::websocket::WebSocketTransport;
use crate::config::NetworkConfig;
use crate::rpc::{
    handler, invalid_params, method_not_found_error, named_param, RequestHandler, RpcEngine,
    RpcRequest, FALLBACK_METHOD,
};

/// Handshake progress. Only ever moves forward, one step at a time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeStatus {
    #[default]
    NotStarted,
    ConnectingHandshake,
    ExchangingOfferAnswer,
    ExchangingIce,
    Connected,
}

impl HandshakeStatus {
    fn next(self) -> Option<HandshakeStatus> {
        match self {
            HandshakeStatus::NotStarted => Some(HandshakeStatus::ConnectingHandshake),
            HandshakeStatus::ConnectingHandshake => Some(HandshakeStatus::ExchangingOfferAnswer),
            HandshakeStatus::ExchangingOfferAnswer => Some(HandshakeStatus::ExchangingIce),
            HandshakeStatus::ExchangingIce => Some(HandshakeStatus::Connected),
            HandshakeStatus::Connected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer; the hub assigns the session id
    Initiator,
    /// Joins an existing session by id
    Responder { sid: String },
}

/// What to do with a locally gathered ICE candidate
#[derive(Debug, PartialEq, Eq)]
pub enum IceAction {
    Send(String),
    /// Buffered until the ICE phase starts
    Hold,
    /// Session already finished
    Drop,
}

#[derive(Debug, Default)]
pub struct HandshakeSession {
    sid: Option<String>,
    status: HandshakeStatus,
    pending_ice: Vec<String>,
    destroyed: bool,
}

impl HandshakeSession {
    pub fn new(sid: Option<String>) -> Self {
        Self {
            sid,
            ..Self::default()
        }
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn set_sid(&mut self, sid: impl Into<String>) {
        self.sid = Some(sid.into());
    }

    pub fn status(&self) -> HandshakeStatus {
        self.status
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn pending_ice(&self) -> &[String] {
        &self.pending_ice
    }

    /// Step to `next` if it is the immediate successor. Reaching
    /// `Connected` destroys the session.
    pub fn advance(&mut self, next: HandshakeStatus) -> bool {
        if self.destroyed || self.status.next() != Some(next) {
            debug!("Ignoring handshake transition {:?} -> {:?}", self.status, next);
            return false;
        }
        info!("Handshake: {:?} -> {:?}", self.status, next);
        self.status = next;
        if next == HandshakeStatus::Connected {
            self.destroy();
        }
        true
    }

    pub fn queue_ice(&mut self, candidate: String) -> IceAction {
        if self.destroyed {
            return IceAction::Drop;
        }
        if self.status >= HandshakeStatus::ExchangingIce {
            IceAction::Send(candidate)
        } else {
            self.pending_ice.push(candidate);
            IceAction::Hold
        }
    }

    /// Enter the ICE phase, returning the held candidates in gather order.
    /// Only the first call flushes anything.
    pub fn enter_ice(&mut self) -> Vec<String> {
        if !self.advance(HandshakeStatus::ExchangingIce) {
            return Vec::new();
        }
        std::mem::take(&mut self.pending_ice)
    }

    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.pending_ice.clear();
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub signaling_url: String,
    /// How long the ICE phase may run before both sides switch to the relay
    pub fallback_delay: Duration,
}

/// Used instead of the configured delay when fallback is forced
pub const FORCED_FALLBACK_DELAY: Duration = Duration::from_millis(1);

impl HandshakeConfig {
    pub fn from_network(network: &NetworkConfig) -> Self {
        let fallback_delay = if network.force_fallback {
            FORCED_FALLBACK_DELAY
        } else {
            Duration::from_millis(network.fallback_delay_ms)
        };
        Self {
            signaling_url: network.signaling_server.clone(),
            fallback_delay,
        }
    }
}

/// Outcome of a handshake: the channel application traffic should use
pub enum Link<P> {
    Direct {
        peer: P,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    },
    /// Tunnel through the signaling connection. The signaling handler keeps
    /// feeding `inbound`; `backlog` is its receiving end and already holds
    /// whatever the other side tunneled before this side switched.
    Relay {
        signaling: RpcEngine,
        inbound: mpsc::UnboundedSender<String>,
        backlog: mpsc::UnboundedReceiver<String>,
    },
}

enum Signal {
    Answer(String),
    Ice(String),
    PeerFellBack,
}

/// Inbound signaling calls during the handshake
fn signaling_handler(
    signals: mpsc::UnboundedSender<Signal>,
    tunneled: mpsc::UnboundedSender<String>,
) -> RequestHandler {
    handler(move |request: RpcRequest| {
        let signals = signals.clone();
        let tunneled = tunneled.clone();
        async move {
            let signal = match request.method.as_str() {
                "answer" => Signal::Answer(
                    named_param(&request.params, "sdp")
                        .ok_or_else(|| invalid_params("answer expects `sdp`"))?,
                ),
                "ice" => Signal::Ice(
                    named_param(&request.params, "candidate")
                        .ok_or_else(|| invalid_params("ice expects `candidate`"))?,
                ),
                FALLBACK_METHOD => {
                    let payload = tunneled_payload(&request.params).ok_or_else(|| {
                        invalid_params("fallback expects a single string parameter")
                    })?;
                    tunneled.send(payload).map_err(|_| tunnel_closed())?;
                    Signal::PeerFellBack
                }
                other => return Err(method_not_found_error(other)),
            };
            let _ = signals.send(signal);
            Ok(json!("ok"))
        }
    })
}

pub struct Handshake<P: PeerConnection> {
    role: Role,
    peer: P,
    config: HandshakeConfig,
    session: HandshakeSession,
}

impl<P: PeerConnection> Handshake<P> {
    pub fn new(role: Role, peer: P, config: HandshakeConfig) -> Self {
        let sid = match &role {
            Role::Initiator => None,
            Role::Responder { sid } => Some(sid.clone()),
        };
        Self {
            role,
            peer,
            config,
            session: HandshakeSession::new(sid),
        }
    }

    /// Drive the handshake to a direct link or to the relay.
    /// `on_sid` receives the session id as soon as the hub assigns it
    /// (Initiator only).
    pub async fn run<F>(mut self, on_sid: F) -> Result<Link<P>>
    where
        F: FnOnce(&str) + Send,
    {
        let mut events = self
            .peer
            .take_events()
            .ok_or_else(|| anyhow!("peer events were already taken"))?;
        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let (inbound, backlog) = mpsc::unbounded_channel();

        self.session.advance(HandshakeStatus::ConnectingHandshake);
        let socket = Arc::new(WebSocketTransport::connect(self.config.signaling_url.clone()));
        let signaling = RpcEngine::new(socket.clone(), signaling_handler(signal_tx, inbound.clone()));
        socket
            .wait_open()
            .await
            .with_context(|| format!("signaling server {} unreachable", self.config.signaling_url))?;
        self.session.advance(HandshakeStatus::ExchangingOfferAnswer);

        let mut deadline = None;
        match self.role.clone() {
            Role::Initiator => {
                let offer = self.peer.create_offer()?;
                let reply = signaling
                    .call_raw("offer", json!({ "sdp": offer }), false, None)
                    .await?;
                let sid = reply
                    .get("sid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("offer reply carries no sid: {}", reply))?;
                info!("🎫 Session id: {}", sid);
                self.session.set_sid(sid);
                on_sid(sid);
            }
            Role::Responder { sid } => {
                let reply = signaling
                    .call_raw("join", json!({ "sid": sid }), false, None)
                    .await?;
                let offer = reply
                    .get("offer")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("join reply carries no offer: {}", reply))?;
                let answer = self.peer.accept_offer(offer)?;
                let pending = signaling.begin_call("answer", json!({ "sdp": answer }), false, None)?;
                tokio::spawn(async move {
                    if let Err(e) = pending.wait().await {
                        warn!("Answer was not relayed: {}", e);
                    }
                });
                self.enter_ice(&signaling);
                deadline = Some(Instant::now() + self.config.fallback_delay);
            }
        }

        loop {
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(PeerEvent::IceCandidate(candidate)) => self.local_candidate(&signaling, candidate),
                    Some(PeerEvent::Connect) => {
                        if self.session.advance(HandshakeStatus::Connected) {
                            info!(
                                "🔗 Direct connection established for session {}",
                                self.session.sid().unwrap_or("?")
                            );
                            socket.close();
                            return Ok(Link::Direct { peer: self.peer, events });
                        }
                        warn!("Peer connected during {:?}, ignoring", self.session.status());
                    }
                    Some(PeerEvent::Data(_)) => debug!("Dropping data received before connect"),
                    Some(PeerEvent::Closed) | None => {
                        warn!("Peer connection closed during handshake, falling back to relay");
                        return Ok(self.fall_back(signaling, inbound, backlog));
                    }
                },
                signal = signals.recv() => match signal {
                    Some(Signal::Answer(sdp)) => {
                        if self.role != Role::Initiator
                            || self.session.status() != HandshakeStatus::ExchangingOfferAnswer
                        {
                            warn!("Unexpected answer during {:?}", self.session.status());
                            continue;
                        }
                        self.peer.accept_answer(&sdp)?;
                        self.enter_ice(&signaling);
                        deadline = Some(Instant::now() + self.config.fallback_delay);
                    }
                    Some(Signal::Ice(candidate)) => {
                        if let Err(e) = self.peer.add_remote_candidate(&candidate) {
                            warn!("Rejected remote ICE candidate: {}", e);
                        }
                    }
                    Some(Signal::PeerFellBack) => {
                        info!("Remote side switched to the relay");
                        return Ok(self.fall_back(signaling, inbound, backlog));
                    }
                    None => return Err(anyhow!("signaling handler dropped")),
                },
                _ = timer => {
                    warn!(
                        "⏱ No direct connection after {:?}, falling back to relay",
                        self.config.fallback_delay
                    );
                    return Ok(self.fall_back(signaling, inbound, backlog));
                }
            }
        }
    }

    fn enter_ice(&mut self, signaling: &RpcEngine) {
        for candidate in self.session.enter_ice() {
            send_candidate(signaling, candidate);
        }
    }

    fn local_candidate(&mut self, signaling: &RpcEngine, candidate: String) {
        match self.session.queue_ice(candidate) {
            IceAction::Send(candidate) => send_candidate(signaling, candidate),
            IceAction::Hold => debug!("Holding ICE candidate until the offer exchange completes"),
            IceAction::Drop => {}
        }
    }

    fn fall_back(
        mut self,
        signaling: RpcEngine,
        inbound: mpsc::UnboundedSender<String>,
        backlog: mpsc::UnboundedReceiver<String>,
    ) -> Link<P> {
        info!(
            "Session {} continues over the relay",
            self.session.sid().unwrap_or("?")
        );
        self.session.destroy();
        self.peer.close();
        Link::Relay {
            signaling,
            inbound,
            backlog,
        }
    }
}

fn send_candidate(signaling: &RpcEngine, candidate: String) {
    match signaling.begin_call("ice", json!({ "candidate": candidate }), false, None) {
        Ok(pending) => {
            tokio::spawn(async move {
                if let Err(e) = pending.wait().await {
                    debug!("ICE candidate not relayed: {}", e);
                }
            });
        }
        Err(e) => warn!("Failed to send ICE candidate: {}", e),
    }
}
