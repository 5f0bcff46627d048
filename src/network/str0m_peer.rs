// WebRTC peer connection using str0m Sans-I/O implementation
// Negotiation runs on the caller's task. Once both descriptions are applied
// the Rtc instance moves to a dedicated thread that owns the UDP socket and
// drives the poll loop.

use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::thread;
use std::time::{Duration, Instant};
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::peer::{PeerConnection, PeerEvent};

const CHANNEL_LABEL: &str = "airlink";

enum PeerCommand {
    Send(String),
    AddCandidate(Candidate),
    Close,
}

enum PeerState {
    Negotiating { rtc: Rtc, socket: UdpSocket },
    Running { commands: std_mpsc::Sender<PeerCommand> },
    Closed,
}

pub struct Str0mPeer {
    state: PeerState,
    pending_offer: Option<SdpPendingOffer>,
    channel: Option<ChannelId>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    connected: Arc<AtomicBool>,
}

impl Str0mPeer {
    /// Bind a UDP socket on the preferred local interface and gather the host
    /// candidate, plus a server reflexive one when `stun_server` answers.
    /// Gathered candidates are reported as [`PeerEvent::IceCandidate`].
    pub async fn open(stun_server: Option<&str>) -> Result<Self> {
        let mut rtc = Rtc::builder()
            .set_rtp_mode(false) // Data channels only, no RTP media
            .build();

        let local_ip = discover_local_ip().unwrap_or_else(|e| {
            warn!("Local IP discovery failed ({}), using 127.0.0.1", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });

        // Bind to the specific IP so local_addr() matches the host candidate
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        let host_addr = socket.local_addr()?;
        info!("Bound UDP socket: {}", host_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let host = Candidate::host(host_addr, "udp")
            .map_err(|e| anyhow!("Failed to create local candidate: {}", e))?;
        announce(&mut rtc, host, &events_tx);

        if let Some(stun_server) = stun_server {
            match query_stun_server(&socket, stun_server).await {
                Ok(public_addr) => {
                    info!("🌐 Public address from STUN: {}", public_addr);
                    match Candidate::server_reflexive(public_addr, host_addr, "udp") {
                        Ok(srflx) => announce(&mut rtc, srflx, &events_tx),
                        Err(e) => warn!("Failed to create server reflexive candidate: {}", e),
                    }
                }
                Err(e) => warn!("STUN query failed: {}, using host candidate only", e),
            }
        }

        Ok(Self {
            state: PeerState::Negotiating { rtc, socket },
            pending_offer: None,
            channel: None,
            events_tx,
            events_rx: Some(events_rx),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn rtc(&mut self) -> Result<&mut Rtc> {
        match &mut self.state {
            PeerState::Negotiating { rtc, .. } => Ok(rtc),
            _ => Err(anyhow!("session description already applied")),
        }
    }

    /// Hand the Rtc instance to the polling thread
    fn start(&mut self) -> Result<()> {
        let (rtc, socket) = match std::mem::replace(&mut self.state, PeerState::Closed) {
            PeerState::Negotiating { rtc, socket } => (rtc, socket),
            other => {
                self.state = other;
                return Err(anyhow!("peer is not negotiating"));
            }
        };

        let (commands, commands_rx) = std_mpsc::channel();
        let events = self.events_tx.clone();
        let connected = self.connected.clone();
        let channel = self.channel;

        thread::Builder::new()
            .name("str0m-peer".into())
            .spawn(move || {
                if let Err(e) = run_loop(rtc, socket, channel, events.clone(), commands_rx, connected) {
                    error!("WebRTC loop error: {}", e);
                }
                let _ = events.send(PeerEvent::Closed);
            })?;

        self.state = PeerState::Running { commands };
        Ok(())
    }

    fn command(&self, command: PeerCommand) -> Result<()> {
        match &self.state {
            PeerState::Running { commands } => commands
                .send(command)
                .map_err(|_| anyhow!("WebRTC loop has stopped")),
            _ => Err(anyhow!("peer connection is not running")),
        }
    }
}

fn announce(rtc: &mut Rtc, candidate: Candidate, events: &mpsc::UnboundedSender<PeerEvent>) {
    match rtc.add_local_candidate(candidate) {
        Some(added) => {
            let line = added.to_sdp_string();
            debug!("Local ICE candidate: {}", line);
            let _ = events.send(PeerEvent::IceCandidate(line));
        }
        None => warn!("Failed to add local candidate"),
    }
}

impl PeerConnection for Str0mPeer {
    fn create_offer(&mut self) -> Result<String> {
        let rtc = self.rtc()?;
        let mut change = rtc.sdp_api();
        // Ordered and reliable: RPC responses must not be lost or reordered
        let channel = change.add_channel(CHANNEL_LABEL.to_string());
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| anyhow!("Failed to apply SDP changes"))?;

        self.channel = Some(channel);
        self.pending_offer = Some(pending);
        info!("📨 Created data channel offer");
        Ok(offer.to_sdp_string())
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<String> {
        let offer = SdpOffer::from_sdp_string(sdp)?;
        let answer = self.rtc()?.sdp_api().accept_offer(offer)?;
        self.start()?;
        info!("📤 Answer created");
        Ok(answer.to_sdp_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<()> {
        let pending = self
            .pending_offer
            .take()
            .ok_or_else(|| anyhow!("no offer outstanding"))?;
        let answer = SdpAnswer::from_sdp_string(sdp)
            .map_err(|e| anyhow!("Failed to parse answer SDP: {}", e))?;
        self.rtc()?
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| anyhow!("Failed to accept answer: {}", e))?;
        self.start()?;
        info!("✅ SDP negotiation complete");
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()> {
        let candidate = Candidate::from_sdp_string(candidate)
            .map_err(|e| anyhow!("Invalid ICE candidate: {}", e))?;
        match &mut self.state {
            PeerState::Negotiating { rtc, .. } => {
                rtc.add_remote_candidate(candidate);
                Ok(())
            }
            _ => self.command(PeerCommand::AddCandidate(candidate)),
        }
    }

    fn send(&mut self, data: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("data channel not open"));
        }
        self.command(PeerCommand::Send(data.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.take()
    }

    fn close(&mut self) {
        if let PeerState::Running { commands } = &self.state {
            let _ = commands.send(PeerCommand::Close);
        }
        self.state = PeerState::Closed;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for Str0mPeer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pick the local IPv4 address most likely to reach the other device.
/// With both a VPN (10.x) and a home network (192.168.x) present the VPN is
/// preferred so STUN traversal works; otherwise the home network wins.
fn discover_local_ip() -> Result<IpAddr> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| anyhow!("Failed to get network interfaces: {}", e))?;

    let mut candidates: Vec<(String, Ipv4Addr)> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() => Some((iface.name, ip)),
            _ => None,
        })
        .collect();

    if candidates.is_empty() {
        return Err(anyhow!("No suitable network interfaces found"));
    }

    let has_vpn = candidates.iter().any(|(_, ip)| ip.octets()[0] == 10);
    let has_home_network = candidates
        .iter()
        .any(|(_, ip)| ip.octets()[0] == 192 && ip.octets()[1] == 168);

    candidates.sort_by_key(|(_, ip)| {
        let octets = ip.octets();
        match octets {
            [10, ..] => {
                if has_home_network {
                    0
                } else {
                    2
                }
            }
            [192, 168, ..] => {
                if has_vpn {
                    1
                } else {
                    0
                }
            }
            [172, b, ..] if (16..=31).contains(&b) => 1,
            _ => 3,
        }
    });

    let (name, ip) = &candidates[0];
    debug!("Selected interface {} with IP {}", name, ip);
    Ok(IpAddr::V4(*ip))
}

/// Query the STUN server for the public address of `socket`.
/// Must run on the socket ICE will use so the NAT mapping matches.
async fn query_stun_server(socket: &UdpSocket, stun_server: &str) -> Result<SocketAddr> {
    let stun_addr = tokio::net::lookup_host(stun_server)
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("Failed to resolve STUN server to IPv4 address"))?;

    let socket = socket.try_clone()?;
    let client = stunclient::StunClient::new(stun_addr);
    tokio::task::spawn_blocking(
        move || -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
            socket.set_read_timeout(Some(Duration::from_secs(5)))?;
            let public = client.query_external_address(&socket)?;
            socket.set_read_timeout(None)?;
            Ok(public)
        },
    )
    .await?
    .map_err(|e| anyhow!("STUN query failed: {}", e))
}

/// Synchronous str0m polling loop, runs until closed or the socket fails
fn run_loop(
    mut rtc: Rtc,
    socket: UdpSocket,
    mut channel: Option<ChannelId>,
    events: mpsc::UnboundedSender<PeerEvent>,
    commands: std_mpsc::Receiver<PeerCommand>,
    connected: Arc<AtomicBool>,
) -> Result<()> {
    info!("🔄 Starting WebRTC polling loop");
    let mut buf = vec![0u8; 65535];
    // str0m must be told when its requested deadline passes for ICE keepalives
    let mut deadline: Option<Instant> = None;

    // Short socket timeout so commands are drained frequently
    socket.set_read_timeout(Some(Duration::from_millis(10)))?;

    loop {
        loop {
            match rtc.poll_output()? {
                Output::Transmit(transmit) => {
                    if let Err(e) = socket.send_to(&transmit.contents, transmit.destination) {
                        warn!("Failed to send UDP packet: {}", e);
                    }
                }
                Output::Timeout(next) => {
                    deadline = Some(next);
                    break;
                }
                Output::Event(event) => {
                    handle_event(event, &events, &connected, &mut channel);
                }
            }
        }

        match socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                let receive = Receive {
                    proto: Protocol::Udp,
                    source,
                    destination: socket.local_addr()?,
                    contents: buf[..n].try_into()?,
                };
                rtc.handle_input(Input::Receive(Instant::now(), receive))?;
                deadline = None;
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                let now = Instant::now();
                if deadline.map_or(true, |d| now >= d) {
                    rtc.handle_input(Input::Timeout(now))?;
                    deadline = None;
                }
            }
            Err(e) => return Err(e.into()),
        }

        loop {
            let command = match commands.try_recv() {
                Ok(command) => command,
                Err(std_mpsc::TryRecvError::Empty) => break,
                // The peer handle was dropped
                Err(std_mpsc::TryRecvError::Disconnected) => PeerCommand::Close,
            };
            match command {
                PeerCommand::Send(data) => {
                    let written = channel
                        .and_then(|cid| rtc.channel(cid))
                        .map(|mut ch| ch.write(false, data.as_bytes()));
                    match written {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!("Data channel write failed: {}", e),
                        None => warn!("Data channel not available, dropping message"),
                    }
                }
                PeerCommand::AddCandidate(candidate) => {
                    rtc.add_remote_candidate(candidate);
                }
                PeerCommand::Close => {
                    rtc.disconnect();
                    return Ok(());
                }
            }
        }
    }
}

fn handle_event(
    event: Event,
    events: &mpsc::UnboundedSender<PeerEvent>,
    connected: &Arc<AtomicBool>,
    channel: &mut Option<ChannelId>,
) {
    match event {
        Event::Connected => {
            info!("🔗 WebRTC connection established (ICE + DTLS)");
        }
        Event::IceConnectionStateChange(state) => {
            debug!("ICE state: {:?}", state);
            if state == IceConnectionState::Disconnected {
                info!("❌ ICE connection disconnected");
                connected.store(false, Ordering::Relaxed);
                let _ = events.send(PeerEvent::Closed);
            }
        }
        Event::ChannelOpen(cid, label) => {
            info!("📨 Data channel opened: {}", label);
            *channel = Some(cid);
            connected.store(true, Ordering::Relaxed);
            let _ = events.send(PeerEvent::Connect);
        }
        Event::ChannelData(data) => match String::from_utf8(data.data) {
            Ok(text) => {
                let _ = events.send(PeerEvent::Data(text));
            }
            Err(_) => warn!("Dropping non-UTF-8 data channel message"),
        },
        Event::ChannelClose(_) => {
            connected.store(false, Ordering::Relaxed);
            let _ = events.send(PeerEvent::Closed);
        }
        _ => {}
    }
}
