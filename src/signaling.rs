// Signaling hub
// Pairs an initiator and a responder under a session id and relays
// handshake messages between them as JSON-RPC calls over WebSocket:
//
//   offer  {sdp}        initiator -> hub, answered with {sid}
//   join   {sid}        responder -> hub, answered with {offer}
//   answer {sdp}        responder -> hub -> initiator
//   ice    {candidate}  either side -> hub -> other side
//   fallback [payload]  either side -> hub -> other side

use anyhow::Result;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};

use crate::network::fallback::tunneled_payload;
use crate::network::websocket::WebSocketTransport;
use crate::poison::lock;
use crate::rpc::{
    handler, invalid_params, method_not_found_error, named_param, RequestHandler, RpcEngine,
    RpcError, RpcRequest, WeakRpcEngine, FALLBACK_METHOD,
};

const SID_LEN: usize = 6;

/// Forwarded calls give up after this long so a vanished peer cannot pin a
/// handler task forever
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Responder,
}

struct Room {
    offer: String,
    initiator: RpcEngine,
    responder: Option<RpcEngine>,
}

/// Where a connection sits once it has offered or joined
type Seat = Arc<Mutex<Option<(String, Side)>>>;

#[derive(Clone, Default)]
pub struct SignalingHub {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open sessions
    pub fn sessions(&self) -> usize {
        lock(&self.rooms).len()
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let hub = self.clone();
            tokio::spawn(async move { hub.handle_connection(stream, addr).await });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        info!("📥 New connection from {}", addr);

        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let socket = Arc::new(WebSocketTransport::accepted(ws));
        let seat: Seat = Arc::new(Mutex::new(None));
        let (me_tx, me_rx) = watch::channel(None);
        let engine = RpcEngine::new(socket.clone(), self.handler(seat.clone(), me_rx));
        let _ = me_tx.send(Some(engine.downgrade()));

        socket.wait_closed().await;

        // Clean up on disconnect
        let taken = lock(&seat).take();
        if let Some((sid, side)) = taken {
            let mut rooms = lock(&self.rooms);
            match side {
                Side::Initiator => {
                    rooms.remove(&sid);
                }
                Side::Responder => {
                    if let Some(room) = rooms.get_mut(&sid) {
                        room.responder = None;
                    }
                }
            }
            info!("📤 {:?} of session {} disconnected", side, sid);
        }
        drop(engine);
    }

    fn handler(&self, seat: Seat, me: watch::Receiver<Option<WeakRpcEngine>>) -> RequestHandler {
        let hub = self.clone();
        handler(move |request: RpcRequest| {
            let hub = hub.clone();
            let seat = seat.clone();
            let mut me = me.clone();
            async move {
                let own = me
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|weak| weak.as_ref().and_then(WeakRpcEngine::upgrade))
                    .ok_or_else(|| RpcError::Closed.to_wire())?;
                hub.dispatch(request, &seat, own).await
            }
        })
    }

    async fn dispatch(&self, request: RpcRequest, seat: &Seat, own: RpcEngine) -> Result<Value, Value> {
        let params = &request.params;
        match request.method.as_str() {
            "offer" => {
                let sdp = named_param(params, "sdp").ok_or_else(|| invalid_params("offer expects `sdp`"))?;
                let sid = self.open_room(sdp, own);
                *lock(seat) = Some((sid.clone(), Side::Initiator));
                info!("✅ Session {} opened", sid);
                Ok(json!({ "sid": sid }))
            }
            "join" => {
                let sid = named_param(params, "sid").ok_or_else(|| invalid_params("join expects `sid`"))?;
                let offer = self.join_room(&sid, own)?;
                *lock(seat) = Some((sid.clone(), Side::Responder));
                info!("🤝 Responder joined session {}", sid);
                Ok(json!({ "offer": offer }))
            }
            "answer" => {
                let sdp = named_param(params, "sdp").ok_or_else(|| invalid_params("answer expects `sdp`"))?;
                let target = self.counterpart(seat, Some(Side::Responder))?;
                info!("📨 Relaying answer");
                forward(&target, "answer", json!({ "sdp": sdp })).await
            }
            "ice" => {
                let candidate = named_param(params, "candidate")
                    .ok_or_else(|| invalid_params("ice expects `candidate`"))?;
                let target = self.counterpart(seat, None)?;
                info!("🧊 Relaying ICE candidate");
                forward(&target, "ice", json!({ "candidate": candidate })).await
            }
            FALLBACK_METHOD => {
                let payload = tunneled_payload(params)
                    .ok_or_else(|| invalid_params("fallback expects a single string parameter"))?;
                let target = self.counterpart(seat, None)?;
                let pending = target.tunnel(payload).map_err(|e| e.to_wire())?;
                match tokio::time::timeout(FORWARD_TIMEOUT, pending.wait()).await {
                    Ok(result) => result.map_err(|e| e.to_wire()),
                    Err(_) => Err(RpcError::Transport("relay timed out".into()).to_wire()),
                }
            }
            other => Err(method_not_found_error(other)),
        }
    }

    fn open_room(&self, offer: String, initiator: RpcEngine) -> String {
        let mut rooms = lock(&self.rooms);
        let sid = loop {
            let sid = generate_sid();
            if !rooms.contains_key(&sid) {
                break sid;
            }
        };
        rooms.insert(
            sid.clone(),
            Room {
                offer,
                initiator,
                responder: None,
            },
        );
        sid
    }

    fn join_room(&self, sid: &str, responder: RpcEngine) -> Result<String, Value> {
        let mut rooms = lock(&self.rooms);
        let room = rooms
            .get_mut(sid)
            .ok_or_else(|| json!({ "code": -32000, "message": format!("unknown session {}", sid) }))?;
        if room.responder.is_some() {
            return Err(json!({ "code": -32001, "message": format!("session {} already joined", sid) }));
        }
        room.responder = Some(responder);
        Ok(room.offer.clone())
    }

    /// The engine on the other side of the caller's session. `required`
    /// restricts which side may make the call.
    fn counterpart(&self, seat: &Seat, required: Option<Side>) -> Result<RpcEngine, Value> {
        let (sid, side) = lock(seat)
            .clone()
            .ok_or_else(|| json!({ "code": -32002, "message": "not in a session" }))?;
        if required.is_some_and(|required| required != side) {
            return Err(json!({ "code": -32003, "message": format!("{:?} may not send this", side) }));
        }

        let rooms = lock(&self.rooms);
        let room = rooms
            .get(&sid)
            .ok_or_else(|| json!({ "code": -32000, "message": format!("unknown session {}", sid) }))?;
        let target = match side {
            Side::Initiator => room.responder.clone(),
            Side::Responder => Some(room.initiator.clone()),
        };
        target.ok_or_else(|| json!({ "code": -32004, "message": "no peer joined yet" }))
    }
}

async fn forward(target: &RpcEngine, method: &str, params: Value) -> Result<Value, Value> {
    match tokio::time::timeout(FORWARD_TIMEOUT, target.call_raw(method, params, false, None)).await {
        Ok(result) => result.map_err(|e| e.to_wire()),
        Err(_) => {
            warn!("Relaying {} timed out", method);
            Err(RpcError::Transport("relay timed out".into()).to_wire())
        }
    }
}

/// Generate a short, human-friendly session id (uppercase letters)
fn generate_sid() -> String {
    let mut rng = rand::thread_rng();
    (0..SID_LEN)
        .map(|_| (b'A' + rng.gen_range(0..26)) as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::method_not_found;
    use crate::testing::MemoryTransport;

    fn engine() -> RpcEngine {
        RpcEngine::new(Arc::new(MemoryTransport::new()), method_not_found())
    }

    #[test]
    fn test_named_param_forms() {
        assert_eq!(named_param(&json!({"sdp": "v=0"}), "sdp"), Some("v=0".into()));
        assert_eq!(named_param(&json!(["v=0"]), "sdp"), Some("v=0".into()));
        assert_eq!(named_param(&json!({"other": "v=0"}), "sdp"), None);
        assert_eq!(named_param(&json!(["a", "b"]), "sdp"), None);
        assert_eq!(named_param(&json!({"sdp": 5}), "sdp"), None);
        assert_eq!(named_param(&Value::Null, "sdp"), None);
    }

    #[test]
    fn test_generated_sid_shape() {
        let sid = generate_sid();
        assert_eq!(sid.len(), SID_LEN);
        assert!(sid.chars().all(|c| c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_rooms_pair_one_responder() {
        let hub = SignalingHub::new();
        let sid = hub.open_room("v=0 offer".into(), engine());
        let other = hub.open_room("v=0 other".into(), engine());
        assert_ne!(sid, other);
        assert_eq!(hub.sessions(), 2);

        assert_eq!(hub.join_room(&sid, engine()), Ok("v=0 offer".to_string()));
        let second = hub.join_room(&sid, engine()).unwrap_err();
        assert_eq!(second["code"], -32001);

        let unknown = hub.join_room("NOPE", engine()).unwrap_err();
        assert_eq!(unknown["code"], -32000);
    }

    #[tokio::test]
    async fn test_only_responder_may_answer() {
        let hub = SignalingHub::new();
        let sid = hub.open_room("v=0".into(), engine());
        let seat: Seat = Arc::new(Mutex::new(Some((sid.clone(), Side::Initiator))));

        // No responder yet
        let err = hub.counterpart(&seat, None).unwrap_err();
        assert_eq!(err["code"], -32004);

        hub.join_room(&sid, engine()).unwrap();
        assert!(hub.counterpart(&seat, None).is_ok());
        let err = hub.counterpart(&seat, Some(Side::Responder)).unwrap_err();
        assert_eq!(err["code"], -32003);

        let outsider: Seat = Arc::new(Mutex::new(None));
        let err = hub.counterpart(&outsider, None).unwrap_err();
        assert_eq!(err["code"], -32002);
    }
}
