// WebSocket transport adapter
// Used for the signaling connection on both peers and for accepted
// connections inside the signaling hub

use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use super::queue::SendQueue;
use crate::poison::lock;
use crate::rpc::{InboundSink, RpcError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

enum Start {
    Connect(String),
    Accepted(WebSocketStream<TcpStream>),
}

pub struct WebSocketTransport {
    queue: Arc<SendQueue>,
    start: Mutex<Option<Start>>,
    state: Arc<watch::Sender<SocketState>>,
}

impl WebSocketTransport {
    /// Dial `url` once an engine is bound; sends queue up until the socket opens
    pub fn connect(url: impl Into<String>) -> Self {
        Self::with_start(Start::Connect(url.into()))
    }

    /// Wrap a socket the server side already accepted
    pub fn accepted(ws: WebSocketStream<TcpStream>) -> Self {
        Self::with_start(Start::Accepted(ws))
    }

    fn with_start(start: Start) -> Self {
        let (state, _) = watch::channel(SocketState::Connecting);
        Self {
            queue: Arc::new(SendQueue::new()),
            start: Mutex::new(Some(start)),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Resolves once the socket is open, or fails if it closed first
    pub async fn wait_open(&self) -> Result<(), RpcError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != SocketState::Connecting)
            .await
            .map_err(|_| RpcError::Transport("socket state dropped".into()))?;
        match state {
            SocketState::Open => Ok(()),
            _ => Err(RpcError::Transport(
                "socket closed before it opened".into(),
            )),
        }
    }

    /// Stop accepting sends. Already queued messages are written before the
    /// socket is closed.
    pub fn close(&self) {
        self.queue.close();
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SocketState::Closed).await;
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, wire: String) {
        self.queue.push(wire);
    }

    fn on_receive(&self, sink: InboundSink) {
        let Some(start) = lock(&self.start).take() else {
            warn!("WebSocket transport is already bound");
            return;
        };
        let queue = self.queue.clone();
        let state = self.state.clone();

        match start {
            Start::Connect(url) => {
                tokio::spawn(async move {
                    match connect_async(url.as_str()).await {
                        Ok((ws, _)) => {
                            info!("Connected to signaling server: {}", url);
                            pump(ws, queue, state, sink).await;
                        }
                        Err(e) => {
                            warn!("WebSocket connection to {} failed: {}", url, e);
                            queue.close();
                            state.send_replace(SocketState::Closed);
                        }
                    }
                });
            }
            Start::Accepted(ws) => {
                tokio::spawn(pump(ws, queue, state, sink));
            }
        }
    }

    fn ready(&self) -> bool {
        self.queue.is_open()
    }
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    queue: Arc<SendQueue>,
    state: Arc<watch::Sender<SocketState>>,
    sink: InboundSink,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let flushed = queue.open(tx);
    state.send_replace(SocketState::Open);
    debug!("WebSocket open, flushed {} queued messages", flushed);

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(wire) => {
                    if let Err(e) = ws_sink.send(Message::Text(wire)).await {
                        warn!("WebSocket send failed: {}", e);
                        break;
                    }
                }
                // Queue closed locally: everything buffered has been written
                None => {
                    let _ = ws_sink.close().await;
                    break;
                }
            },
            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => sink(text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive failed: {}", e);
                    break;
                }
            },
        }
    }

    queue.close();
    state.send_replace(SocketState::Closed);
    debug!("WebSocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{method_not_found, RpcEngine};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unreachable_server_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Arc::new(WebSocketTransport::connect(format!("ws://{}", addr)));
        let _engine = RpcEngine::new(transport.clone(), method_not_found());

        assert!(transport.wait_open().await.is_err());
        assert_eq!(transport.state(), SocketState::Closed);
        assert!(!transport.ready());
    }

    #[tokio::test]
    async fn test_messages_sent_before_open_are_flushed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = Arc::new(WebSocketTransport::connect(format!("ws://{}", addr)));
        transport.send("first".into());
        transport.send("second".into());
        assert!(!transport.ready());

        let engine = RpcEngine::new(transport.clone(), method_not_found());

        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        transport.wait_open().await.unwrap();
        assert!(engine.is_ready());

        let mut received = Vec::new();
        while received.len() < 2 {
            if let Some(Ok(Message::Text(text))) = server.next().await {
                received.push(text);
            }
        }
        assert_eq!(received, vec!["first".to_string(), "second".to_string()]);
    }
}
