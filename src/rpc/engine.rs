// Bidirectional JSON-RPC engine
// Correlates outgoing calls with their responses and dispatches inbound calls
// to an injected request handler. Knows nothing about the channel underneath.

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::codec::{self, Encoding, RpcEnvelope, RpcId};
use super::{RpcError, Transport};
use crate::poison::{lock, read, write};

/// Method name reserved for tunneling one engine's traffic through another
pub const FALLBACK_METHOD: &str = "fallback";

/// Inbound call or notification handed to the request handler
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    /// `None` for notifications, which never get a response
    pub id: Option<RpcId>,
    pub params: Value,
}

/// Resolves to the result value, or to the error value sent back to the caller
pub type RequestHandler =
    Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

/// Wrap an async closure as a [`RequestHandler`]
pub fn handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
    Arc::new(move |request| f(request).boxed())
}

/// Handler that rejects every inbound call
pub fn method_not_found() -> RequestHandler {
    handler(|request: RpcRequest| async move { Err(method_not_found_error(&request.method)) })
}

/// Error object for a method the handler does not serve
pub fn method_not_found_error(method: &str) -> Value {
    json!({
        "code": -32601,
        "message": format!("method not found: {}", method),
    })
}

pub(crate) fn invalid_params(message: impl Into<String>) -> Value {
    json!({
        "code": -32602,
        "message": message.into(),
    })
}

/// Read a string parameter given either by name or as the only positional one
pub(crate) fn named_param(params: &Value, name: &str) -> Option<String> {
    match params {
        Value::Object(map) => map.get(name)?.as_str().map(str::to_string),
        Value::Array(items) if items.len() == 1 => items[0].as_str().map(str::to_string),
        _ => None,
    }
}

type Settle = oneshot::Sender<Result<Value, RpcError>>;

/// An outgoing call whose response has not arrived yet
#[derive(Debug)]
pub struct PendingCall {
    id: RpcId,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingCall {
    pub fn id(&self) -> &RpcId {
        &self.id
    }

    pub async fn wait(self) -> Result<Value, RpcError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Closed),
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    handler: RwLock<RequestHandler>,
    pending: Mutex<HashMap<String, Settle>>,
    next_id: AtomicU64,
}

/// Cheaply clonable handle to one engine. All clones share the pending-call table.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<Inner>,
}

/// Non-owning handle, used where the engine must refer back to itself
#[derive(Clone)]
pub struct WeakRpcEngine {
    inner: Weak<Inner>,
}

impl WeakRpcEngine {
    pub fn upgrade(&self) -> Option<RpcEngine> {
        self.inner.upgrade().map(|inner| RpcEngine { inner })
    }
}

impl fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcEngine")
            .field("ready", &self.is_ready())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl RpcEngine {
    /// Bind a new engine to `transport`. The transport starts delivering
    /// inbound messages immediately.
    pub fn new(transport: Arc<dyn Transport>, handler: RequestHandler) -> Self {
        let inner = Arc::new(Inner {
            transport,
            handler: RwLock::new(handler),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.on_receive(Arc::new(move |raw: String| {
            if let Some(inner) = weak.upgrade() {
                RpcEngine { inner }.on_message(&raw);
            }
        }));

        Self { inner }
    }

    pub fn downgrade(&self) -> WeakRpcEngine {
        WeakRpcEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.transport.ready()
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Replace the inbound request handler, returning the previous one.
    /// Calls already dispatched keep running against the old handler.
    pub fn rebind(&self, handler: RequestHandler) -> RequestHandler {
        std::mem::replace(&mut *write(&self.inner.handler), handler)
    }

    /// Build the new handler from the current one while holding the handler
    /// lock, so no inbound call observes a half-installed chain
    pub fn rebind_with<F>(&self, wrap: F)
    where
        F: FnOnce(RequestHandler) -> RequestHandler,
    {
        let mut slot = write(&self.inner.handler);
        let next = wrap(slot.clone());
        *slot = next;
    }

    /// Encode a notification without sending it, e.g. to render it as a QR code
    pub fn notify(&self, method: &str, params: Value, reduced: bool) -> Result<String, RpcError> {
        reject_reserved(method)?;
        RpcEnvelope::Notification {
            method: method.to_string(),
            params,
        }
        .encode(Encoding::from_reduced(reduced))
    }

    /// Encode a notification and hand it to the transport
    pub fn push(&self, method: &str, params: Value, reduced: bool) -> Result<String, RpcError> {
        let wire = self.notify(method, params, reduced)?;
        self.inner.transport.send(wire.clone());
        Ok(wire)
    }

    /// Call `method` with positional arguments
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_raw(method, Value::Array(args), false, None).await
    }

    /// Call `method` with raw params. `id` overrides the engine's own counter.
    /// There is no timeout: a call that is never answered stays pending.
    pub async fn call_raw(
        &self,
        method: &str,
        params: Value,
        reduced: bool,
        id: Option<RpcId>,
    ) -> Result<Value, RpcError> {
        self.begin_call(method, params, reduced, id)?.wait().await
    }

    /// Send a call right away and hand back the waiter. Calls begun in order
    /// reach the transport in that order.
    pub fn begin_call(
        &self,
        method: &str,
        params: Value,
        reduced: bool,
        id: Option<RpcId>,
    ) -> Result<PendingCall, RpcError> {
        let (wire, pending) = self.start_call(method, params, reduced, id)?;
        self.inner.transport.send(wire);
        Ok(pending)
    }

    /// Register a pending call and return its encoded form without sending it.
    /// The answer is expected to come back through [`RpcEngine::on_message`].
    pub fn start_call(
        &self,
        method: &str,
        params: Value,
        reduced: bool,
        id: Option<RpcId>,
    ) -> Result<(String, PendingCall), RpcError> {
        reject_reserved(method)?;
        self.prepare_call(method, params, reduced, id)
    }

    /// Send `wire` as the single parameter of a `fallback` call
    pub(crate) fn tunnel(&self, wire: String) -> Result<PendingCall, RpcError> {
        let (outer, pending) = self.prepare_call(FALLBACK_METHOD, json!([wire]), false, None)?;
        self.inner.transport.send(outer);
        Ok(pending)
    }

    fn prepare_call(
        &self,
        method: &str,
        params: Value,
        reduced: bool,
        id: Option<RpcId>,
    ) -> Result<(String, PendingCall), RpcError> {
        let id = id.unwrap_or_else(|| RpcId::from(self.inner.next_id.fetch_add(1, Ordering::Relaxed)));
        let wire = RpcEnvelope::Call {
            method: method.to_string(),
            id: id.clone(),
            params,
        }
        .encode(Encoding::from_reduced(reduced))?;

        let (tx, rx) = oneshot::channel();
        if lock(&self.inner.pending).insert(id.key(), tx).is_some() {
            debug!("Call id {} reused before its response arrived", id);
        }

        Ok((wire, PendingCall { id, rx }))
    }

    /// Round trip that must be answered with the literal string `"pong"`
    pub async fn ping(&self) -> Result<(), RpcError> {
        match self.call("ping", Vec::new()).await? {
            Value::String(s) if s == "pong" => Ok(()),
            other => Err(RpcError::ProtocolViolation(format!(
                "ping answered with {}",
                other
            ))),
        }
    }

    /// Feed one inbound wire string. Undecodable payloads and responses for
    /// unknown ids are logged and dropped.
    pub fn on_message(&self, raw: &str) {
        let envelope = match codec::decode(raw) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                return;
            }
        };

        let encoding = Encoding::detect(raw);
        match envelope {
            RpcEnvelope::Notification { method, params } => self.dispatch(
                RpcRequest {
                    method,
                    id: None,
                    params,
                },
                encoding,
            ),
            RpcEnvelope::Call { method, id, params } => self.dispatch(
                RpcRequest {
                    method,
                    id: Some(id),
                    params,
                },
                encoding,
            ),
            RpcEnvelope::Result { id, result } => self.settle(&id, Ok(result)),
            RpcEnvelope::Error { id, error } => self.settle(&id, Err(RpcError::Remote(error))),
        }
    }

    fn settle(&self, id: &RpcId, outcome: Result<Value, RpcError>) {
        let entry = lock(&self.inner.pending).remove(&id.key());
        match entry {
            Some(tx) => {
                // Receiver may be gone if the caller stopped waiting
                let _ = tx.send(outcome);
            }
            None => warn!("Ignoring response for unknown call id {}", id),
        }
    }

    // Responses are written in the encoding the request arrived in
    fn dispatch(&self, request: RpcRequest, encoding: Encoding) {
        let handler = read(&self.inner.handler).clone();
        let engine = self.clone();

        tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();
            let outcome = handler(request).await;

            let Some(id) = id else {
                if let Err(error) = outcome {
                    debug!("Notification {} failed: {}", method, error);
                }
                return;
            };

            let envelope = match outcome {
                Ok(result) => RpcEnvelope::Result { id, result },
                Err(error) => {
                    debug!("Call {} failed: {}", method, error);
                    RpcEnvelope::Error { id, error }
                }
            };
            match envelope.encode(encoding) {
                Ok(wire) => engine.inner.transport.send(wire),
                Err(e) => warn!("Failed to encode response to {}: {}", method, e),
            }
        });
    }
}

fn reject_reserved(method: &str) -> Result<(), RpcError> {
    if method == FALLBACK_METHOD {
        return Err(RpcError::ReservedMethod(method.to_string()));
    }
    Ok(())
}
