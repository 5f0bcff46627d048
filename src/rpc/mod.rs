// Transport-agnostic JSON-RPC layer

pub mod codec;
pub mod engine;
pub mod error;
pub mod transport;

pub use codec::{decode, Encoding, RpcEnvelope, RpcId};
pub use engine::{
    handler, method_not_found, method_not_found_error, PendingCall, RequestHandler, RpcEngine,
    RpcRequest, WeakRpcEngine, FALLBACK_METHOD,
};
pub(crate) use engine::{invalid_params, named_param};
pub use error::RpcError;
pub use transport::{InboundSink, Transport};
