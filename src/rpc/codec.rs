// RPC envelope codec
// Full JSON-RPC 2.0 form plus the pipe-delimited reduced form used for QR payloads

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

use super::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

const DELIMITER: char = '|';

/// Call identifier: numeric for engine-allocated ids, string for caller-supplied ones.
/// Any JSON number is accepted from the remote side, including negative and
/// fractional ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(Number),
    Str(String),
}

impl RpcId {
    /// Reduced-form ids are all digits when numeric, anything else stays a string
    pub fn parse(raw: &str) -> Self {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = raw.parse::<u64>() {
                return RpcId::from(n);
            }
        }
        RpcId::Str(raw.to_string())
    }

    /// Key used by the pending-call table, so `42` and `"42"` correlate
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{}", n),
            RpcId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        RpcId::Number(n.into())
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        RpcId::Str(s.to_string())
    }
}

impl From<String> for RpcId {
    fn from(s: String) -> Self {
        RpcId::Str(s)
    }
}

/// One decoded RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEnvelope {
    Notification { method: String, params: Value },
    Call { method: String, id: RpcId, params: Value },
    Result { id: RpcId, result: Value },
    Error { id: RpcId, error: Value },
}

/// Wire representation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Full,
    Reduced,
}

impl Encoding {
    pub fn from_reduced(reduced: bool) -> Self {
        if reduced {
            Encoding::Reduced
        } else {
            Encoding::Full
        }
    }

    /// Reduced payloads never start with `{`
    pub fn detect(raw: &str) -> Self {
        if raw.starts_with('{') {
            Encoding::Full
        } else {
            Encoding::Reduced
        }
    }
}

#[derive(Serialize)]
struct FullOut<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a Value>,
}

impl RpcEnvelope {
    pub fn id(&self) -> Option<&RpcId> {
        match self {
            RpcEnvelope::Notification { .. } => None,
            RpcEnvelope::Call { id, .. }
            | RpcEnvelope::Result { id, .. }
            | RpcEnvelope::Error { id, .. } => Some(id),
        }
    }

    pub fn encode(&self, encoding: Encoding) -> Result<String, RpcError> {
        match encoding {
            Encoding::Full => self.encode_full(),
            Encoding::Reduced => self.encode_reduced(),
        }
    }

    pub fn encode_full(&self) -> Result<String, RpcError> {
        let mut out = FullOut {
            jsonrpc: JSONRPC_VERSION,
            method: None,
            id: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            RpcEnvelope::Notification { method, params } => {
                out.method = Some(method);
                out.params = Some(params);
            }
            RpcEnvelope::Call { method, id, params } => {
                out.method = Some(method);
                out.id = Some(id);
                out.params = Some(params);
            }
            RpcEnvelope::Result { id, result } => {
                out.id = Some(id);
                out.result = Some(result);
            }
            RpcEnvelope::Error { id, error } => {
                out.id = Some(id);
                out.error = Some(error);
            }
        }
        Ok(serde_json::to_string(&out)?)
    }

    /// `method|id|params` for calls (empty id for notifications), `|id|result` for results.
    /// Errors have no reduced form and are written in full.
    pub fn encode_reduced(&self) -> Result<String, RpcError> {
        match self {
            RpcEnvelope::Notification { method, params } => {
                check_reduced_method(method)?;
                Ok(format!("{}||{}", method, serde_json::to_string(params)?))
            }
            RpcEnvelope::Call { method, id, params } => {
                check_reduced_method(method)?;
                let id = id.to_string();
                check_reduced_id(&id)?;
                Ok(format!("{}|{}|{}", method, id, serde_json::to_string(params)?))
            }
            RpcEnvelope::Result { id, result } => {
                let id = id.to_string();
                check_reduced_id(&id)?;
                Ok(format!("|{}|{}", id, serde_json::to_string(result)?))
            }
            RpcEnvelope::Error { .. } => self.encode_full(),
        }
    }
}

// The reduced decoder trusts that method and id never contain the delimiter
fn check_reduced_field(field: &str) -> Result<(), RpcError> {
    if field.contains(DELIMITER) {
        return Err(RpcError::Decode(format!(
            "`{}` cannot be carried in reduced form",
            field
        )));
    }
    Ok(())
}

// An empty method reads back as a result, a leading `{` as a full envelope
fn check_reduced_method(method: &str) -> Result<(), RpcError> {
    if method.is_empty() || method.starts_with('{') {
        return Err(RpcError::Decode(format!(
            "method `{}` cannot be carried in reduced form",
            method
        )));
    }
    check_reduced_field(method)
}

// An empty id reads back as a notification
fn check_reduced_id(id: &str) -> Result<(), RpcError> {
    if id.is_empty() {
        return Err(RpcError::Decode("reduced calls and results need an id".into()));
    }
    check_reduced_field(id)
}

/// Decode either wire form. Empty input means "no message".
pub fn decode(raw: &str) -> Result<Option<RpcEnvelope>, RpcError> {
    if raw.is_empty() {
        return Ok(None);
    }
    match Encoding::detect(raw) {
        Encoding::Full => decode_full(raw).map(Some),
        Encoding::Reduced => decode_reduced(raw).map(Some),
    }
}

fn decode_full(raw: &str) -> Result<RpcEnvelope, RpcError> {
    let mut obj: Map<String, Value> = serde_json::from_str(raw)?;

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value::<RpcId>(value)
                .map_err(|_| RpcError::Decode("id must be a number or string".into()))?,
        ),
    };

    if let Some(method) = obj.remove("method") {
        let method = method
            .as_str()
            .ok_or_else(|| RpcError::Decode("method must be a string".into()))?
            .to_string();
        let params = obj.remove("params").unwrap_or(Value::Null);
        return Ok(match id {
            Some(id) => RpcEnvelope::Call { method, id, params },
            None => RpcEnvelope::Notification { method, params },
        });
    }

    let result = obj.remove("result");
    let error = obj.remove("error");
    let id = id.ok_or_else(|| RpcError::Decode("response without id".into()))?;
    match (result, error) {
        (Some(_), Some(_)) => Err(RpcError::Decode(
            "envelope carries both result and error".into(),
        )),
        (Some(result), None) => Ok(RpcEnvelope::Result { id, result }),
        (None, Some(error)) => Ok(RpcEnvelope::Error { id, error }),
        (None, None) => Err(RpcError::Decode(
            "envelope has neither method, result nor error".into(),
        )),
    }
}

fn decode_reduced(raw: &str) -> Result<RpcEnvelope, RpcError> {
    // splitn keeps every delimiter after the second inside the data segment,
    // so JSON payloads containing `|` survive intact
    let mut parts = raw.splitn(3, DELIMITER);
    let method = parts.next().unwrap_or_default();
    let id = parts
        .next()
        .ok_or_else(|| RpcError::Decode(format!("missing id segment in `{}`", raw)))?;
    let data = parts
        .next()
        .ok_or_else(|| RpcError::Decode(format!("missing data segment in `{}`", raw)))?;

    let data = if data.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(data)?
    };

    match (method.is_empty(), id.is_empty()) {
        (true, true) => Err(RpcError::Decode("result without id".into())),
        (true, false) => Ok(RpcEnvelope::Result {
            id: RpcId::parse(id),
            result: data,
        }),
        (false, true) => Ok(RpcEnvelope::Notification {
            method: method.to_string(),
            params: data,
        }),
        (false, false) => Ok(RpcEnvelope::Call {
            method: method.to_string(),
            id: RpcId::parse(id),
            params: data,
        }),
    }
}
