//! JSON-RPC plumbing shared by the relay plane (`iridium_*` calls over the
//! socket) and the payload plane (encrypted `wc_*` messages between peers).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A JSON-RPC request id.
///
/// Some peer implementations emit ids as floating point numbers with a zero
/// fraction; those are accepted on inbound. Outbound ids are always emitted
/// as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId(pub u64);

impl Serialize for RpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for RpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = serde_json::Number::deserialize(deserializer)?;
        if let Some(u) = n.as_u64() {
            return Ok(RpcId(u));
        }
        if let Some(f) = n.as_f64() {
            if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 {
                return Ok(RpcId(f as u64));
            }
        }
        Err(serde::de::Error::custom(format!("invalid rpc id: {n}")))
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RpcId {
    fn from(value: u64) -> Self {
        RpcId(value)
    }
}

/// Allocates process-unique, strictly monotonic request ids.
///
/// Seeded from wall-clock nanoseconds the way the relay expects, with the
/// monotonicity guard taking over if the clock stalls or goes backwards.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> RpcId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let candidate = now * 1_000_000;
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(candidate.max(prev + 1))
            })
            .expect("fetch_update closure never returns None");
        RpcId(candidate.max(prev + 1))
    }
}

/// A JSON-RPC 2.0 request on the relay plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest<P = Value> {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<P>,
    pub id: RpcId,
}

impl JsonRpcRequest<Value> {
    pub fn new(id: RpcId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id,
        }
    }
}

/// A JSON-RPC 2.0 response carrying either a result or an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse<R = Value> {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub id: Option<RpcId>,
}

impl JsonRpcResponse<Value> {
    pub fn result(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(id: RpcId, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcErrorObject {
                code,
                message: message.to_string(),
                data: None,
            }),
            id: Some(id),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound frame before we know whether it is a request or a response.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub id: Option<RpcId>,
}

impl InboundFrame {
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }
}

/// The decrypted payload-plane message exchanged between peers over a topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message<T = Value> {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
    pub id: RpcId,
}

impl Message<Value> {
    pub fn request(id: RpcId, method: &str, params: Value) -> Self {
        Message {
            jsonrpc: "2.0".to_string(),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
            id,
        }
    }

    pub fn response(id: RpcId, result: Value) -> Self {
        Message {
            jsonrpc: "2.0".to_string(),
            method: None,
            params: None,
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error_response(id: RpcId, code: i64, message: &str) -> Self {
        Message {
            jsonrpc: "2.0".to_string(),
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcErrorObject {
                code,
                message: message.to_string(),
                data: None,
            }),
            id,
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }
}

// Relay plane parameter shapes.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub id: String,
    pub topic: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishParams {
    pub topic: String,
    pub message: String,
    pub ttl: u64,
    pub tag: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub id: String,
    pub data: SubscriptionData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub topic: String,
    pub message: String,
    #[serde(rename = "publishedAt", default)]
    pub published_at: Option<u64>,
    #[serde(default)]
    pub tag: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_accepts_integer_and_zero_fraction_float() {
        let id: RpcId = serde_json::from_str("1743510684985756").unwrap();
        assert_eq!(id, RpcId(1743510684985756));

        let id: RpcId = serde_json::from_str("1743510684985756.0").unwrap();
        assert_eq!(id, RpcId(1743510684985756));

        assert!(serde_json::from_str::<RpcId>("12.5").is_err());
        assert!(serde_json::from_str::<RpcId>("-3").is_err());
    }

    #[test]
    fn id_serializes_as_integer() {
        let s = serde_json::to_string(&RpcId(42)).unwrap();
        assert_eq!(s, "42");
    }

    #[test]
    fn generator_is_strictly_monotonic() {
        let generator = IdGenerator::new();
        let mut prev = generator.next().0;
        for _ in 0..1000 {
            let next = generator.next().0;
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn request_omits_absent_params() {
        let req = JsonRpcRequest::<Value> {
            jsonrpc: "2.0".to_string(),
            method: "iridium_subscribe".to_string(),
            params: None,
            id: RpcId(7),
        };
        let s = serde_json::to_string(&req).unwrap();
        assert!(!s.contains("params"));
    }

    #[test]
    fn inbound_frame_discriminates_request_and_response() {
        let frame: InboundFrame = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "iridium_subscription",
            "params": {"id": "sub", "data": {"topic": "t", "message": "m"}},
            "id": 1
        }))
        .unwrap();
        assert!(frame.is_request());

        let frame: InboundFrame = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "result": true,
            "id": 1
        }))
        .unwrap();
        assert!(!frame.is_request());
    }

    #[test]
    fn message_roundtrip_preserves_shape() {
        let msg = Message::request(RpcId(5), "wc_pairingPing", json!({}));
        let s = serde_json::to_string(&msg).unwrap();
        assert!(!s.contains("result"));
        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back, msg);
    }
}
