//! Data structures modelling Deribit JSON-RPC request and response payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ustr::Ustr;

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound JSON-RPC 2.0 request envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    /// Creates a new request envelope.
    ///
    /// `params` must be a JSON object; callers validate before construction.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a JSON-RPC response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound JSON-RPC 2.0 response envelope.
///
/// Deribit decorates responses with microsecond timing fields (`usIn`,
/// `usOut`, `usDiff`) and a `testnet` marker; they are carried opaquely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, rename = "usIn", skip_serializing_if = "Option::is_none")]
    pub us_in: Option<u64>,
    #[serde(default, rename = "usOut", skip_serializing_if = "Option::is_none")]
    pub us_out: Option<u64>,
    #[serde(default, rename = "usDiff", skip_serializing_if = "Option::is_none")]
    pub us_diff: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testnet: Option<bool>,
}

/// Unsolicited server→client message (no `id`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationMsg {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Any inbound frame after JSON decoding.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeribitWsEvent {
    /// A reply to an in-flight request, matched by id.
    Response(JsonRpcResponse),
    /// A subscription push or heartbeat control message.
    Notification(NotificationMsg),
}

/// Subscription payload carried by `method == "subscription"` notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub channel: Ustr,
    pub data: Value,
}

/// Decoded meaning of a [`NotificationMsg`].
#[derive(Clone, Debug, PartialEq)]
pub enum NotificationKind {
    /// Channel data delivery.
    Subscription(SubscriptionParams),
    /// Plain heartbeat, swallowed by the transport.
    Heartbeat,
    /// The server wants a `public/test` response.
    TestRequest,
    /// Anything else; surfaced for observability only.
    Other(String),
}

impl NotificationMsg {
    /// Decodes the notification into its control meaning.
    #[must_use]
    pub fn kind(&self) -> NotificationKind {
        match self.method.as_str() {
            "subscription" => match self
                .params
                .clone()
                .map(serde_json::from_value::<SubscriptionParams>)
            {
                Some(Ok(params)) => NotificationKind::Subscription(params),
                _ => NotificationKind::Other("subscription without channel/data".to_string()),
            },
            "heartbeat" => {
                let hb_type = self
                    .params
                    .as_ref()
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str);
                match hb_type {
                    Some("test_request") => NotificationKind::TestRequest,
                    _ => NotificationKind::Heartbeat,
                }
            }
            // Legacy servers emit a bare test_request method.
            "test_request" => NotificationKind::TestRequest,
            other => NotificationKind::Other(other.to_string()),
        }
    }
}

/// Result payload of a `public/auth` grant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeribitAuthResult {
    pub access_token: String,
    pub refresh_token: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Result payload of `public/hello`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeribitHelloResult {
    pub version: String,
}

/// Result payload of `public/status`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeribitStatusResult {
    /// Platform lock state; `"true"`, `"partial"` or `"false"`.
    #[serde(default)]
    pub locked: Option<Value>,
    #[serde(default)]
    pub locked_indices: Option<Vec<String>>,
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn test_request_encode_decode_round_trip() {
        let request = JsonRpcRequest::new(42, "public/get_time", json!({}));
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: JsonRpcRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
        assert!(encoded.contains("\"jsonrpc\":\"2.0\""));
        assert!(encoded.contains("\"method\":\"public/get_time\""));
    }

    #[rstest]
    fn test_response_result_envelope() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"result":1550147385946,"usIn":1,"usOut":2,"usDiff":1,"testnet":true}"#;
        let event: DeribitWsEvent = serde_json::from_str(raw).unwrap();
        match event {
            DeribitWsEvent::Response(resp) => {
                assert_eq!(resp.id, 7);
                assert_eq!(resp.result, Some(json!(1550147385946_u64)));
                assert!(resp.error.is_none());
                assert_eq!(resp.testnet, Some(true));
            }
            DeribitWsEvent::Notification(_) => panic!("expected response"),
        }
    }

    #[rstest]
    fn test_response_error_envelope() {
        let raw = r#"{"jsonrpc":"2.0","id":8,"error":{"code":13009,"message":"invalid_token"}}"#;
        let event: DeribitWsEvent = serde_json::from_str(raw).unwrap();
        match event {
            DeribitWsEvent::Response(resp) => {
                let error = resp.error.unwrap();
                assert_eq!(error.code, 13009);
                assert_eq!(error.message, "invalid_token");
                assert!(error.data.is_none());
            }
            DeribitWsEvent::Notification(_) => panic!("expected response"),
        }
    }

    #[rstest]
    fn test_subscription_notification() {
        let raw = r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"ticker.BTC-PERPETUAL.100ms","data":{"last_price":50000.0}}}"#;
        let event: DeribitWsEvent = serde_json::from_str(raw).unwrap();
        let DeribitWsEvent::Notification(msg) = event else {
            panic!("expected notification");
        };
        match msg.kind() {
            NotificationKind::Subscription(params) => {
                assert_eq!(params.channel.as_str(), "ticker.BTC-PERPETUAL.100ms");
                assert_eq!(params.data["last_price"], json!(50000.0));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[rstest]
    #[case(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#, NotificationKind::TestRequest)]
    #[case(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"heartbeat"}}"#, NotificationKind::Heartbeat)]
    #[case(r#"{"method":"test_request"}"#, NotificationKind::TestRequest)]
    fn test_heartbeat_kinds(#[case] raw: &str, #[case] expected: NotificationKind) {
        let event: DeribitWsEvent = serde_json::from_str(raw).unwrap();
        let DeribitWsEvent::Notification(msg) = event else {
            panic!("expected notification");
        };
        assert_eq!(msg.kind(), expected);
    }

    #[rstest]
    fn test_auth_result_payload() {
        let raw = r#"{"access_token":"at","refresh_token":"rt","expires_in":900,"scope":"session:default","token_type":"bearer"}"#;
        let result: DeribitAuthResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.expires_in, 900);
        assert_eq!(result.scope, "session:default");
    }
}
