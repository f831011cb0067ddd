//! JSON-RPC 2.0 wire types used by every transport.
//!
//! One serialized message per frame; batching is deliberately not supported.
//! The envelope is direction-agnostic: the same four shapes flow
//! client-to-server and server-to-client, and correlation happens purely by
//! [`RequestId`].

use std::{borrow::Cow, fmt::Display, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

pub const PING_METHOD: &str = "ping";
pub const INITIALIZE_METHOD: &str = "initialize";
pub const INITIALIZED_NOTIFICATION_METHOD: &str = "notifications/initialized";
pub const CANCELLED_NOTIFICATION_METHOD: &str = "notifications/cancelled";
pub const PROGRESS_NOTIFICATION_METHOD: &str = "notifications/progress";

/// The literal `"jsonrpc": "2.0"` marker. Deserialization rejects any other
/// value, which is what makes a syntactically valid JSON object that is not a
/// JSON-RPC 2.0 message fail as a [`ParseError`](ErrorCode::PARSE_ERROR)
/// for that frame only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        match version.as_ref() {
            "2.0" => Ok(Self),
            other => Err(de::Error::custom(format!(
                "unsupported jsonrpc version: {other:?}"
            ))),
        }
    }
}

/// A request id: string or integer per the JSON-RPC spec.
///
/// Each side of a session allocates its own ids from a monotonic counter, so
/// ids never collide within one session and one direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(u32),
    String(Arc<str>),
}

pub type RequestId = NumberOrString;

/// Progress tokens share the string-or-integer representation of request ids.
pub type ProgressToken = NumberOrString;

impl Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => n.fmt(f),
            NumberOrString::String(s) => s.fmt(f),
        }
    }
}

impl From<u32> for NumberOrString {
    fn from(value: u32) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<String> for NumberOrString {
    fn from(value: String) -> Self {
        NumberOrString::String(value.into())
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.into())
    }
}

/// Standard JSON-RPC error codes plus the MCP extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    pub const RESOURCE_NOT_FOUND: Self = Self(-32002);
    pub const REQUEST_CANCELLED: Self = Self(-32800);
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, None)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, None)
    }

    pub fn request_cancelled(reason: Option<String>) -> Self {
        Self::new(
            ErrorCode::REQUEST_CANCELLED,
            reason
                .map(Cow::Owned)
                .unwrap_or(Cow::Borrowed("request cancelled")),
            None,
        )
    }
}

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({data})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    /// `null` when the failing message could not even be attributed to a
    /// request, e.g. a parse error.
    #[serde(default)]
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

/// One frame on the wire. Untagged: the variant is recovered from the shape,
/// requests before notifications so the `id` field decides between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(id: impl Into<Option<RequestId>>, error: ErrorData) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            error,
        })
    }

    pub fn into_request(self) -> Option<JsonRpcRequest> {
        match self {
            JsonRpcMessage::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn into_notification(self) -> Option<JsonRpcNotification> {
        match self {
            JsonRpcMessage::Notification(notification) => Some(notification),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<JsonRpcResponse> {
        match self {
            JsonRpcMessage::Response(response) => Some(response),
            _ => None,
        }
    }

    /// The request id this frame is correlated to, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }
}

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParam {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Params of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParam {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A protocol revision date, e.g. `2025-03-26`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(Cow<'static, str>);

impl ProtocolVersion {
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    pub const V_2025_06_18: Self = Self(Cow::Borrowed("2025-06-18"));
    pub const LATEST: Self = Self::V_2025_06_18;

    pub const SUPPORTED: &'static [Self] =
        &[Self::V_2024_11_05, Self::V_2025_03_26, Self::V_2025_06_18];

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProtocolVersion {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

/// Name and version of one endpoint's implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Params of the client's `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParam {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: JsonObject,
    pub client_info: Implementation,
}

impl Default for InitializeRequestParam {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: JsonObject::default(),
            client_info: Implementation::default(),
        }
    }
}

/// Result of the server's `initialize` response; also used as the server-side
/// configuration handed to `serve_server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: JsonObject,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Default for InitializeResult {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: JsonObject::default(),
            server_info: Implementation::default(),
            instructions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_round_trip() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let message: JsonRpcMessage = serde_json::from_str(raw).unwrap();
        let JsonRpcMessage::Request(request) = &message else {
            panic!("expected request, got {message:?}");
        };
        assert_eq!(request.id, NumberOrString::Number(1));
        assert_eq!(request.method, "ping");
        assert_eq!(serde_json::to_string(&message).unwrap(), raw);
    }

    #[test]
    fn notification_has_no_id() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": "r-1", "reason": "user"}
        }))
        .unwrap();
        let notification = message.into_notification().unwrap();
        let params: CancelledNotificationParam =
            serde_json::from_value(notification.params.unwrap()).unwrap();
        assert_eq!(params.request_id, "r-1".into());
        assert_eq!(params.reason.as_deref(), Some("user"));
    }

    #[test]
    fn error_with_null_id() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "bad frame"}
        }))
        .unwrap();
        let JsonRpcMessage::Error(error) = message else {
            panic!("expected error");
        };
        assert_eq!(error.id, None);
        assert_eq!(error.error.code, ErrorCode::PARSE_ERROR);
    }

    #[test]
    fn rejects_wrong_jsonrpc_version() {
        let result = serde_json::from_value::<JsonRpcMessage>(json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": "ping"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_request_without_method() {
        // Valid JSON, invalid JSON-RPC: no method, no result, no error.
        let result = serde_json::from_value::<JsonRpcMessage>(json!({
            "jsonrpc": "2.0",
            "id": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn response_and_request_are_distinguished() {
        let response: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {}
        }))
        .unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn protocol_version_support() {
        assert!(ProtocolVersion::V_2024_11_05.is_supported());
        assert!(!ProtocolVersion::from("2023-01-01".to_string()).is_supported());
    }

    #[test]
    fn initialize_result_wire_names() {
        let value = serde_json::to_value(InitializeResult::default()).unwrap();
        assert!(value.get("protocolVersion").is_some());
        assert!(value.get("serverInfo").is_some());
    }
}
