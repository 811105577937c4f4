//! JSON-RPC envelopes: request parsing, response / error / event construction.
//!
//! Stateless. Every outbound envelope carries the protocol version tag the
//! caller passes in; the registry decides which version that is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::error::{BrokerError, ResultCode};

/// Version tag used until a page announces its own.
pub const DEFAULT_JSONRPC_VERSION: &str = "2.0";

/// `data.handle` value when no handle is known.
pub const NO_HANDLE: i64 = -1;

/// Request identifier: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Str(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

/// Protocol methods understood by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    OpenClient,
    OpenDevice,
    Close,
    GetProperty,
    SetProperty,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "openclient" => Self::OpenClient,
            "opendevice" => Self::OpenDevice,
            "close" => Self::Close,
            "getproperty" => Self::GetProperty,
            "setproperty" => Self::SetProperty,
            _ => return None,
        })
    }
}

/// Inbound request as sent by a page.
///
/// Fields are lenient: presence and shape are checked by the interpreter so
/// that each failure maps to its own error kind.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

/// A request whose `handle` and integer `id` were both present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified {
    pub handle: i64,
    pub id: i64,
}

impl Request {
    /// Parse payload text. Anything other than a JSON object is malformed.
    pub fn from_text(text: &str) -> Result<Self, BrokerError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BrokerError::MalformedJson(format!("Could not parse JSON payload: {e}")))?;
        if !value.is_object() {
            return Err(BrokerError::MalformedJson(
                "Could not convert JSON string to JSON dictionary".into(),
            ));
        }
        serde_json::from_value(value).map_err(|e| BrokerError::MalformedJson(e.to_string()))
    }

    pub fn method(&self) -> Result<Method, BrokerError> {
        self.method
            .as_deref()
            .and_then(Method::parse)
            .ok_or_else(|| {
                BrokerError::MalformedJson(
                    "The JSON RPC object did not contain the expected key-value pair: 'method'"
                        .into(),
                )
            })
    }

    /// Request id as echoed back, whatever its JSON shape.
    pub fn request_id(&self) -> Option<RequestId> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_i64().map(RequestId::Int),
            Value::String(s) => Some(RequestId::Str(s.clone())),
            _ => None,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref()?.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    pub fn params_or_empty(&self) -> Map<String, Value> {
        self.params.clone().unwrap_or_default()
    }

    /// Require an integer `params.handle` and an integer `id`.
    ///
    /// A missing handle reports no id; a missing id reports the handle.
    pub fn verify(&self) -> Result<Verified, (BrokerError, Option<i64>)> {
        let handle = self
            .param("handle")
            .and_then(Value::as_i64)
            .ok_or((BrokerError::InvalidHandle(BrokerError::HANDLE_NOT_SPECIFIED), None))?;
        let id = self
            .id
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                (
                    BrokerError::InvalidParameter("The id was not specified".into()),
                    Some(handle),
                )
            })?;
        Ok(Verified { handle, id })
    }
}

/// `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ResultCode,
    pub message: String,
    pub data: ErrorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub handle: i64,
}

/// Outbound envelope: a reply, an error, or an event notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(version: &str, id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: version.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Success carrying `{handle}`.
    pub fn handle(version: &str, id: Option<RequestId>, handle: i64) -> Self {
        Self::success(version, id, json!({ "handle": handle }))
    }

    pub fn error(
        version: &str,
        code: ResultCode,
        message: impl Into<String>,
        handle: Option<i64>,
        id: Option<RequestId>,
    ) -> Self {
        Self {
            jsonrpc: version.to_owned(),
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: ErrorData {
                    handle: handle.unwrap_or(NO_HANDLE),
                },
            }),
        }
    }

    /// Error envelope for a broker error, code and message from the error.
    pub fn from_error(
        version: &str,
        error: &BrokerError,
        handle: Option<i64>,
        id: Option<RequestId>,
    ) -> Self {
        Self::error(version, error.code(), error.to_string(), handle, id)
    }

    /// Unsolicited event notification: `{result: {handle, event}}`, no id.
    pub fn event(version: &str, handle: i64, event: Event) -> Self {
        Self::success(version, None, json!({ "handle": handle, "event": event }))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    #[cfg(test)]
    pub fn from_text(text: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(text).map_err(|e| BrokerError::MalformedJson(e.to_string()))
    }
}

/// Event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    DeviceArrival,
    DeviceRemoval,
    Error,
    DecodedData,
    Power,
    Buttons,
    BatteryLevel,
    DeviceOwnership,
    DeviceManagerArrival,
    DeviceManagerRemoval,
}

impl EventId {
    pub fn raw(self) -> u32 {
        match self {
            Self::DeviceArrival => 1,
            Self::DeviceRemoval => 2,
            Self::Error => 4,
            Self::DecodedData => 5,
            Self::Power => 6,
            Self::Buttons => 7,
            Self::BatteryLevel => 8,
            Self::DeviceOwnership => 10,
            Self::DeviceManagerArrival => 11,
            Self::DeviceManagerRemoval => 12,
        }
    }
}

/// Event payload data types.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDataType {
    Byte,
    Ulong,
    Array,
    String,
    DecodedData,
    Version,
    DeviceInfo,
}

impl EventDataType {
    pub fn raw(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Ulong => 2,
            Self::Array => 3,
            Self::String => 4,
            Self::DecodedData => 5,
            Self::Version => 6,
            Self::DeviceInfo => 7,
        }
    }
}

/// `event` member of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: u32,
    pub value: Value,
}

impl Event {
    pub fn new(id: EventId, kind: EventDataType, value: Value) -> Self {
        Self {
            id: id.raw(),
            kind: kind.raw(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_fields() {
        let req = Request::from_text(
            r#"{"jsonrpc":"2.0","id":3,"method":"opendevice","params":{"handle":7,"guid":"ABC"}}"#,
        )
        .unwrap();
        assert_eq!(req.method().unwrap(), Method::OpenDevice);
        assert_eq!(req.request_id(), Some(RequestId::Int(3)));
        assert_eq!(req.param_str("guid"), Some("ABC"));
        assert_eq!(req.verify().unwrap(), Verified { handle: 7, id: 3 });
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            Request::from_text("{nope"),
            Err(BrokerError::MalformedJson(_))
        ));
        assert!(matches!(
            Request::from_text("[1, 2]"),
            Err(BrokerError::MalformedJson(_))
        ));
    }

    #[test]
    fn missing_or_unknown_method_is_malformed() {
        let req = Request::from_text(r#"{"id":1}"#).unwrap();
        assert!(matches!(req.method(), Err(BrokerError::MalformedJson(_))));
        let req = Request::from_text(r#"{"id":1,"method":"reboot"}"#).unwrap();
        assert!(matches!(req.method(), Err(BrokerError::MalformedJson(_))));
    }

    #[test]
    fn string_id_is_echoed() {
        let req = Request::from_text(r#"{"id":"transport-openclient","method":"openclient"}"#).unwrap();
        assert_eq!(
            req.request_id(),
            Some(RequestId::Str("transport-openclient".into()))
        );
    }

    #[test]
    fn verify_without_handle_reports_no_id() {
        let req = Request::from_text(r#"{"id":4,"method":"close","params":{}}"#).unwrap();
        let (err, handle) = req.verify().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidHandle(_)));
        assert_eq!(handle, None);
    }

    #[test]
    fn verify_with_string_id_fails_with_handle() {
        let req = Request::from_text(r#"{"id":"x","method":"close","params":{"handle":9}}"#).unwrap();
        let (err, handle) = req.verify().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameter(_)));
        assert_eq!(handle, Some(9));
    }

    #[test]
    fn error_envelope_omits_id_when_unknown() {
        let resp = Response::from_error(
            "2.0",
            &BrokerError::MalformedJson("bad".into()),
            None,
            None,
        );
        let value: Value = serde_json::from_str(&resp.to_text().unwrap()).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["data"]["handle"], json!(NO_HANDLE));
        assert_eq!(value["error"]["code"], json!(ResultCode::PARSE_ERROR.0));
    }

    #[test]
    fn response_text_round_trip() {
        let ok = Response::handle("2.0", Some(RequestId::Int(1)), 1234);
        assert_eq!(Response::from_text(&ok.to_text().unwrap()).unwrap(), ok);

        let err = Response::error(
            "2.0",
            ResultCode::INVALID_HANDLE,
            "gone",
            Some(77),
            Some(RequestId::Str("a".into())),
        );
        assert_eq!(Response::from_text(&err.to_text().unwrap()).unwrap(), err);
    }

    #[test]
    fn event_notification_shape() {
        let resp = Response::event(
            "2.0",
            55,
            Event::new(EventId::BatteryLevel, EventDataType::Byte, json!(80)),
        );
        let value: Value = serde_json::from_str(&resp.to_text().unwrap()).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(
            value["result"],
            json!({"handle": 55, "event": {"id": 8, "type": 1, "value": 80}})
        );
    }
}
