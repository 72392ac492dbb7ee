//! Envelope wire format
//!
//! One JSON object per websocket message. Decoding validates the envelope shape and never
//! panics; failures come back as a `DecodeError` that keeps the raw frame for diagnostics.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::RpcError;

pub type Params = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    /// Integers above `i64::MAX` that a peer may still choose as ids.
    Unsigned(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Unsigned(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Initialize,
    ToolCall,
    ResourceRead,
    PromptGet,
    ListTools,
    ListResources,
    ListPrompts,
    Response,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ToolCall => "tool_call",
            Self::ResourceRead => "resource_read",
            Self::PromptGet => "prompt_get",
            Self::ListTools => "list_tools",
            Self::ListResources => "list_resources",
            Self::ListPrompts => "list_prompts",
            Self::Response => "response",
        }
    }

    pub fn requires_target(self) -> bool {
        matches!(self, Self::ToolCall | Self::ResourceRead | Self::PromptGet)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Decode,
    HandlerNotFound,
    InvalidParams,
    HandlerExecution,
    Internal,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    /// Peers that only send `{code, message}` decode as `Unknown`.
    #[serde(default)]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// An explicit `"result": null` is a populated result, not an absent one.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn request(
        id: Option<RequestId>,
        kind: Kind,
        target: Option<String>,
        params: Params,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            params: Some(params),
            result: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            kind: Kind::Response,
            target: None,
            params: None,
            result: Some(result),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id: Some(id),
            kind: Kind::Response,
            target: None,
            params: None,
            result: None,
            error: Some(error),
            extra: Map::new(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.kind == Kind::Response
    }

    fn validate(&self) -> Result<(), String> {
        if self.is_response() {
            if self.id.is_none() {
                return Err("response envelope is missing `id`".to_string());
            }
            return match (&self.result, &self.error) {
                (Some(_), Some(_)) => {
                    Err("response envelope carries both `result` and `error`".to_string())
                }
                (None, None) => {
                    Err("response envelope carries neither `result` nor `error`".to_string())
                }
                _ => Ok(()),
            };
        }

        if self.kind.requires_target()
            && self.target.as_deref().map(str::trim).unwrap_or_default().is_empty()
        {
            return Err(format!("`{}` envelope is missing `target`", self.kind));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct DecodeError {
    pub reason: String,
    pub raw: Vec<u8>,
    /// Correlation id salvaged from the payload, when it had one.
    pub id: Option<RequestId>,
    /// Whether the payload claimed to be a `response`.
    pub response: bool,
}

impl DecodeError {
    fn new(reason: impl Into<String>, raw: &[u8]) -> Self {
        let salvaged = serde_json::from_slice::<Value>(raw).ok();
        let id = salvaged
            .as_ref()
            .and_then(|value| value.get("id"))
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
        let response = salvaged
            .as_ref()
            .and_then(|value| value.get("kind"))
            .and_then(Value::as_str)
            == Some(Kind::Response.as_str());

        Self {
            reason: reason.into(),
            raw: raw.to_vec(),
            id,
            response,
        }
    }

    pub fn preview(&self) -> String {
        crate::logging::frame_preview(&self.raw)
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(envelope)
        .map_err(|err| RpcError::Protocol(format!("failed to encode envelope: {err}")))
}

pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let envelope: Envelope =
        serde_json::from_slice(raw).map_err(|err| DecodeError::new(err.to_string(), raw))?;
    envelope
        .validate()
        .map_err(|reason| DecodeError::new(reason, raw))?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().expect("object params")
    }

    #[test]
    fn tool_call_round_trips() {
        let envelope = Envelope::request(
            Some(RequestId::Integer(7)),
            Kind::ToolCall,
            Some("example/echo".to_string()),
            params(json!({"x": 1, "nested": {"y": [1, 2]}})),
        );

        let bytes = encode(&envelope).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn null_result_round_trips() {
        let envelope = Envelope::result(RequestId::String("abc".to_string()), Value::Null);

        let bytes = encode(&envelope).expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert!(text.contains("\"result\":null"));
        assert_eq!(decode(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let raw = br#"{"id":1,"kind":"list_tools","trace":"abc","meta":{"k":1}}"#;

        let envelope = decode(raw).expect("decode");
        assert_eq!(envelope.extra["trace"], json!("abc"));

        let reencoded: Value =
            serde_json::from_slice(&encode(&envelope).expect("encode")).expect("json");
        assert_eq!(reencoded["meta"], json!({"k": 1}));
    }

    #[test]
    fn missing_kind_is_rejected() {
        let err = decode(br#"{"id":3,"target":"x"}"#).expect_err("kind is required");
        assert!(err.reason.contains("kind"));
        assert_eq!(err.id, Some(RequestId::Integer(3)));
        assert!(!err.response);
    }

    #[test]
    fn response_without_id_is_rejected() {
        let err = decode(br#"{"kind":"response","result":{}}"#).expect_err("id is required");
        assert!(err.reason.contains("id"));
        assert!(err.response);
    }

    #[test]
    fn response_with_both_outcomes_is_rejected() {
        let raw = br#"{"id":4,"kind":"response","result":1,"error":{"code":-32000,"kind":"internal","message":"x"}}"#;
        let err = decode(raw).expect_err("exclusive outcomes");
        assert_eq!(err.id, Some(RequestId::Integer(4)));
        assert!(err.response);
    }

    #[test]
    fn invocation_without_target_is_rejected() {
        let err = decode(br#"{"id":"r1","kind":"tool_call","params":{}}"#).expect_err("target");
        assert_eq!(err.id, Some(RequestId::String("r1".to_string())));
        assert!(err.reason.contains("target"));
    }

    #[test]
    fn garbage_keeps_raw_bytes() {
        let err = decode(b"not json at all").expect_err("garbage");
        assert_eq!(err.raw, b"not json at all".to_vec());
        assert_eq!(err.id, None);
    }

    #[test]
    fn unknown_error_kind_decodes_as_unknown() {
        let raw = br#"{"id":5,"kind":"response","error":{"code":-1,"kind":"rate_limited","message":"slow down"}}"#;
        let envelope = decode(raw).expect("decode");
        assert_eq!(envelope.error.expect("error").kind, ErrorKind::Unknown);
    }

    #[test]
    fn error_without_kind_decodes_as_unknown() {
        let raw = br#"{"id":6,"kind":"response","error":{"code":-32001,"message":"busy"}}"#;
        let error = decode(raw).expect("decode").error.expect("error");
        assert_eq!(error.kind, ErrorKind::Unknown);
        assert_eq!(error.code, -32001);
        assert_eq!(error.message, "busy");
    }

    #[test]
    fn ids_above_i64_max_are_kept() {
        let envelope = decode(br#"{"id":18446744073709551615,"kind":"list_tools"}"#)
            .expect("decode");
        assert_eq!(envelope.id, Some(RequestId::Unsigned(u64::MAX)));
        assert_eq!(envelope.id.expect("id").to_string(), "18446744073709551615");

        let err = decode(br#"{"id":18446744073709551615,"kind":"tool_call"}"#)
            .expect_err("target");
        assert_eq!(err.id, Some(RequestId::Unsigned(u64::MAX)));

        let small = decode(br#"{"id":-2,"kind":"list_tools"}"#).expect("decode");
        assert_eq!(small.id, Some(RequestId::Integer(-2)));
    }
}
