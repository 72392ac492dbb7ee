//! Error envelopes and audit helpers
//!
//! Maps `RpcError` values onto wire error objects and back, so a failure raised on one side of
//! the socket surfaces as the same variant on the other.

use serde_json::{json, Value};

use crate::errors::RpcError;
use crate::mcp::codec::{Envelope, ErrorKind, ErrorObject, Params, RequestId};
use crate::mcp::registry::HandlerKind;

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const HANDLER_ERROR: i32 = -32000;

pub fn error_response(id: RequestId, err: &RpcError) -> Envelope {
    Envelope::error(id, error_object(err))
}

pub fn error_object(err: &RpcError) -> ErrorObject {
    match err {
        RpcError::Decode(decode) => ErrorObject {
            code: PARSE_ERROR,
            kind: ErrorKind::Decode,
            message: format!("Parse error: {}", decode.reason),
            data: None,
        },
        RpcError::HandlerNotFound { kind, name } => ErrorObject {
            code: METHOD_NOT_FOUND,
            kind: ErrorKind::HandlerNotFound,
            message: err.to_string(),
            data: Some(json!({ "kind": kind, "name": name })),
        },
        RpcError::InvalidParams { message } => ErrorObject {
            code: INVALID_PARAMS,
            kind: ErrorKind::InvalidParams,
            message: message.clone(),
            data: None,
        },
        RpcError::HandlerExecution { message, data } => ErrorObject {
            code: HANDLER_ERROR,
            kind: ErrorKind::HandlerExecution,
            message: message.clone(),
            data: data.clone(),
        },
        other => ErrorObject {
            code: INTERNAL_ERROR,
            kind: ErrorKind::Internal,
            message: other.to_string(),
            data: None,
        },
    }
}

pub fn error_from_object(error: ErrorObject) -> RpcError {
    match error.kind {
        ErrorKind::HandlerNotFound => match not_found_target(error.data.as_ref()) {
            Some((kind, name)) => RpcError::HandlerNotFound { kind, name },
            None => remote(error),
        },
        ErrorKind::InvalidParams => RpcError::InvalidParams {
            message: error.message,
        },
        ErrorKind::HandlerExecution => RpcError::HandlerExecution {
            message: error.message,
            data: error.data,
        },
        ErrorKind::Decode | ErrorKind::Internal | ErrorKind::Unknown => remote(error),
    }
}

fn not_found_target(data: Option<&Value>) -> Option<(HandlerKind, String)> {
    let data = data?;
    let kind = serde_json::from_value(data.get("kind")?.clone()).ok()?;
    let name = data.get("name")?.as_str()?.to_string();
    Some((kind, name))
}

fn remote(error: ErrorObject) -> RpcError {
    RpcError::Remote {
        code: error.code,
        message: error.message,
        data: error.data,
    }
}

pub fn redact_audit_params(params: &Params) -> Value {
    redact_audit_value(&Value::Object(params.clone()))
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || ["token", "secret", "password", "credential"]
        .iter()
        .any(|fragment| normalized.contains(fragment))
}
