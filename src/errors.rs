use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::mcp::codec::DecodeError;
use crate::mcp::registry::HandlerKind;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("no {kind} handler registered for `{name}`")]
    HandlerNotFound { kind: HandlerKind, name: String },
    #[error("{kind} handler `{name}` is already registered")]
    DuplicateHandler { kind: HandlerKind, name: String },
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
    #[error("handler failed: {message}")]
    HandlerExecution {
        message: String,
        data: Option<Value>,
    },
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl RpcError {
    pub fn handler_not_found(kind: HandlerKind, name: impl Into<String>) -> Self {
        Self::HandlerNotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failure returned by a registered handler callback.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("{message}")]
    Failed {
        message: String,
        data: Option<Value>,
    },
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self::Failed {
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

impl From<HandlerError> for RpcError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::InvalidParams(message) => Self::InvalidParams { message },
            HandlerError::Failed { message, data } => Self::HandlerExecution { message, data },
        }
    }
}

// Handlers may call back into the peer through their connection handle.
impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::InvalidParams { message } => Self::InvalidParams(message),
            RpcError::HandlerExecution { message, data } => Self::Failed { message, data },
            other => Self::new(other.to_string()),
        }
    }
}
