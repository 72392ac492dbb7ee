//! Client facade
//!
//! Issues correlated requests over one connection and waits for the matching responses. Every
//! call is independent: a timeout or error on one leaves the others and the connection intact.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Map, Value};

use crate::errors::RpcError;
use crate::mcp::codec::{Kind, Params};
use crate::mcp::connection::{Connection, ConnectionHandle, ConnectionOptions};
use crate::mcp::dispatch::{Dispatcher, DEFAULT_PROTOCOL_VERSION};
use crate::mcp::registry::Descriptor;
use crate::transport::{websocket, Channel};

pub struct WebSocketClient {
    connection: Connection,
}

impl WebSocketClient {
    /// Connects to a `ws://` or `wss://` endpoint with the default 30 second request timeout.
    pub async fn connect(url: &str) -> Result<Self, RpcError> {
        Self::connect_with(url, ConnectionOptions::default()).await
    }

    pub async fn connect_with(url: &str, options: ConnectionOptions) -> Result<Self, RpcError> {
        let stream = websocket::connect(url).await?;
        Ok(Self::from_channel(stream, options))
    }

    /// Runs the client over an already established channel.
    pub fn from_channel<C: Channel>(channel: C, options: ConnectionOptions) -> Self {
        Self {
            connection: Connection::spawn(channel, Arc::new(Dispatcher::client()), options),
        }
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection.handle()
    }

    pub async fn initialize(&self) -> Result<Value, RpcError> {
        let mut params = Map::new();
        params.insert("protocolVersion".to_string(), json!(DEFAULT_PROTOCOL_VERSION));
        params.insert(
            "clientInfo".to_string(),
            json!({ "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }),
        );
        self.connection
            .handle()
            .request(Kind::Initialize, None, params)
            .await
    }

    pub async fn call_tool(&self, name: &str, params: Value) -> Result<Value, RpcError> {
        self.connection
            .handle()
            .request(Kind::ToolCall, Some(name), into_params(params)?)
            .await
    }

    /// Like [`call_tool`](Self::call_tool) with a per-call bound; `None` waits forever.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.connection
            .handle()
            .request_with_timeout(Kind::ToolCall, Some(name), into_params(params)?, timeout)
            .await
    }

    pub async fn read_resource(&self, uri: &str, params: Value) -> Result<Value, RpcError> {
        self.connection
            .handle()
            .request(Kind::ResourceRead, Some(uri), into_params(params)?)
            .await
    }

    pub async fn get_prompt(&self, name: &str, params: Value) -> Result<Value, RpcError> {
        self.connection
            .handle()
            .request(Kind::PromptGet, Some(name), into_params(params)?)
            .await
    }

    pub async fn list_tools(&self) -> Result<Vec<Descriptor>, RpcError> {
        self.list(Kind::ListTools).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Descriptor>, RpcError> {
        self.list(Kind::ListResources).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Descriptor>, RpcError> {
        self.list(Kind::ListPrompts).await
    }

    /// Closes the channel. Calls still waiting fail with `ConnectionClosed`.
    pub async fn close(self) {
        self.connection.close().await;
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Descriptor>, RpcError> {
        let listed = self.connection.handle().request(kind, None, Map::new()).await?;
        serde_json::from_value(listed)
            .map_err(|err| RpcError::Protocol(format!("malformed {kind} result: {err}")))
    }
}

fn into_params(params: Value) -> Result<Params, RpcError> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(RpcError::invalid_params(format!(
            "params must be a JSON object, got {other}"
        ))),
    }
}
