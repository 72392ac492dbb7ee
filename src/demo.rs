//! Handlers served by the bundled binary
//!
//! Small, dependency-free operations that exercise every handler kind over a live socket.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{HandlerError, RpcError};
use crate::mcp::codec::Params;
use crate::mcp::dispatch::default_initialize_result;
use crate::mcp::registry::Descriptor;
use crate::server::WebSocketServer;

const MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct SlowArgs {
    #[serde(default = "default_delay_ms")]
    delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
struct GreetingArgs {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummarizeArgs {
    text: String,
}

fn parse<T: serde::de::DeserializeOwned>(params: Params) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(Value::Object(params))?)
}

pub fn register_demo_handlers(server: &mut WebSocketServer) -> Result<(), RpcError> {
    server
        .on_initialize(|params, connection| async move {
            if let Some(client_info) = params.get("clientInfo") {
                connection.set_data("user_info", client_info.clone());
            }
            Ok(default_initialize_result(&params))
        })
        .on_disconnect(|connection| async move {
            let user_info = connection.data("user_info").unwrap_or_default();
            info!(
                connection_id = %connection.id(),
                user_info = %user_info,
                "demo client disconnected"
            );
        });

    server
        .tool(
            Descriptor::new("example/echo")
                .description("Return the call parameters unchanged")
                .return_type("object"),
            |params, _| async move { Ok(Value::Object(params)) },
        )?
        .tool(
            Descriptor::new("example/slow")
                .description("Sleep before answering")
                .parameter("delay_ms", "integer", "milliseconds to wait, at most 10000"),
            |params, _| async move {
                let args: SlowArgs = parse(params)?;
                if args.delay_ms > MAX_DELAY_MS {
                    return Err(HandlerError::invalid_params(format!(
                        "delay_ms must be at most {MAX_DELAY_MS}"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
                Ok(json!({ "slept_ms": args.delay_ms }))
            },
        )?
        .tool(
            Descriptor::new("user/info")
                .description("Client info recorded during initialize, plus the connection id"),
            |_, connection| async move {
                Ok(json!({
                    "user_info": connection.data("user_info"),
                    "connection_id": connection.id(),
                }))
            },
        )?
        .resource(
            Descriptor::new("example/greeting")
                .description("A greeting")
                .parameter("name", "string", "who to greet"),
            |params, _| async move {
                let args: GreetingArgs = parse(params)?;
                let name = args.name.as_deref().unwrap_or("world");
                Ok(json!(format!("Hello, {name}!")))
            },
        )?
        .prompt(
            Descriptor::new("example/summarize")
                .description("Prompt asking for a short summary")
                .parameter("text", "string", "text to summarize"),
            |params, _| async move {
                let args: SummarizeArgs = parse(params)?;
                if args.text.trim().is_empty() {
                    return Err(HandlerError::invalid_params("text must not be empty"));
                }
                Ok(json!(format!(
                    "Summarize the following text in a few sentences:\n\n{}",
                    args.text
                )))
            },
        )?;

    Ok(())
}
