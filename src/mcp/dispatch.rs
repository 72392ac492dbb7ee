//! The per-connection dispatch loop
//!
//! Reads frames in arrival order and routes each one: responses go to the correlation table,
//! invocations are spawned as independent tasks against the handler registry. Nothing a single
//! frame or handler does can end the loop; only the transport can. Invocation tasks belong to
//! the loop and are aborted when it ends.

use std::{any::Any, collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::errors::RpcError;
use crate::mcp::codec::{self, DecodeError, Envelope, Kind, Params};
use crate::mcp::connection::ConnectionHandle;
use crate::mcp::registry::{
    Callback, FallbackCallback, HandlerKind, HandlerRegistry, HandlerResult, Invocation,
};
use crate::mcp::rpc::{error_from_object, error_response, redact_audit_params};
use crate::transport::FrameStream;

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Result served for `initialize` when no custom handler is installed.
pub fn default_initialize_result(params: &Params) -> Value {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);

    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "subscribe": false, "listChanged": false },
            "prompts": { "listChanged": false }
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    initialize: Option<CallbackSlot>,
    listings: HashMap<HandlerKind, CallbackSlot>,
    fallback: Option<FallbackSlot>,
}

// Wrappers so `Dispatcher` can keep a derived `Debug`.
struct CallbackSlot(Callback);
struct FallbackSlot(FallbackCallback);

impl std::fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

impl std::fmt::Debug for FallbackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FallbackCallback")
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    /// Dispatcher for a connection that only issues requests: every invocation from the
    /// peer is answered with `handler_not_found`.
    pub fn client() -> Self {
        Self::default()
    }

    pub fn with_initialize(mut self, handler: Callback) -> Self {
        self.initialize = Some(CallbackSlot(handler));
        self
    }

    /// Replaces the built-in `list_*` answer for `kind`.
    pub fn with_listing(mut self, kind: HandlerKind, handler: Callback) -> Self {
        self.listings.insert(kind, CallbackSlot(handler));
        self
    }

    /// Serves invocations whose target has no registered handler.
    pub fn with_fallback(mut self, handler: FallbackCallback) -> Self {
        self.fallback = Some(FallbackSlot(handler));
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Routes one invocation to its handler and returns the handler's outcome.
    pub async fn dispatch(
        &self,
        kind: Kind,
        target: Option<&str>,
        params: Params,
        connection: ConnectionHandle,
    ) -> Result<Value, RpcError> {
        if let Some(listed) = HandlerKind::from_listing(kind) {
            if let Some(CallbackSlot(handler)) = self.listings.get(&listed) {
                return run_callback(handler, params, connection).await;
            }
            return self.registry.listing(listed).map_err(|err| {
                RpcError::Protocol(format!("failed to encode {listed} list: {err}"))
            });
        }

        if let Some(invoked) = HandlerKind::from_invocation(kind) {
            let target = target.unwrap_or_default();
            return match (self.registry.lookup(invoked, target), &self.fallback) {
                (Ok(entry), _) => run_callback(&entry.callback, params, connection).await,
                (Err(RpcError::HandlerNotFound { .. }), Some(FallbackSlot(fallback))) => {
                    let fallback = Arc::clone(fallback);
                    let invocation = Invocation {
                        kind: invoked,
                        target: target.to_string(),
                        params,
                    };
                    run_guarded(async move { fallback(invocation, connection).await }).await
                }
                (Err(err), _) => Err(err),
            };
        }

        match kind {
            Kind::Initialize => match &self.initialize {
                Some(CallbackSlot(handler)) => run_callback(handler, params, connection).await,
                None => Ok(default_initialize_result(&params)),
            },
            _ => Err(RpcError::Protocol(format!("`{kind}` is not an invocation kind"))),
        }
    }

    fn handle_frame(
        self: &Arc<Self>,
        connection: &ConnectionHandle,
        frame: &[u8],
        tasks: &mut JoinSet<()>,
    ) {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => return reject_frame(connection, err),
        };

        if envelope.is_response() {
            return deliver_response(connection, envelope);
        }

        let span = info_span!(
            "invocation",
            kind = %envelope.kind,
            operation = envelope.target.as_deref().unwrap_or_default(),
            request_id = envelope.id.as_ref().map(ToString::to_string).unwrap_or_default(),
        );
        let dispatcher = Arc::clone(self);
        let connection = connection.clone();
        tasks.spawn(async move { dispatcher.invoke(envelope, connection).await }.instrument(span));
    }

    async fn invoke(&self, envelope: Envelope, connection: ConnectionHandle) {
        let Envelope {
            id,
            kind,
            target,
            params,
            ..
        } = envelope;
        let params = params.unwrap_or_default();
        let audit_params = redact_audit_params(&params);

        let outcome = self
            .dispatch(kind, target.as_deref(), params, connection.clone())
            .await;

        info!(
            kind = %kind,
            operation = target.as_deref().unwrap_or_default(),
            params = %audit_params,
            outcome = if outcome.is_ok() { "success" } else { "failure" },
            "mcp action audited"
        );

        let Some(id) = id else {
            if let Err(err) = outcome {
                warn!(error = %err, "notification handler failed");
            }
            return;
        };

        let response = match outcome {
            Ok(result) => Envelope::result(id, result),
            Err(err) => error_response(id, &err),
        };
        if let Err(err) = connection.send(&response) {
            debug!(error = %err, "connection went away before the response was sent");
        }
    }
}

pub(crate) async fn read_loop<S: FrameStream>(
    connection: &ConnectionHandle,
    mut stream: S,
    dispatcher: &Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("close requested locally");
                break;
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            frame = stream.next_frame() => frame,
        };

        match frame {
            Some(Ok(frame)) => dispatcher.handle_frame(connection, &frame, &mut tasks),
            Some(Err(err)) => {
                warn!(error = %err, "transport failure; stopping dispatch loop");
                break;
            }
            None => {
                debug!("peer closed the channel");
                break;
            }
        }
    }

    if !tasks.is_empty() {
        debug!(in_flight = tasks.len(), "aborting unfinished invocations");
    }
    tasks.shutdown().await;
}

fn deliver_response(connection: &ConnectionHandle, envelope: Envelope) {
    let Some(id) = envelope.id else {
        return;
    };

    let outcome = match envelope.error {
        Some(error) => Err(error_from_object(error)),
        None => Ok(envelope.result.unwrap_or(Value::Null)),
    };
    connection.resolve(&id, outcome);
}

fn reject_frame(connection: &ConnectionHandle, err: DecodeError) {
    warn!(reason = %err.reason, frame = %err.preview(), "dropping malformed frame");

    match err.id.clone() {
        // A broken response still settles the request it claims to answer.
        Some(id) if err.response => {
            connection.resolve(&id, Err(RpcError::Decode(err)));
        }
        Some(id) => {
            if let Err(send_err) = connection.send(&error_response(id, &RpcError::Decode(err))) {
                debug!(error = %send_err, "could not report malformed frame");
            }
        }
        None => {}
    }
}

async fn run_callback(
    handler: &Callback,
    params: Params,
    connection: ConnectionHandle,
) -> Result<Value, RpcError> {
    let handler = Arc::clone(handler);
    run_guarded(async move { handler(params, connection).await }).await
}

async fn run_guarded<F>(invocation: F) -> Result<Value, RpcError>
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(result) => result.map_err(RpcError::from),
        Err(panic) => Err(RpcError::HandlerExecution {
            message: format!("handler panicked: {}", panic_message(panic.as_ref())),
            data: None,
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
