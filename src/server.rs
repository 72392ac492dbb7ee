//! Server facade
//!
//! Handlers are registered on an owned `WebSocketServer`; `into_handle` freezes the registry
//! and produces the cloneable `ServerHandle` that accepts connections.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::errors::RpcError;
use crate::mcp::codec::Params;
use crate::mcp::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionOptions};
use crate::mcp::dispatch::Dispatcher;
use crate::mcp::registry::{
    callback, fallback_callback, Callback, Descriptor, FallbackCallback, HandlerKind,
    HandlerRegistry, HandlerResult, Invocation,
};
use crate::transport::Channel;

pub type DisconnectHook = Arc<dyn Fn(ConnectionHandle) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct WebSocketServer {
    registry: HandlerRegistry,
    initialize: Option<Callback>,
    listings: HashMap<HandlerKind, Callback>,
    fallback: Option<FallbackCallback>,
    on_disconnect: Option<DisconnectHook>,
    track_connections: bool,
    options: ConnectionOptions,
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("registry", &self.registry)
            .field("track_connections", &self.track_connections)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl WebSocketServer {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            initialize: None,
            listings: HashMap::new(),
            fallback: None,
            on_disconnect: None,
            track_connections: true,
            options: ConnectionOptions::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut server = Self::new();
        server
            .connection_tracking(config.connection_tracking)
            .request_timeout(config.request_timeout);
        server
    }

    pub fn tool<F, Fut>(
        &mut self,
        descriptor: impl Into<Descriptor>,
        handler: F,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerKind::Tool, descriptor.into(), handler)
    }

    pub fn resource<F, Fut>(
        &mut self,
        descriptor: impl Into<Descriptor>,
        handler: F,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerKind::Resource, descriptor.into(), handler)
    }

    pub fn prompt<F, Fut>(
        &mut self,
        descriptor: impl Into<Descriptor>,
        handler: F,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerKind::Prompt, descriptor.into(), handler)
    }

    /// Replaces the built-in `initialize` handshake.
    pub fn on_initialize<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.initialize = Some(callback(handler));
        self
    }

    pub fn on_list_tools<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_list(HandlerKind::Tool, handler)
    }

    pub fn on_list_resources<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_list(HandlerKind::Resource, handler)
    }

    pub fn on_list_prompts<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_list(HandlerKind::Prompt, handler)
    }

    /// Answers tool, resource and prompt invocations whose target is not registered.
    pub fn fallback<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Invocation, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Some(fallback_callback(handler));
        self
    }

    /// Runs after a connection has fully closed and its pending requests were drained.
    pub fn on_disconnect<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(move |connection| hook(connection).boxed()));
        self
    }

    pub fn connection_tracking(&mut self, enabled: bool) -> &mut Self {
        self.track_connections = enabled;
        self
    }

    /// Timeout for requests handlers send back to their peer.
    pub fn request_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn into_handle(self) -> ServerHandle {
        let mut dispatcher = Dispatcher::new(Arc::new(self.registry));
        if let Some(handler) = self.initialize {
            dispatcher = dispatcher.with_initialize(handler);
        }
        for (kind, handler) in self.listings {
            dispatcher = dispatcher.with_listing(kind, handler);
        }
        if let Some(handler) = self.fallback {
            dispatcher = dispatcher.with_fallback(handler);
        }

        ServerHandle {
            inner: Arc::new(ServerInner {
                dispatcher: Arc::new(dispatcher),
                on_disconnect: self.on_disconnect,
                tracker: self.track_connections.then(ConnectionTracker::default),
                options: self.options,
            }),
        }
    }

    /// Serves this registry on `path` of `app`.
    pub fn attach<S>(self, app: Router<S>, path: &str) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.into_handle().attach(app, path)
    }

    fn on_list<F, Fut>(&mut self, kind: HandlerKind, handler: F) -> &mut Self
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.listings.insert(kind, callback(handler));
        self
    }

    fn register<F, Fut>(
        &mut self,
        kind: HandlerKind,
        descriptor: Descriptor,
        handler: F,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Params, ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(kind, descriptor, callback(handler))?;
        Ok(self)
    }
}

struct ServerInner {
    dispatcher: Arc<Dispatcher>,
    on_disconnect: Option<DisconnectHook>,
    tracker: Option<ConnectionTracker>,
    options: ConnectionOptions,
}

#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("dispatcher", &self.inner.dispatcher)
            .field("tracking", &self.inner.tracker.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    pub fn registry(&self) -> &HandlerRegistry {
        self.inner.dispatcher.registry()
    }

    /// Live connections, oldest first. Empty when tracking is disabled.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .tracker
            .as_ref()
            .map(ConnectionTracker::list)
            .unwrap_or_default()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.tracker.as_ref()?.get(id)
    }

    pub fn attach<S>(&self, app: Router<S>, path: &str) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        app.route(
            path,
            get(crate::http::handlers::websocket_endpoint).with_state(self.clone()),
        )
    }

    /// Runs one accepted connection to completion.
    pub async fn serve_channel<C: Channel>(&self, channel: C, path: &str) {
        let connection = Connection::spawn(
            channel,
            Arc::clone(&self.inner.dispatcher),
            self.inner.options.clone(),
        );
        let handle = connection.handle();

        if let Some(tracker) = &self.inner.tracker {
            tracker.add(handle.clone(), path);
        }
        info!(connection_id = %handle.id(), path, "connection accepted");

        connection.wait().await;

        if let Some(tracker) = &self.inner.tracker {
            tracker.remove(handle.id());
        }
        if let Some(hook) = &self.inner.on_disconnect {
            hook(handle).await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub path: String,
    pub connected_at: DateTime<Utc>,
}

struct Tracked {
    info: ConnectionInfo,
    handle: ConnectionHandle,
}

#[derive(Default)]
struct ConnectionTracker {
    live: Mutex<HashMap<ConnectionId, Tracked>>,
}

impl ConnectionTracker {
    fn add(&self, handle: ConnectionHandle, path: &str) {
        let info = ConnectionInfo {
            id: handle.id(),
            path: path.to_string(),
            connected_at: Utc::now(),
        };
        self.lock().insert(info.id, Tracked { info, handle });
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.lock().get(&id).map(|tracked| tracked.handle.clone())
    }

    fn list(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<_> = self
            .lock()
            .values()
            .map(|tracked| tracked.info.clone())
            .collect();
        connections.sort_by_key(|info| info.connected_at);
        connections
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Tracked>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
