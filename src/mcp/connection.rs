//! Connection lifecycle and the handle passed to handlers
//!
//! A connection owns one writer task (all outbound frames go through it, so concurrent handler
//! completions never interleave) and one driver task running the dispatch loop. Both roles share
//! the transport: the correlation table serves requests this side issued, the dispatcher serves
//! requests the peer issued.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::errors::RpcError;
use crate::mcp::codec::{self, Envelope, Kind, Params, RequestId};
use crate::mcp::correlation::{CorrelationTable, Outcome};
use crate::mcp::dispatch::{self, Dispatcher};
use crate::transport::{Channel, FrameSink};

pub type ConnectionId = Uuid;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound applied to requests this side issues; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct Shared {
    id: ConnectionId,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: CorrelationTable,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    data: Mutex<HashMap<String, Value>>,
    request_timeout: Option<Duration>,
}

/// Cheap, clonable view of a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Asks the dispatch loop to stop reading and tear the connection down.
    pub fn close(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub async fn request(
        &self,
        kind: Kind,
        target: Option<&str>,
        params: Params,
    ) -> Result<Value, RpcError> {
        self.request_with_timeout(kind, target, params, self.shared.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        kind: Kind,
        target: Option<&str>,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        if kind == Kind::Response {
            return Err(RpcError::Protocol(
                "responses are sent by the dispatch loop, not requested".to_string(),
            ));
        }

        let pending = self.shared.pending.register()?;
        let id = pending.id().clone();
        let envelope =
            Envelope::request(Some(id.clone()), kind, target.map(str::to_string), params);

        if let Err(err) = self.send(&envelope) {
            self.shared.pending.resolve(&id, Err(RpcError::ConnectionClosed));
            return Err(err);
        }
        debug!(
            connection_id = %self.id(),
            request_id = %id,
            kind = %kind,
            operation = target.unwrap_or_default(),
            "request sent"
        );

        let Some(limit) = timeout else {
            return pending.wait().await;
        };

        match tokio::time::timeout(limit, pending.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.pending.resolve(&id, Err(RpcError::Timeout(limit)));
                warn!(
                    connection_id = %self.id(),
                    request_id = %id,
                    kind = %kind,
                    timeout_ms = limit.as_millis() as u64,
                    "request timed out"
                );
                Err(RpcError::Timeout(limit))
            }
        }
    }

    /// Sends an invocation without an id; the peer runs it and never answers.
    pub fn notify(&self, kind: Kind, target: Option<&str>, params: Params) -> Result<(), RpcError> {
        if kind == Kind::Response {
            return Err(RpcError::Protocol(
                "a response cannot be sent as a notification".to_string(),
            ));
        }
        self.send(&Envelope::request(None, kind, target.map(str::to_string), params))
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.shared.pending.contains(id)
    }

    pub fn data(&self, key: &str) -> Option<Value> {
        self.data_map().get(key).cloned()
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data_map().insert(key.into(), value)
    }

    pub fn remove_data(&self, key: &str) -> Option<Value> {
        self.data_map().remove(key)
    }

    pub fn data_snapshot(&self) -> HashMap<String, Value> {
        self.data_map().clone()
    }

    pub(crate) fn send(&self, envelope: &Envelope) -> Result<(), RpcError> {
        let frame = codec::encode(envelope)?;
        self.shared
            .outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    pub(crate) fn resolve(&self, id: &RequestId, outcome: Outcome) -> bool {
        self.shared.pending.resolve(id, outcome)
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state.send_replace(state);
    }

    fn data_map(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.shared
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owning side of a connection. Dropping it requests shutdown; the driver still drains
/// pending requests on its way out.
pub struct Connection {
    handle: ConnectionHandle,
    driver: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn spawn<C: Channel>(
        channel: C,
        dispatcher: Arc<Dispatcher>,
        options: ConnectionOptions,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Open);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                outgoing,
                pending: CorrelationTable::new(),
                state,
                shutdown,
                data: Mutex::new(HashMap::new()),
                request_timeout: options.request_timeout,
            }),
        };

        let span = tracing::info_span!("connection", connection_id = %handle.id());
        let driver = tokio::spawn(
            drive(handle.clone(), channel, dispatcher, outgoing_rx, shutdown_rx).instrument(span),
        );

        Self {
            handle,
            driver: Some(driver),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Waits until the peer or a local `close` ends the connection.
    pub async fn wait(mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                warn!(connection_id = %self.handle.id(), error = %err, "connection driver aborted");
            }
        }
    }

    pub async fn close(self) {
        self.handle.close();
        self.wait().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.handle.close();
        }
    }
}

async fn drive<C: Channel>(
    handle: ConnectionHandle,
    channel: C,
    dispatcher: Arc<Dispatcher>,
    outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let (sink, stream) = channel.split();
    let writer = tokio::spawn(write_frames(handle.clone(), sink, outgoing_rx).in_current_span());

    handle.set_state(ConnectionState::Active);
    dispatch::read_loop(&handle, stream, &dispatcher, shutdown_rx).await;
    handle.set_state(ConnectionState::Closing);

    let drained = handle.shared.pending.drain_on_close();
    let _ = handle.shared.outgoing.send(Outgoing::Close);
    if let Err(err) = writer.await {
        warn!(error = %err, "writer task aborted");
    }

    handle.set_state(ConnectionState::Closed);
    info!(drained_requests = drained, "connection closed");
}

async fn write_frames<S: FrameSink>(
    handle: ConnectionHandle,
    mut sink: S,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        match message {
            Outgoing::Frame(frame) => {
                if let Err(err) = sink.send_frame(frame).await {
                    warn!(error = %err, "failed to write frame; closing connection");
                    handle.close();
                    break;
                }
            }
            Outgoing::Close => {
                if let Err(err) = sink.close().await {
                    debug!(error = %err, "channel close reported an error");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::memory::MemoryChannel;

    fn lone_connection() -> (Connection, MemoryChannel) {
        let (local, peer) = MemoryChannel::pair();
        let connection = Connection::spawn(
            local,
            Arc::new(Dispatcher::client()),
            ConnectionOptions::default(),
        );
        (connection, peer)
    }

    #[tokio::test]
    async fn data_map_is_per_connection() {
        let (first, _first_peer) = lone_connection();
        let (second, _second_peer) = lone_connection();
        let first = first.handle();
        let second = second.handle();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.set_data("user", json!("ada")), None);
        assert_eq!(first.set_data("user", json!("grace")), Some(json!("ada")));
        assert_eq!(first.data("user"), Some(json!("grace")));
        assert_eq!(second.data("user"), None);

        assert_eq!(first.data_snapshot().len(), 1);
        assert_eq!(first.remove_data("user"), Some(json!("grace")));
        assert!(first.data_snapshot().is_empty());
    }

    #[tokio::test]
    async fn local_close_walks_through_to_closed() {
        let (connection, _peer) = lone_connection();
        let handle = connection.handle();

        connection.close().await;

        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(matches!(
            handle.notify(Kind::ListTools, None, Params::new()),
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn responses_cannot_be_requested() {
        let (connection, _peer) = lone_connection();
        let handle = connection.handle();

        assert!(matches!(
            handle.request(Kind::Response, None, Params::new()).await,
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            handle.notify(Kind::Response, None, Params::new()),
            Err(RpcError::Protocol(_))
        ));
        assert_eq!(handle.pending_requests(), 0);
    }
}
