//! Per-connection correlation table
//!
//! Every outbound request owns a single-use slot keyed by its id. The dispatch loop resolves
//! slots as responses arrive; teardown drains whatever is still outstanding.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::RpcError;
use crate::mcp::codec::RequestId;

pub type Outcome = Result<Value, RpcError>;

#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    slot: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Waits for the slot to be resolved.
    pub async fn wait(self) -> Outcome {
        self.slot.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }
}

#[derive(Debug, Default)]
struct Slots {
    waiting: HashMap<RequestId, oneshot::Sender<Outcome>>,
    closed: bool,
}

#[derive(Debug)]
pub struct CorrelationTable {
    next_id: AtomicI64,
    slots: Mutex<Slots>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn register(&self) -> Result<PendingRequest, RpcError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(RpcError::ConnectionClosed);
        }

        // Only reachable after the counter wraps.
        let id = loop {
            let candidate = RequestId::Integer(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !slots.waiting.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        slots.waiting.insert(id.clone(), tx);
        Ok(PendingRequest { id, slot: rx })
    }

    /// Completes the slot for `id`. Unknown or already-resolved ids are a no-op.
    pub fn resolve(&self, id: &RequestId, outcome: Outcome) -> bool {
        let Some(slot) = self.lock().waiting.remove(id) else {
            debug!(request_id = %id, "dropping response for unknown request id");
            return false;
        };

        if slot.send(outcome).is_err() {
            debug!(request_id = %id, "caller stopped waiting before the response arrived");
        }
        true
    }

    /// Fails every outstanding slot with `ConnectionClosed` and refuses new registrations.
    pub fn drain_on_close(&self) -> usize {
        let drained = {
            let mut slots = self.lock();
            if slots.closed {
                return 0;
            }
            slots.closed = true;
            std::mem::take(&mut slots.waiting)
        };

        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().waiting.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_completes_only_the_matching_slot() {
        let table = CorrelationTable::new();
        let first = table.register().expect("first");
        let second = table.register().expect("second");
        assert_ne!(first.id(), second.id());

        assert!(table.resolve(&second.id().clone(), Ok(json!("second"))));
        assert_eq!(second.wait().await.expect("second result"), json!("second"));

        assert!(table.contains(first.id()));
        assert_eq!(table.len(), 1);

        assert!(table.resolve(&first.id().clone(), Ok(json!("first"))));
        assert_eq!(first.wait().await.expect("first result"), json!("first"));
        assert!(table.is_empty());
    }

    #[test]
    fn resolving_twice_or_unknown_is_a_noop() {
        let table = CorrelationTable::new();
        let pending = table.register().expect("register");
        let id = pending.id().clone();

        assert!(table.resolve(&id, Ok(Value::Null)));
        assert!(!table.resolve(&id, Ok(Value::Null)));
        assert!(!table.resolve(&RequestId::String("never".to_string()), Ok(Value::Null)));
    }

    #[test]
    fn ids_are_monotonic() {
        let table = CorrelationTable::new();
        let ids: Vec<_> = (0..3)
            .map(|_| table.register().expect("register").id().clone())
            .collect();
        assert_eq!(
            ids,
            vec![
                RequestId::Integer(1),
                RequestId::Integer(2),
                RequestId::Integer(3)
            ]
        );
    }

    #[tokio::test]
    async fn drain_fails_pending_and_blocks_new_requests() {
        let table = CorrelationTable::new();
        let pending = table.register().expect("register");

        assert_eq!(table.drain_on_close(), 1);
        assert!(matches!(pending.wait().await, Err(RpcError::ConnectionClosed)));
        assert!(matches!(table.register(), Err(RpcError::ConnectionClosed)));
        assert_eq!(table.drain_on_close(), 0);
    }

    #[tokio::test]
    async fn dropped_table_reports_connection_closed() {
        let table = CorrelationTable::new();
        let pending = table.register().expect("register");
        drop(table);

        assert!(matches!(pending.wait().await, Err(RpcError::ConnectionClosed)));
    }
}
