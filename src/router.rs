//! Query session router.
//!
//! The router owns the active subscriber set and correlates streamed events
//! to subscribers by `QueryId`. It consults the service gate on every
//! dispatch: while the gate is stopped, nothing is delivered and nothing is
//! retired. Each handler runs under its own delivery permit, so a `stop` that
//! lands mid-dispatch cuts the remaining handlers off.
//!
//! Matching is a linear scan over the active set. Concurrent query counts are
//! expected to be small; with thousands of live subscriptions this becomes the
//! dominant dispatch cost and should move to a `QueryId -> entries` map with
//! the same insertion-order semantics.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, BridgeResult, TransportError};
use crate::gate::ServiceGate;
use crate::query::QueryId;

/// Receives each deserialized payload for a query.
pub type DataCallback = Arc<dyn Fn(JsonValue) + Send + Sync>;

/// Receives the terminal completion signal for a query. Called at most once.
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// One registered subscriber. Immutable once created.
pub struct SubscriberEntry {
    seq: u64,
    query_id: QueryId,
    on_data: DataCallback,
    on_complete: CompletionCallback,
    registered_at: DateTime<Utc>,
}

impl SubscriberEntry {
    fn new(seq: u64, query_id: QueryId, on_data: DataCallback, on_complete: CompletionCallback) -> Self {
        Self {
            seq,
            query_id,
            on_data,
            on_complete,
            registered_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberEntry")
            .field("query_id", &self.query_id)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Snapshot of an active entry, for leak inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveEntry {
    /// Query the entry waits on.
    pub query_id: QueryId,
    /// When the subscriber was registered.
    pub registered_at: DateTime<Utc>,
}

/// Routes data and completion events to registered subscribers.
#[derive(Debug)]
pub struct SessionRouter {
    gate: Arc<ServiceGate>,
    active: Mutex<ActiveSet>,
}

#[derive(Debug, Default)]
struct ActiveSet {
    entries: Vec<SubscriberEntry>,
    next_seq: u64,
}

impl SessionRouter {
    /// Create an empty router consulting `gate`.
    #[must_use]
    pub fn new(gate: Arc<ServiceGate>) -> Self {
        Self {
            gate,
            active: Mutex::new(ActiveSet::default()),
        }
    }

    /// The gate this router consults.
    #[must_use]
    pub fn gate(&self) -> &Arc<ServiceGate> {
        &self.gate
    }

    /// Append a subscriber for `query_id`.
    ///
    /// The id is not validated; callers obtain it from a successful parse.
    pub fn register_subscriber<D, C>(&self, query_id: QueryId, on_data: D, on_complete: C) -> BridgeResult<()>
    where
        D: Fn(JsonValue) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.register_entry(query_id, Arc::new(on_data), Box::new(on_complete)).map(|_| ())
    }

    /// Register and return the entry's sequence number for `withdraw`.
    pub(crate) fn register_entry(
        &self,
        query_id: QueryId,
        on_data: DataCallback,
        on_complete: CompletionCallback,
    ) -> BridgeResult<u64> {
        let mut active = self.lock()?;
        let seq = active.next_seq;
        active.next_seq += 1;
        active.entries.push(SubscriberEntry::new(seq, query_id, on_data, on_complete));
        debug!(%query_id, active = active.entries.len(), "subscriber registered");
        Ok(seq)
    }

    /// Remove one entry without calling its handlers.
    ///
    /// Used when the fetch it was registered for never reached the engine.
    pub(crate) fn withdraw(&self, seq: u64) -> BridgeResult<bool> {
        let mut active = self.lock()?;
        let before = active.entries.len();
        active.entries.retain(|e| e.seq != seq);
        Ok(active.entries.len() != before)
    }

    /// Deliver one serialized payload to every subscriber of `query_id`.
    ///
    /// Returns the number of subscribers reached. While the gate is stopped
    /// this returns `Ok(0)` without looking at the payload. A payload that is
    /// not valid JSON is reported as an error and reaches nobody.
    pub fn dispatch_data(&self, query_id: QueryId, payload: &str) -> BridgeResult<usize> {
        if !self.gate.is_started() {
            trace!(%query_id, "data event suppressed: service stopped");
            return Ok(0);
        }

        let value: JsonValue = serde_json::from_str(payload).map_err(|e| TransportError::DeserializationFailed {
            message: format!("payload for query {query_id}: {e}"),
        })?;

        // Snapshot under the lock, deliver outside it so handlers may re-enter.
        let targets: Vec<DataCallback> = {
            let active = self.lock()?;
            active
                .entries
                .iter()
                .filter(|e| e.query_id == query_id)
                .map(|e| Arc::clone(&e.on_data))
                .collect()
        };

        let mut delivered = 0;
        for on_data in &targets {
            let Some(_permit) = self.gate.delivery_permit()? else {
                trace!(%query_id, delivered, "data event cut off: service stopped");
                break;
            };
            on_data(value.clone());
            delivered += 1;
        }

        trace!(%query_id, delivered, "data event dispatched");
        Ok(delivered)
    }

    /// Deliver the completion signal for `query_id` and retire its subscribers.
    ///
    /// Matching entries are removed under the lock before any completion
    /// handler runs, so each handler fires exactly once even if completion
    /// events race. While the gate is stopped nothing is retired: those
    /// entries stay in the active set until the router is dropped. If the gate
    /// stops partway through, the entries whose handler did not run go back
    /// into the active set. Returns the number of handlers that ran.
    pub fn dispatch_completion(&self, query_id: QueryId) -> BridgeResult<usize> {
        if !self.gate.is_started() {
            trace!(%query_id, "completion event suppressed: service stopped");
            return Ok(0);
        }

        let retired = {
            let mut active = self.lock()?;
            let (retired, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut active.entries).into_iter().partition(|e| e.query_id == query_id);
            active.entries = kept;
            retired
        };

        let mut fired = 0;
        let mut unfired = Vec::new();
        for entry in retired {
            if !unfired.is_empty() {
                unfired.push(entry);
                continue;
            }
            match self.gate.delivery_permit() {
                Ok(Some(_permit)) => {
                    (entry.on_complete)();
                    fired += 1;
                }
                Ok(None) => unfired.push(entry),
                Err(err) => {
                    warn!(%query_id, error = %err, "completion not delivered");
                    unfired.push(entry);
                }
            }
        }

        if !unfired.is_empty() {
            trace!(%query_id, kept = unfired.len(), "completion cut off: service stopped");
            let mut active = self.lock()?;
            active.entries.extend(unfired);
            active.entries.sort_by_key(|e| e.seq);
        }

        if fired > 0 {
            debug!(%query_id, retired = fired, "subscribers retired");
        }
        Ok(fired)
    }

    /// Number of entries in the active set.
    pub fn active_count(&self) -> BridgeResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Number of active entries for `query_id`.
    pub fn active_for(&self, query_id: QueryId) -> BridgeResult<usize> {
        Ok(self.lock()?.entries.iter().filter(|e| e.query_id == query_id).count())
    }

    /// Distinct query ids with at least one active entry, in first-registration order.
    pub fn active_query_ids(&self) -> BridgeResult<Vec<QueryId>> {
        let active = self.lock()?;
        let mut ids: Vec<QueryId> = Vec::new();
        for e in &active.entries {
            if !ids.contains(&e.query_id) {
                ids.push(e.query_id);
            }
        }
        Ok(ids)
    }

    /// Snapshot of every active entry in insertion order.
    pub fn active_entries(&self) -> BridgeResult<Vec<ActiveEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .map(|e| ActiveEntry {
                query_id: e.query_id,
                registered_at: e.registered_at,
            })
            .collect())
    }

    fn lock(&self) -> BridgeResult<MutexGuard<'_, ActiveSet>> {
        self.active
            .lock()
            .map_err(|_| BridgeError::internal("subscriber set lock poisoned"))
    }
}
