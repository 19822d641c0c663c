//! In-memory query engine.
//!
//! Serves canned results keyed by query text. It recognizes an operation's
//! header and checks brace balance, nothing more; it is a stand-in for a real
//! engine when exercising the bridge.
//!
//! Every fetch runs on its own thread. Queries and mutations stream their
//! canned payloads and complete. Subscriptions stream their canned payloads
//! and then stay open: `publish` pushes further payloads. `unsubscribe` (or
//! `stop_service`) ends any running fetch at its next payload.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, warn};

use crate::error::{BridgeError, BridgeResult, ExecutionError, ValidationError};
use crate::query::{FetchRequest, QueryId};

use super::{QueryEngine, StreamSink};

const DEFAULT_STREAM_CAPACITY: usize = 1024;

fn operation_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^(?:(query|mutation|subscription)(?:\s+[_A-Za-z][_0-9A-Za-z]*)?\s*(?:\([^)]*\))?\s*)?\{")
            .expect("operation header pattern is valid")
    })
}

/// Kind of operation a parsed document runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read; completes after its results.
    Query,
    /// Write; completes after its results.
    Mutation,
    /// Live stream; stays open until unsubscribed.
    Subscription,
}

/// One canned resolution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resolved {
    /// Successful result; becomes the `data` member of the payload.
    Data(JsonValue),
    /// Execution failure; becomes a `data: null` payload with one error.
    Error(String),
}

impl Resolved {
    /// Render as a serialized response document.
    #[must_use]
    pub fn to_payload(&self) -> String {
        match self {
            Self::Data(v) => json!({ "data": v }).to_string(),
            Self::Error(message) => error_payload(message),
        }
    }
}

fn error_payload(message: &str) -> String {
    json!({ "data": null, "errors": [{ "message": message }] }).to_string()
}

#[derive(Debug)]
struct ParsedQuery {
    kind: OperationKind,
    text: String,
}

/// Engine-side handle on one running fetch.
#[derive(Debug)]
struct LiveStream {
    kind: OperationKind,
    generation: u64,
    tx: Sender<String>,
    cancelled: Arc<AtomicBool>,
}

impl LiveStream {
    /// Stop the worker at its next payload; dropping `tx` ends a subscription's feed.
    fn cancel(self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct EngineState {
    started: bool,
    documents: HashMap<String, Vec<Resolved>>,
    queries: BTreeMap<QueryId, ParsedQuery>,
    streams: HashMap<QueryId, LiveStream>,
    next_generation: u64,
}

fn lock_state(state: &Mutex<EngineState>) -> BridgeResult<MutexGuard<'_, EngineState>> {
    state
        .lock()
        .map_err(|_| BridgeError::internal("in-memory engine lock poisoned"))
}

/// Canned-result engine.
#[derive(Debug)]
pub struct InMemoryEngine {
    state: Arc<Mutex<EngineState>>,
    stream_capacity: usize,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    /// Engine with the default per-stream capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stream_capacity(DEFAULT_STREAM_CAPACITY)
    }

    /// Engine whose per-subscription publish queue holds at most `capacity` entries.
    #[must_use]
    pub fn with_stream_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            stream_capacity: capacity.max(1),
        }
    }

    /// Register canned results for a document.
    ///
    /// Text is matched after whitespace normalization. Definitions survive
    /// `stop_service`.
    pub fn define(&self, text: &str, results: Vec<Resolved>) -> BridgeResult<()> {
        self.lock()?.documents.insert(normalize(text), results);
        Ok(())
    }

    /// Push a payload into a live subscription.
    ///
    /// Returns `Ok(false)` if no subscription is live for `query_id`.
    pub fn publish(&self, query_id: QueryId, result: &Resolved) -> BridgeResult<bool> {
        let state = self.lock()?;
        let Some(live) = state.streams.get(&query_id) else {
            return Ok(false);
        };
        if live.kind != OperationKind::Subscription {
            return Ok(false);
        }

        match live.tx.try_send(result.to_payload()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Err(BridgeError::Execution(ExecutionError::QueueFull {
                path: format!("stream-{query_id}"),
                capacity: self.stream_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Ok(false),
        }
    }

    /// Number of fetches still streaming, of any operation kind.
    pub fn live_streams(&self) -> BridgeResult<usize> {
        Ok(self.lock()?.streams.len())
    }

    /// Number of parsed, not yet discarded queries.
    pub fn parsed_queries(&self) -> BridgeResult<usize> {
        Ok(self.lock()?.queries.len())
    }

    fn lock(&self) -> BridgeResult<MutexGuard<'_, EngineState>> {
        lock_state(&self.state)
    }

    /// Validate the request and register its stream.
    fn prepare_stream(&self, request: &FetchRequest) -> BridgeResult<StreamWorker> {
        let query_id = request.query_id;
        request.parsed_variables()?;

        let mut state = self.lock()?;
        let query = state
            .queries
            .get(&query_id)
            .ok_or(ValidationError::UnknownQuery { id: query_id })?;
        let kind = query.kind;
        let results = state.documents.get(&query.text).cloned().unwrap_or_else(|| {
            vec![Resolved::Error(format!(
                "no result registered for operation '{}'",
                request.operation_name
            ))]
        });

        let (tx, rx) = bounded::<String>(self.stream_capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let generation = state.next_generation;
        state.next_generation += 1;

        let live = LiveStream {
            kind,
            generation,
            tx,
            cancelled: Arc::clone(&cancelled),
        };
        if let Some(previous) = state.streams.insert(query_id, live) {
            debug!(%query_id, "fetch replaces a running stream");
            previous.cancel();
        }

        Ok(StreamWorker {
            query_id,
            kind,
            generation,
            results,
            rx,
            cancelled,
            state: Arc::clone(&self.state),
        })
    }
}

/// Feeds one fetch's payloads into its sink on a dedicated thread.
struct StreamWorker {
    query_id: QueryId,
    kind: OperationKind,
    generation: u64,
    results: Vec<Resolved>,
    rx: Receiver<String>,
    cancelled: Arc<AtomicBool>,
    state: Arc<Mutex<EngineState>>,
}

impl StreamWorker {
    fn spawn(self, sink: StreamSink) -> BridgeResult<()> {
        let query_id = self.query_id;
        let generation = self.generation;
        let state = Arc::clone(&self.state);

        let spawned = thread::Builder::new()
            .name(format!("querybridge-stream-{query_id}"))
            .spawn(move || self.run(sink));

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                // The closure and its sink are gone; the sink completed on drop.
                retire(&state, query_id, generation);
                Err(BridgeError::internal(format!("failed to spawn stream worker: {e}")))
            }
        }
    }

    fn run(self, sink: StreamSink) {
        for result in &self.results {
            if self.is_cancelled() {
                break;
            }
            sink.data(result.to_payload());
        }

        if self.kind == OperationKind::Subscription {
            // Ends once the engine drops the sender; accepted publishes still drain.
            for payload in &self.rx {
                sink.data(payload);
            }
        }

        retire(&self.state, self.query_id, self.generation);
        sink.complete();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Forget a finished stream unless a newer fetch has replaced it.
fn retire(state: &Mutex<EngineState>, query_id: QueryId, generation: u64) {
    match lock_state(state) {
        Ok(mut state) => {
            if state.streams.get(&query_id).is_some_and(|live| live.generation == generation) {
                state.streams.remove(&query_id);
            }
        }
        Err(err) => warn!(%query_id, error = %err, "failed to retire stream"),
    }
}

impl QueryEngine for InMemoryEngine {
    fn start_service(&self) -> BridgeResult<()> {
        self.lock()?.started = true;
        debug!("in-memory engine started");
        Ok(())
    }

    fn stop_service(&self) -> BridgeResult<()> {
        let mut state = self.lock()?;
        state.started = false;
        let ended = state.streams.len();
        for (_, live) in state.streams.drain() {
            live.cancel();
        }
        state.queries.clear();
        debug!(ended, "in-memory engine stopped");
        Ok(())
    }

    fn parse_query(&self, text: &str) -> BridgeResult<Option<QueryId>> {
        let mut state = self.lock()?;
        if !state.started {
            return Err(BridgeError::Execution(ExecutionError::Engine {
                message: "service is not started".to_string(),
            }));
        }

        let text = normalize(text);
        let Some(kind) = classify(&text) else {
            debug!("query text did not parse");
            return Ok(None);
        };

        let next = state.queries.keys().next_back().map_or(1, |id| id.get() + 1);
        let query_id = QueryId::new(next);
        state.queries.insert(query_id, ParsedQuery { kind, text });
        debug!(%query_id, ?kind, "query parsed");
        Ok(Some(query_id))
    }

    fn discard_query(&self, query_id: QueryId) -> BridgeResult<()> {
        self.lock()?.queries.remove(&query_id);
        Ok(())
    }

    fn fetch_query(&self, request: FetchRequest, sink: StreamSink) {
        let query_id = request.query_id;

        let worker = match self.prepare_stream(&request) {
            Ok(worker) => worker,
            Err(err) => {
                error!(%query_id, error = %err, "failed to prepare fetch");
                sink.complete();
                return;
            }
        };

        if let Err(err) = worker.spawn(sink) {
            error!(%query_id, error = %err, "failed to start stream");
        }
    }

    fn unsubscribe(&self, query_id: QueryId) -> BridgeResult<()> {
        if let Some(live) = self.lock()?.streams.remove(&query_id) {
            live.cancel();
            debug!(%query_id, "stream cancelled");
        }
        Ok(())
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn classify(text: &str) -> Option<OperationKind> {
    if !text.ends_with('}') || !braces_balanced(text) {
        return None;
    }

    let captures = operation_header().captures(text)?;
    Some(match captures.get(1).map(|m| m.as_str()) {
        Some("mutation") => OperationKind::Mutation,
        Some("subscription") => OperationKind::Subscription,
        _ => OperationKind::Query,
    })
}

fn braces_balanced(text: &str) -> bool {
    let mut depth: usize = 0;
    for c in text.chars() {
        match c {
            '{' => depth += 1,
            '}' => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            _ => {}
        }
    }
    depth == 0
}
