//! Engine-side host worker.
//!
//! The host owns the engine end of the boundary. A dedicated worker thread
//! answers unary calls against the `QueryEngine` and starts fetches, wiring
//! each fetch's `StreamSink` to channel events on the way back.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::engine::{QueryEngine, StreamSink};
use crate::error::{BridgeError, BridgeResult, ExecutionError};
use crate::query::FetchRequest;
use crate::transport::{BoundaryRequest, BoundaryResponse, ChannelEvent, EventSender, HostEndpoint, Incoming};

/// Serves one boundary against one engine.
pub struct EngineHost {
    engine: Arc<dyn QueryEngine>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EngineHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.join.lock().map(|guard| guard.is_some()).unwrap_or(false);
        f.debug_struct("EngineHost").field("running", &running).finish_non_exhaustive()
    }
}

impl EngineHost {
    /// Start the host worker.
    ///
    /// The worker exits once every caller handle for `endpoint` is dropped.
    pub fn spawn(engine: Arc<dyn QueryEngine>, endpoint: HostEndpoint) -> BridgeResult<Self> {
        let worker_engine = Arc::clone(&engine);
        let join = thread::Builder::new()
            .name("querybridge-host".to_string())
            .spawn(move || worker_loop(worker_engine.as_ref(), &endpoint))
            .map_err(|e| BridgeError::internal(format!("failed to spawn host worker: {e}")))?;

        Ok(Self {
            engine,
            join: Mutex::new(Some(join)),
        })
    }

    /// The engine being served.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn QueryEngine> {
        &self.engine
    }

    /// Wait for the worker to exit.
    ///
    /// Blocks until every caller handle for the boundary has been dropped.
    pub fn join(self) -> BridgeResult<()> {
        let handle = self
            .join
            .lock()
            .map_err(|_| BridgeError::internal("host join lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| BridgeError::internal("host worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for EngineHost {
    fn drop(&mut self) {
        // Detach: the worker exits on its own once the callers are gone, and
        // joining here would deadlock while a caller is still alive.
        if let Ok(mut guard) = self.join.lock() {
            drop(guard.take());
        }
    }
}

fn worker_loop(engine: &dyn QueryEngine, endpoint: &HostEndpoint) {
    let events = endpoint.events();
    loop {
        match endpoint.recv() {
            Ok(Incoming::Invoke {
                request_id,
                request,
                responder,
            }) => {
                debug!(%request_id, request = request.name(), "handling request");
                responder.respond(&handle_request(engine, request));
            }
            Ok(Incoming::Fetch { request_id, request }) => {
                debug!(%request_id, query_id = %request.query_id, "starting fetch");
                start_fetch(engine, &events, request);
            }
            Err(BridgeError::Execution(ExecutionError::Disconnected { .. })) => break,
            Err(err) => warn!(error = %err, "dropping undecodable request"),
        }
    }
    debug!("host worker exiting");
}

fn handle_request(engine: &dyn QueryEngine, request: BoundaryRequest) -> BoundaryResponse {
    let name = request.name();
    let result = match request {
        BoundaryRequest::Start => engine.start_service().map(|()| BoundaryResponse::Ack),
        BoundaryRequest::Stop => engine.stop_service().map(|()| BoundaryResponse::Ack),
        BoundaryRequest::Parse { query } => engine
            .parse_query(&query)
            .map(|query_id| BoundaryResponse::Parsed { query_id }),
        BoundaryRequest::Discard { query_id } => engine.discard_query(query_id).map(|()| BoundaryResponse::Ack),
        BoundaryRequest::Unsubscribe { query_id } => engine.unsubscribe(query_id).map(|()| BoundaryResponse::Ack),
    };

    result.unwrap_or_else(|err| {
        error!(request = name, error = %err, "engine request failed");
        BoundaryResponse::Failed {
            message: err.to_string(),
        }
    })
}

fn start_fetch(engine: &dyn QueryEngine, events: &EventSender, request: FetchRequest) {
    let query_id = request.query_id;
    let data_events = events.clone();
    let done_events = events.clone();

    let sink = StreamSink::new(
        query_id,
        move |payload| {
            if let Err(err) = data_events.emit(&ChannelEvent::Data { query_id, payload }) {
                warn!(%query_id, error = %err, "data event not delivered");
            }
        },
        move || {
            if let Err(err) = done_events.emit(&ChannelEvent::Completed { query_id }) {
                warn!(%query_id, error = %err, "completion event not delivered");
            }
        },
    );

    engine.fetch_query(request, sink);
}
