//! Caller-side bridge.
//!
//! `QueryBridge` is what a UI context talks to. It owns the gate, the router
//! and the caller end of the boundary, and runs an event pump thread that
//! feeds channel events into the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::engine::QueryEngine;
use crate::error::{BridgeError, BridgeResult, ExecutionError};
use crate::gate::{ServiceGate, ServiceState};
use crate::host::EngineHost;
use crate::query::{FetchRequest, QueryId};
use crate::router::SessionRouter;
use crate::stream::QueryStream;
use crate::transport::{pair, ChannelEvent, ClientEndpoint, EventReceiver};

/// Caller-side entry point to a query engine across the boundary.
pub struct QueryBridge {
    config: BridgeConfig,
    client: Arc<ClientEndpoint>,
    router: Arc<SessionRouter>,
    contexts_closed: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBridge")
            .field("state", &self.router.gate().state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Connect a bridge to an engine through an in-process boundary.
///
/// Returns the bridge and the host serving `engine`. Keep the host alive for
/// as long as the bridge is in use.
pub fn in_process(engine: Arc<dyn QueryEngine>, config: BridgeConfig) -> BridgeResult<(QueryBridge, EngineHost)> {
    config.validate()?;
    let (client, endpoint) = pair(config.transport.clone());
    let host = EngineHost::spawn(engine, endpoint)?;
    let bridge = QueryBridge::connect(client, config)?;
    Ok((bridge, host))
}

impl QueryBridge {
    /// Wrap the caller end of a boundary and start the event pump.
    ///
    /// The gate starts out stopped; call [`QueryBridge::start_service`].
    pub fn connect(client: ClientEndpoint, config: BridgeConfig) -> BridgeResult<Self> {
        let client = Arc::new(client);
        let gate = Arc::new(ServiceGate::new(client.clone()));
        let router = Arc::new(SessionRouter::new(gate));

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let events = client.events();
        let pump_router = Arc::clone(&router);
        let pump = thread::Builder::new()
            .name("querybridge-events".to_string())
            .spawn(move || event_pump(&pump_router, &events, &shutdown_rx))
            .map_err(|e| BridgeError::internal(format!("failed to spawn event pump: {e}")))?;

        Ok(Self {
            config,
            client,
            router,
            contexts_closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// The router owning the active subscriber set.
    #[must_use]
    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// The lifecycle gate.
    #[must_use]
    pub fn gate(&self) -> &Arc<ServiceGate> {
        self.router.gate()
    }

    /// True while the gate is open.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.router.gate().is_started()
    }

    /// Start the engine and open the gate. Returns the prior state.
    pub fn start_service(&self) -> BridgeResult<ServiceState> {
        self.router.gate().start()
    }

    /// Close the gate, then stop the engine. Returns the prior state.
    ///
    /// Subscribers whose completion has not arrived yet stay registered:
    /// their events are dropped by the closed gate.
    pub fn stop_service(&self) -> BridgeResult<ServiceState> {
        let prior = self.router.gate().stop()?;
        let leaked = self.router.active_count()?;
        if leaked > 0 {
            debug!(leaked, "service stopped with subscribers still waiting for completion");
        }
        Ok(prior)
    }

    /// Parse query text. `Ok(None)` means the text did not parse; nothing is registered.
    pub fn parse_query(&self, text: &str) -> BridgeResult<Option<QueryId>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.client.parse(text)
    }

    /// Release a parsed query that is not streaming.
    pub fn discard_query(&self, query_id: QueryId) -> BridgeResult<()> {
        self.client.discard(query_id)
    }

    /// Begin a fetch, delivering payloads to `on_data` and the end of the
    /// stream to `on_complete`.
    ///
    /// The subscriber is registered before the fetch is sent, so no event can
    /// outrun it. If the fetch cannot be sent the subscriber is withdrawn and
    /// the error returned.
    pub fn fetch_query<D, C>(&self, request: FetchRequest, on_data: D, on_complete: C) -> BridgeResult<()>
    where
        D: Fn(JsonValue) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.fetch_with(request, Arc::new(on_data), Box::new(on_complete))
    }

    /// Begin a fetch and consume it as a [`QueryStream`].
    pub fn fetch_stream(&self, request: FetchRequest) -> BridgeResult<QueryStream> {
        let (stream, callbacks) = QueryStream::new(request.query_id, Arc::clone(&self.client));
        self.fetch_with(request, callbacks.on_data, callbacks.on_complete)?;
        Ok(stream)
    }

    fn fetch_with(
        &self,
        request: FetchRequest,
        on_data: crate::router::DataCallback,
        on_complete: crate::router::CompletionCallback,
    ) -> BridgeResult<()> {
        let query_id = request.query_id;
        let seq = self.router.register_entry(query_id, on_data, on_complete)?;

        match self.client.send_fetch(request) {
            Ok(request_id) => {
                debug!(%query_id, %request_id, "fetch sent");
                Ok(())
            }
            Err(err) => {
                self.router.withdraw(seq)?;
                Err(err)
            }
        }
    }

    /// Ask the engine to end a stream early.
    ///
    /// The engine answers by completing the stream, which retires its
    /// subscribers, provided the service is still started.
    pub fn unsubscribe(&self, query_id: QueryId) -> BridgeResult<()> {
        self.client.unsubscribe(query_id)
    }

    /// Signal that every consumer context has closed.
    ///
    /// Stops the service the first time it is called; later calls do nothing
    /// and return `Ok(false)`.
    pub fn on_all_contexts_closed(&self) -> BridgeResult<bool> {
        if self.contexts_closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        info!("all consumer contexts closed; stopping service");
        self.stop_service()?;
        Ok(true)
    }
}

impl Drop for QueryBridge {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.shutdown_tx.lock() {
            drop(guard.take());
        }

        let handle = self.pump.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            // Dropped from inside a subscriber callback: the pump is this thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn event_pump(router: &SessionRouter, events: &EventReceiver, shutdown: &Receiver<()>) {
    loop {
        select! {
            recv(events.frames()) -> frame => {
                let Ok(frame) = frame else {
                    debug!("event channel closed");
                    break;
                };
                match events.decode(&frame) {
                    Ok(event) => deliver(router, event),
                    Err(err) => warn!(error = %err, "dropping undecodable event"),
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    debug!("event pump exiting");
}

fn deliver(router: &SessionRouter, event: ChannelEvent) {
    let result = match event {
        ChannelEvent::Data { query_id, payload } => router.dispatch_data(query_id, &payload).map(|_| ()),
        ChannelEvent::Completed { query_id } => router.dispatch_completion(query_id).map(|_| ()),
    };

    match result {
        Ok(()) => {}
        Err(BridgeError::Execution(ExecutionError::Disconnected { .. })) => {}
        Err(err) => warn!(error = %err, "event dispatch failed"),
    }
}
