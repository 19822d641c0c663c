//! In-process boundary channel.
//!
//! `pair` returns the two ends of a boundary backed by bounded crossbeam
//! queues. Only encoded frames cross it, so the two sides share no state and
//! a pipe or socket can replace the queues without touching either side.
//!
//! - Unary calls carry a one-shot reply queue; the caller waits up to
//!   `request_timeout` for the answer.
//! - Fetches are fire-and-forget.
//! - Channel events travel on a single FIFO queue, which preserves per-query
//!   ordering. Emission blocks while the queue is full, so no event is lost
//!   while the caller side is alive.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult, ExecutionError, TransportError};
use crate::gate::ServiceControl;
use crate::query::{FetchRequest, QueryId};

use super::codec::{self, MAX_FRAME_BYTES};
use super::message::{BoundaryRequest, BoundaryResponse, ChannelEvent, ClientMessage, Envelope};

const REQUEST_PATH: &str = "boundary_requests";
const EVENT_PATH: &str = "boundary_events";

/// Boundary channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Max queued caller-to-engine messages.
    pub request_queue_capacity: usize,
    /// Max queued engine-to-caller channel events.
    pub event_queue_capacity: usize,
    /// How long a unary call waits for its reply.
    pub request_timeout_ms: u64,
    /// Largest frame accepted in either direction.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_queue_capacity: 1024,
            event_queue_capacity: 4096,
            request_timeout_ms: 5_000,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl TransportConfig {
    /// `request_timeout_ms` as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

struct Inbound {
    frame: Vec<u8>,
    reply: Option<Sender<Vec<u8>>>,
}

/// Create a connected client/host pair.
#[must_use]
pub fn pair(config: TransportConfig) -> (ClientEndpoint, HostEndpoint) {
    let (request_tx, request_rx) = bounded::<Inbound>(config.request_queue_capacity.max(1));
    let (event_tx, event_rx) = bounded::<Vec<u8>>(config.event_queue_capacity.max(1));

    let client = ClientEndpoint {
        config: config.clone(),
        request_tx,
        event_rx,
    };
    let host = HostEndpoint {
        events: EventSender {
            max_frame_bytes: config.max_frame_bytes,
            tx: event_tx,
        },
        config,
        request_rx,
    };
    (client, host)
}

// ----------------------------------------------------------------------------
// Caller side
// ----------------------------------------------------------------------------

/// Caller end of the boundary.
pub struct ClientEndpoint {
    config: TransportConfig,
    request_tx: Sender<Inbound>,
    event_rx: Receiver<Vec<u8>>,
}

impl std::fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEndpoint").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ClientEndpoint {
    /// Issue a unary call and wait for its reply.
    pub fn invoke(&self, request: BoundaryRequest) -> BridgeResult<BoundaryResponse> {
        let name = request.name();
        let envelope = Envelope::new(request);
        let request_id = envelope.request_id;
        let frame = codec::encode(&ClientMessage::Invoke(envelope), self.config.max_frame_bytes)?;

        let (reply_tx, reply_rx) = bounded::<Vec<u8>>(1);
        self.submit(Inbound {
            frame,
            reply: Some(reply_tx),
        })?;
        trace!(%request_id, request = name, "request sent");

        let timeout = self.config.request_timeout();
        let reply = reply_rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => BridgeError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => BridgeError::disconnected(REQUEST_PATH),
        })?;

        codec::decode(&reply, self.config.max_frame_bytes)
    }

    /// Issue a unary call without waiting for, or receiving, the reply.
    ///
    /// Never blocks; a full queue drops the request.
    pub fn invoke_detached(&self, request: BoundaryRequest) -> BridgeResult<()> {
        let frame = codec::encode(&ClientMessage::Invoke(Envelope::new(request)), self.config.max_frame_bytes)?;
        self.submit(Inbound { frame, reply: None })
    }

    /// Send a fetch; results arrive as channel events.
    pub fn send_fetch(&self, request: FetchRequest) -> BridgeResult<Uuid> {
        let envelope = Envelope::new(request);
        let request_id = envelope.request_id;
        let frame = codec::encode(&ClientMessage::Fetch(envelope), self.config.max_frame_bytes)?;
        self.submit(Inbound { frame, reply: None })?;
        Ok(request_id)
    }

    /// A receiver for engine-to-caller channel events.
    #[must_use]
    pub fn events(&self) -> EventReceiver {
        EventReceiver {
            rx: self.event_rx.clone(),
            max_frame_bytes: self.config.max_frame_bytes,
        }
    }

    fn submit(&self, inbound: Inbound) -> BridgeResult<()> {
        self.request_tx.try_send(inbound).map_err(|err| match err {
            TrySendError::Full(_) => BridgeError::Execution(ExecutionError::QueueFull {
                path: REQUEST_PATH.to_string(),
                capacity: self.config.request_queue_capacity,
            }),
            TrySendError::Disconnected(_) => BridgeError::disconnected(REQUEST_PATH),
        })
    }

    fn expect_ack(&self, request: BoundaryRequest) -> BridgeResult<()> {
        let name = request.name();
        match self.invoke(request)? {
            BoundaryResponse::Ack => Ok(()),
            BoundaryResponse::Failed { message } => Err(TransportError::ServerError { message }.into()),
            other => Err(ExecutionError::UnexpectedResponse {
                request: name.to_string(),
                response: format!("{other:?}"),
            }
            .into()),
        }
    }

    /// Parse query text on the engine side.
    pub fn parse(&self, query: &str) -> BridgeResult<Option<QueryId>> {
        match self.invoke(BoundaryRequest::Parse {
            query: query.to_string(),
        })? {
            BoundaryResponse::Parsed { query_id } => Ok(query_id),
            BoundaryResponse::Failed { message } => Err(TransportError::ServerError { message }.into()),
            other => Err(ExecutionError::UnexpectedResponse {
                request: "parse".to_string(),
                response: format!("{other:?}"),
            }
            .into()),
        }
    }

    /// Release a parsed query on the engine side.
    pub fn discard(&self, query_id: QueryId) -> BridgeResult<()> {
        self.expect_ack(BoundaryRequest::Discard { query_id })
    }

    /// Ask the engine to end a stream and wait for its acknowledgement.
    pub fn unsubscribe(&self, query_id: QueryId) -> BridgeResult<()> {
        self.expect_ack(BoundaryRequest::Unsubscribe { query_id })
    }
}

impl ServiceControl for ClientEndpoint {
    fn start_service(&self) -> BridgeResult<()> {
        self.expect_ack(BoundaryRequest::Start)
    }

    fn stop_service(&self) -> BridgeResult<()> {
        self.expect_ack(BoundaryRequest::Stop)
    }
}

/// Receives decoded channel events.
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<Vec<u8>>,
    max_frame_bytes: usize,
}

impl EventReceiver {
    /// Receive the next event (blocking).
    ///
    /// Returns `Disconnected` once the engine side is gone and the queue is
    /// drained. A frame that fails to decode is returned as an error; the
    /// receiver stays usable.
    pub fn recv(&self) -> BridgeResult<ChannelEvent> {
        let frame = self.rx.recv().map_err(|_| BridgeError::disconnected(EVENT_PATH))?;
        codec::decode(&frame, self.max_frame_bytes)
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> BridgeResult<ChannelEvent> {
        let frame = self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => BridgeError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => BridgeError::disconnected(EVENT_PATH),
        })?;
        codec::decode(&frame, self.max_frame_bytes)
    }

    /// Decode a frame taken from [`EventReceiver::frames`].
    pub fn decode(&self, frame: &[u8]) -> BridgeResult<ChannelEvent> {
        codec::decode(frame, self.max_frame_bytes)
    }

    /// The raw frame queue, for use in `select!`.
    pub(crate) fn frames(&self) -> &Receiver<Vec<u8>> {
        &self.rx
    }
}

// ----------------------------------------------------------------------------
// Engine side
// ----------------------------------------------------------------------------

/// Engine end of the boundary.
pub struct HostEndpoint {
    config: TransportConfig,
    request_rx: Receiver<Inbound>,
    events: EventSender,
}

impl std::fmt::Debug for HostEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEndpoint").field("config", &self.config).finish_non_exhaustive()
    }
}

/// A decoded caller-to-engine message.
#[derive(Debug)]
pub enum Incoming {
    /// A unary call; answer it through `responder`.
    Invoke {
        /// Correlation id from the envelope.
        request_id: Uuid,
        /// The call.
        request: BoundaryRequest,
        /// One-shot reply handle.
        responder: Responder,
    },
    /// A fetch; results go out as events.
    Fetch {
        /// Correlation id from the envelope.
        request_id: Uuid,
        /// What to stream.
        request: FetchRequest,
    },
}

impl HostEndpoint {
    /// Receive the next caller message (blocking).
    ///
    /// Returns `Disconnected` once every caller handle is gone.
    pub fn recv(&self) -> BridgeResult<Incoming> {
        let inbound = self.request_rx.recv().map_err(|_| BridgeError::disconnected(REQUEST_PATH))?;
        let message: ClientMessage = match codec::decode(&inbound.frame, self.config.max_frame_bytes) {
            Ok(message) => message,
            Err(err) => {
                // Answer the caller so it does not wait out its timeout.
                if let Some(reply) = inbound.reply {
                    Responder::new(Some(reply), self.config.max_frame_bytes).respond(&BoundaryResponse::Failed {
                        message: err.to_string(),
                    });
                }
                return Err(err);
            }
        };

        Ok(match message {
            ClientMessage::Invoke(envelope) => Incoming::Invoke {
                request_id: envelope.request_id,
                request: envelope.body,
                responder: Responder::new(inbound.reply, self.config.max_frame_bytes),
            },
            ClientMessage::Fetch(envelope) => Incoming::Fetch {
                request_id: envelope.request_id,
                request: envelope.body,
            },
        })
    }

    /// A cloneable handle for emitting channel events.
    #[must_use]
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }
}

/// Answers one unary call.
#[derive(Debug)]
pub struct Responder {
    reply: Option<Sender<Vec<u8>>>,
    max_frame_bytes: usize,
}

impl Responder {
    fn new(reply: Option<Sender<Vec<u8>>>, max_frame_bytes: usize) -> Self {
        Self { reply, max_frame_bytes }
    }

    /// Send the response. A detached call or a caller that stopped waiting is ignored.
    pub fn respond(self, response: &BoundaryResponse) {
        let Some(reply) = self.reply else {
            return;
        };
        match codec::encode(response, self.max_frame_bytes) {
            Ok(frame) => {
                let _ = reply.try_send(frame);
            }
            Err(err) => warn!(error = %err, "failed to encode response"),
        }
    }
}

/// Emits channel events toward the caller.
#[derive(Debug, Clone)]
pub struct EventSender {
    max_frame_bytes: usize,
    tx: Sender<Vec<u8>>,
}

impl EventSender {
    /// Queue one event, waiting for room if the queue is full.
    ///
    /// Fails only if the event cannot be encoded or the caller side is gone.
    pub fn emit(&self, event: &ChannelEvent) -> BridgeResult<()> {
        let frame = codec::encode(event, self.max_frame_bytes)?;
        self.tx.send(frame).map_err(|_| BridgeError::disconnected(EVENT_PATH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn unary_call_round_trips_through_host() {
        let (client, host) = pair(TransportConfig::default());

        let server = thread::spawn(move || match host.recv().unwrap() {
            Incoming::Invoke { request, responder, .. } => {
                assert_eq!(request, BoundaryRequest::Parse { query: "{ a }".to_string() });
                responder.respond(&BoundaryResponse::Parsed {
                    query_id: Some(QueryId::new(1)),
                });
            }
            other => panic!("expected invoke, got {other:?}"),
        });

        assert_eq!(client.parse("{ a }").unwrap(), Some(QueryId::new(1)));
        server.join().unwrap();
    }

    #[test]
    fn unanswered_call_times_out() {
        let (client, _host) = pair(TransportConfig {
            request_timeout_ms: 20,
            ..TransportConfig::default()
        });

        let err = client.invoke(BoundaryRequest::Start).unwrap_err();
        assert!(matches!(err, BridgeError::Execution(ExecutionError::Timeout { duration_ms: 20 })));
    }

    #[test]
    fn call_to_dropped_host_is_disconnected() {
        let (client, host) = pair(TransportConfig::default());
        drop(host);

        let err = client.invoke(BoundaryRequest::Stop).unwrap_err();
        let BridgeError::Execution(ExecutionError::Disconnected { path }) = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(path, REQUEST_PATH);
    }

    #[test]
    fn full_request_queue_is_reported() {
        let (client, _host) = pair(TransportConfig {
            request_queue_capacity: 1,
            ..TransportConfig::default()
        });

        client.send_fetch(FetchRequest::new(QueryId::new(1))).unwrap();
        let err = client.send_fetch(FetchRequest::new(QueryId::new(2))).unwrap_err();
        assert!(matches!(err, BridgeError::Execution(ExecutionError::QueueFull { capacity: 1, .. })));
        assert!(err.is_retryable());
    }

    #[test]
    fn server_failure_maps_to_transport_error() {
        let (client, host) = pair(TransportConfig::default());

        let server = thread::spawn(move || {
            if let Incoming::Invoke { responder, .. } = host.recv().unwrap() {
                responder.respond(&BoundaryResponse::Failed {
                    message: "engine offline".to_string(),
                });
            }
        });

        let err = client.start_service().unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("engine offline"));
        server.join().unwrap();
    }

    #[test]
    fn events_preserve_order() {
        let (client, host) = pair(TransportConfig::default());
        let events = host.events();
        let q = QueryId::new(7);

        for i in 0..5 {
            events
                .emit(&ChannelEvent::Data {
                    query_id: q,
                    payload: i.to_string(),
                })
                .unwrap();
        }
        events.emit(&ChannelEvent::Completed { query_id: q }).unwrap();

        let rx = client.events();
        for i in 0..5 {
            assert_eq!(
                rx.recv().unwrap(),
                ChannelEvent::Data {
                    query_id: q,
                    payload: i.to_string()
                }
            );
        }
        assert_eq!(rx.recv().unwrap(), ChannelEvent::Completed { query_id: q });
    }

    #[test]
    fn full_event_queue_waits_for_room() {
        let (client, host) = pair(TransportConfig {
            event_queue_capacity: 1,
            ..TransportConfig::default()
        });
        let events = host.events();
        let q = QueryId::new(1);

        let producer = thread::spawn(move || {
            for i in 0..4 {
                events
                    .emit(&ChannelEvent::Data {
                        query_id: q,
                        payload: i.to_string(),
                    })
                    .unwrap();
            }
            events.emit(&ChannelEvent::Completed { query_id: q }).unwrap();
        });

        let rx = client.events();
        let mut received = Vec::new();
        loop {
            thread::sleep(std::time::Duration::from_millis(10));
            match rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap() {
                ChannelEvent::Data { payload, .. } => received.push(payload),
                ChannelEvent::Completed { .. } => break,
            }
        }
        producer.join().unwrap();
        assert_eq!(received, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn emit_to_dropped_caller_is_disconnected() {
        let (client, host) = pair(TransportConfig::default());
        drop(client);

        let err = host.events().emit(&ChannelEvent::Completed { query_id: QueryId::new(1) }).unwrap_err();
        assert!(matches!(err, BridgeError::Execution(ExecutionError::Disconnected { .. })));
    }

    #[test]
    fn fetch_is_delivered_with_its_request_id() {
        let (client, host) = pair(TransportConfig::default());
        let sent = client
            .send_fetch(FetchRequest::new(QueryId::new(2)).operation_name("Q"))
            .unwrap();

        let Incoming::Fetch { request_id, request } = host.recv().unwrap() else {
            panic!("expected fetch");
        };
        assert_eq!(request_id, sent);
        assert_eq!(request.operation_name, "Q");
    }
}
