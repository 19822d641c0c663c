use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, Sender};
use serde_json::Value as JsonValue;

use crate::error::{BridgeError, BridgeResult, ExecutionError};
use crate::query::QueryId;
use crate::router::{CompletionCallback, DataCallback};
use crate::transport::{BoundaryRequest, ClientEndpoint};

/// A lazy, finite sequence of payloads for one fetch.
///
/// The sequence ends when the engine completes the stream (or the router
/// discards the subscriber). Every payload delivered to the subscriber is
/// kept until read: the buffer is unbounded so the event pump never waits on
/// a slow reader. Dropping the stream before completion attempts best-effort
/// unsubscription.
///
/// A stream whose completion was suppressed because the service stopped
/// does not end until the bridge is dropped; use
/// [`QueryStream::recv_timeout`] when that matters.
#[derive(Debug)]
pub struct QueryStream {
    query_id: QueryId,
    data_rx: Receiver<JsonValue>,
    done_rx: Receiver<()>,
    shared: Arc<StreamShared>,
    client: Arc<ClientEndpoint>,
    unsubscribed: AtomicBool,
    completion_seen: bool,
    finished: bool,
}

#[derive(Debug, Default)]
struct StreamShared {
    completed: AtomicBool,
}

/// Producer half: the callback pair registered with the router.
pub(crate) struct StreamCallbacks {
    pub on_data: DataCallback,
    pub on_complete: CompletionCallback,
}

impl QueryStream {
    pub(crate) fn new(query_id: QueryId, client: Arc<ClientEndpoint>) -> (Self, StreamCallbacks) {
        let (data_tx, data_rx) = unbounded::<JsonValue>();
        let (done_tx, done_rx) = bounded::<()>(1);
        let shared = Arc::new(StreamShared::default());

        let callbacks = StreamCallbacks {
            on_data: data_callback(data_tx),
            on_complete: completion_callback(done_tx, Arc::clone(&shared)),
        };

        let stream = Self {
            query_id,
            data_rx,
            done_rx,
            shared,
            client,
            unsubscribed: AtomicBool::new(false),
            completion_seen: false,
            finished: false,
        };
        (stream, callbacks)
    }

    /// The query this stream belongs to.
    #[must_use]
    pub const fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// True once the engine's completion has been delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Receive the next payload (blocking). `Ok(None)` marks the end of the stream.
    pub fn recv(&mut self) -> BridgeResult<Option<JsonValue>> {
        self.next_within(None)
    }

    /// Receive the next payload, waiting at most `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> BridgeResult<Option<JsonValue>> {
        self.next_within(Some(timeout))
    }

    /// Ask the engine to end this stream early.
    ///
    /// Non-blocking and idempotent. The engine still completes the stream, so
    /// `recv` returns the remaining payloads and then `None`.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.client.invoke_detached(BoundaryRequest::Unsubscribe {
            query_id: self.query_id,
        });
    }

    fn next_within(&mut self, timeout: Option<Duration>) -> BridgeResult<Option<JsonValue>> {
        if self.finished {
            return Ok(None);
        }

        // Buffered payloads always precede completion.
        if let Ok(value) = self.data_rx.try_recv() {
            return Ok(Some(value));
        }
        if self.completion_seen {
            return Ok(self.finish());
        }

        let started = Instant::now();
        let timer = timeout.map_or_else(never, after);
        let data_rx = self.data_rx.clone();
        let done_rx = self.done_rx.clone();

        select! {
            recv(data_rx) -> msg => Ok(match msg {
                Ok(value) => Some(value),
                Err(_) => self.finish(),
            }),
            // Fires on completion, or on disconnect if the subscriber was discarded.
            recv(done_rx) -> _ => {
                self.completion_seen = true;
                Ok(match self.data_rx.try_recv() {
                    Ok(value) => Some(value),
                    Err(_) => self.finish(),
                })
            },
            recv(timer) -> _ => Err(BridgeError::Execution(ExecutionError::Timeout {
                duration_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
            })),
        }
    }

    fn finish(&mut self) -> Option<JsonValue> {
        self.finished = true;
        None
    }
}

impl Iterator for QueryStream {
    type Item = JsonValue;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().ok().flatten()
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        // Best-effort: do not block on shutdown.
        if !self.is_completed() {
            self.unsubscribe();
        }
    }
}

fn data_callback(tx: Sender<JsonValue>) -> DataCallback {
    Arc::new(move |value| {
        // Fails only once the stream itself is gone.
        let _ = tx.send(value);
    })
}

fn completion_callback(tx: Sender<()>, shared: Arc<StreamShared>) -> CompletionCallback {
    Box::new(move || {
        shared.completed.store(true, Ordering::Release);
        let _ = tx.try_send(());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::transport::{pair, TransportConfig};

    fn detached_client() -> Arc<ClientEndpoint> {
        let (client, _host) = pair(TransportConfig::default());
        Arc::new(client)
    }

    #[test]
    fn yields_payloads_then_ends_after_completion() {
        let (mut stream, callbacks) = QueryStream::new(QueryId::new(1), detached_client());

        (callbacks.on_data)(json!(1));
        (callbacks.on_data)(json!(2));
        (callbacks.on_complete)();

        assert!(stream.is_completed());
        assert_eq!(stream.recv().unwrap(), Some(json!(1)));
        assert_eq!(stream.recv().unwrap(), Some(json!(2)));
        assert_eq!(stream.recv().unwrap(), None);
        assert_eq!(stream.recv().unwrap(), None);
    }

    #[test]
    fn iterator_collects_whole_stream() {
        let (stream, callbacks) = QueryStream::new(QueryId::new(1), detached_client());
        let on_data = Arc::clone(&callbacks.on_data);
        let producer = std::thread::spawn(move || {
            for i in 0..3 {
                on_data(json!(i));
            }
            (callbacks.on_complete)();
        });

        let items: Vec<JsonValue> = stream.collect();
        producer.join().unwrap();
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn recv_timeout_reports_timeout_while_open() {
        let (mut stream, _callbacks) = QueryStream::new(QueryId::new(1), detached_client());
        let err = stream.recv_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, BridgeError::Execution(ExecutionError::Timeout { .. })));
    }

    #[test]
    fn unread_payloads_are_all_kept_until_completion_is_read() {
        let (stream, callbacks) = QueryStream::new(QueryId::new(1), detached_client());
        for i in 0..5000 {
            (callbacks.on_data)(json!(i));
        }
        (callbacks.on_complete)();

        let items: Vec<JsonValue> = stream.collect();
        assert_eq!(items.len(), 5000);
        assert!(items.iter().enumerate().all(|(i, v)| *v == json!(i)));
    }

    #[test]
    fn discarded_subscriber_ends_stream() {
        let (mut stream, callbacks) = QueryStream::new(QueryId::new(1), detached_client());
        drop(callbacks);
        assert_eq!(stream.recv_timeout(Duration::from_secs(1)).unwrap(), None);
        assert!(!stream.is_completed());
    }
}
