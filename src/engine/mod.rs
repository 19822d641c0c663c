//! Query engine adapter.
//!
//! The engine parses and executes queries; this crate only drives it. The
//! `QueryEngine` trait is the contract the engine host calls into, and
//! `StreamSink` is how the engine hands streamed results back.

/// Canned-result engine for tests, benches and the demo binary.
pub mod memory;

use std::sync::Arc;

use crate::error::BridgeResult;
use crate::query::{FetchRequest, QueryId};

pub use memory::{InMemoryEngine, OperationKind, Resolved};

/// Interface to a query engine.
///
/// # Streaming contract
/// `fetch_query` returns immediately. The engine then calls
/// [`StreamSink::data`] zero or more times and finishes the sink exactly once,
/// from its own execution context.
pub trait QueryEngine: Send + Sync {
    /// Begin accepting queries.
    fn start_service(&self) -> BridgeResult<()>;

    /// Stop accepting queries and end every live stream.
    fn stop_service(&self) -> BridgeResult<()>;

    /// Parse query text. `Ok(None)` means the text did not parse.
    fn parse_query(&self, text: &str) -> BridgeResult<Option<QueryId>>;

    /// Release engine-side resources for a parsed query.
    fn discard_query(&self, query_id: QueryId) -> BridgeResult<()>;

    /// Begin streaming results for a parsed query into `sink`.
    fn fetch_query(&self, request: FetchRequest, sink: StreamSink);

    /// Request early termination of a live stream.
    ///
    /// Terminating a stream finishes its sink, so a completion still follows.
    fn unsubscribe(&self, query_id: QueryId) -> BridgeResult<()>;
}

/// Callback pair handed to the engine for one fetch.
///
/// Completion is signalled by [`StreamSink::complete`] or by dropping the sink,
/// whichever comes first, so a stream always terminates exactly once even if
/// the engine's worker unwinds.
pub struct StreamSink {
    query_id: QueryId,
    on_data: Arc<dyn Fn(String) + Send + Sync>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamSink {
    /// Wrap a data callback and a completion callback for `query_id`.
    pub fn new<D, C>(query_id: QueryId, on_data: D, on_complete: C) -> Self
    where
        D: Fn(String) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self {
            query_id,
            on_data: Arc::new(on_data),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// The query this sink streams for.
    #[must_use]
    pub const fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Deliver one serialized payload.
    pub fn data(&self, payload: String) {
        (self.on_data)(payload);
    }

    /// Finish the stream.
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("query_id", &self.query_id)
            .field("completed", &self.on_complete.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn sink_completes_exactly_once() {
        let completions = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completions);
        let sink = StreamSink::new(QueryId::new(1), |_| {}, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sink.complete();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_sink_completes_it() {
        let completions = Arc::new(AtomicUsize::new(0));
        let payloads = Arc::new(Mutex::new(Vec::new()));
        {
            let c = Arc::clone(&completions);
            let p = Arc::clone(&payloads);
            let sink = StreamSink::new(
                QueryId::new(2),
                move |payload| p.lock().unwrap().push(payload),
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            );
            sink.data("{}".to_string());
        }
        assert_eq!(*payloads.lock().unwrap(), vec!["{}".to_string()]);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }
}
