//! Messages exchanged across the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::{FetchRequest, QueryId};

/// Correlation wrapper for caller-to-engine messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Fresh per message; replies and logs refer to it.
    pub request_id: Uuid,
    /// When the caller built the message.
    pub sent_at: DateTime<Utc>,
    /// The wrapped request.
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wrap `body` with a new request id stamped now.
    #[must_use]
    pub fn new(body: T) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            sent_at: Utc::now(),
            body,
        }
    }
}

/// Unary calls; each gets exactly one `BoundaryResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoundaryRequest {
    /// Start the engine.
    Start,
    /// Stop the engine, ending every stream.
    Stop,
    /// Parse query text into a query id.
    Parse {
        /// Query text.
        query: String,
    },
    /// Release a parsed query.
    Discard {
        /// Query to release.
        query_id: QueryId,
    },
    /// End a running stream early.
    Unsubscribe {
        /// Stream to end.
        query_id: QueryId,
    },
}

impl BoundaryRequest {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Parse { .. } => "parse",
            Self::Discard { .. } => "discard",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Reply to a `BoundaryRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoundaryResponse {
    /// The request succeeded and carries no value.
    Ack,
    /// Result of a parse; `None` means the text did not parse.
    Parsed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_id: Option<QueryId>,
    },
    /// The engine reported an error.
    Failed {
        /// Engine error text.
        message: String,
    },
}

/// Everything the caller sends toward the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "envelope", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A unary call awaiting one reply.
    Invoke(Envelope<BoundaryRequest>),
    /// A fetch; its results come back as `ChannelEvent`s.
    Fetch(Envelope<FetchRequest>),
}

/// One-way engine-to-caller signal, multiplexed by query id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// One streamed result, still serialized.
    Data {
        /// Stream the result belongs to.
        query_id: QueryId,
        /// Serialized response document.
        payload: String,
    },
    /// Terminal signal for the stream.
    Completed {
        /// Stream that ended.
        query_id: QueryId,
    },
}

impl ChannelEvent {
    /// Stream the event belongs to.
    #[must_use]
    pub const fn query_id(&self) -> QueryId {
        match self {
            Self::Data { query_id, .. } | Self::Completed { query_id } => *query_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape_is_tagged() {
        let json = serde_json::to_value(BoundaryRequest::Parse {
            query: "{ a }".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "parse", "query": "{ a }"}));
    }

    #[test]
    fn parse_failure_omits_query_id() {
        let json = serde_json::to_value(BoundaryResponse::Parsed { query_id: None }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "parsed"}));

        let back: BoundaryResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, BoundaryResponse::Parsed { query_id: None });
    }

    #[test]
    fn channel_event_exposes_query_id() {
        let data = ChannelEvent::Data {
            query_id: QueryId::new(3),
            payload: "{}".to_string(),
        };
        assert_eq!(data.query_id(), QueryId::new(3));
        assert_eq!(ChannelEvent::Completed { query_id: QueryId::new(4) }.query_id(), QueryId::new(4));
    }
}
