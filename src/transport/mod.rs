//! Boundary transport.
//!
//! Two message categories cross the boundary, both addressed by a
//! caller-chosen correlation value:
//!
//! - unary request/response calls (start, stop, parse, discard, unsubscribe);
//! - channel events from the engine (data, completion), multiplexed by
//!   `QueryId`, unacknowledged and ordered per query.
//!
//! Fetch is the one fire-and-forget caller message; its results come back as
//! channel events.

/// In-process channel pair.
pub mod channel;
/// JSON frame encoding.
pub mod codec;
/// Wire message types.
pub mod message;

pub use channel::{pair, ClientEndpoint, EventReceiver, EventSender, HostEndpoint, Incoming, Responder, TransportConfig};
pub use message::{BoundaryRequest, BoundaryResponse, ChannelEvent, ClientMessage, Envelope};
