//! # querybridge - Streaming query sessions across a process boundary
//!
//! querybridge connects a UI process to a query engine that runs behind an
//! isolation boundary. The UI parses query text into a [`QueryId`], starts a
//! fetch, and receives zero or more JSON payloads followed by exactly one
//! completion. Live subscriptions stay open until the engine ends them.
//!
//! ## Core Concepts
//!
//! - **ServiceGate**: two-state lifecycle (`Stopped` / `Started`) forwarding to the engine
//! - **SessionRouter**: the active subscriber set, routing events by query id
//! - **QueryBridge**: the caller-side facade owning the gate, router and event pump
//! - **EngineHost**: the engine-side worker serving requests against a [`QueryEngine`]
//!
//! Only serialized frames cross the boundary; the two sides share no state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use querybridge::{in_process, BridgeConfig, FetchRequest, InMemoryEngine, Resolved};
//!
//! let engine = Arc::new(InMemoryEngine::new());
//! engine.define("query Hello { hello }", vec![Resolved::Data(serde_json::json!({"hello": "world"}))])?;
//!
//! let (bridge, _host) = in_process(engine, BridgeConfig::default())?;
//! bridge.start_service()?;
//!
//! let Some(id) = bridge.parse_query("query Hello { hello }")? else {
//!     return Ok(());
//! };
//! for payload in bridge.fetch_stream(FetchRequest::new(id).operation_name("Hello"))? {
//!     println!("{payload}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod query;

// Session management
pub mod bridge;
pub mod gate;
pub mod router;
pub mod stream;

// Engine side and boundary
pub mod engine;
pub mod host;
pub mod transport;

pub mod logging;

// Re-export primary types at crate root for convenience
pub use bridge::{in_process, QueryBridge};
pub use config::BridgeConfig;
pub use engine::{InMemoryEngine, OperationKind, QueryEngine, Resolved, StreamSink};
pub use error::{BridgeError, BridgeResult, ExecutionError, TransportError, ValidationError};
pub use gate::{ServiceControl, ServiceGate, ServiceState};
pub use host::EngineHost;
pub use query::{FetchRequest, QueryId};
pub use router::{ActiveEntry, CompletionCallback, DataCallback, SessionRouter};
pub use stream::QueryStream;
pub use transport::{ChannelEvent, TransportConfig};
