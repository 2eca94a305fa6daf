//! Live job status subscriptions.
//!
//! [`StatusFanout`] is the [`StatusPublisher`](scribe_events::StatusPublisher)
//! the dispatcher publishes into. Transport adapters (the WebSocket route)
//! register a connection, feed it inbound frames and drain its outbound
//! channel.

pub mod hub;
pub mod protocol;

pub use hub::{Connection, ConnectionId, FanoutConfig, PROTOCOL_VIOLATION, StatusFanout};
pub use protocol::{ClientMessage, INVALID_MESSAGE, ProtocolViolation, ServerMessage, parse_client_frame};
