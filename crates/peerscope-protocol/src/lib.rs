//! Shared protocol definitions for the Peerscope signaling channel.
//!
//! Both the server and any client speak JSON over a WebSocket using the
//! request/reply pairs defined here, plus the server-pushed analysis event
//! stream.

pub mod messages;
pub mod types;

pub use messages::{AnalysisEvent, ClientRequest, ServerMessage, SignalRequest};
pub use types::{ConsumerParams, MediaKind, TransportParams};
