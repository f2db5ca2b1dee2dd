//! WebSocket signaling surface.

pub mod handler;
