use thiserror::Error;

use crate::engine::EngineError;

/// Failures surfaced to a signaling caller.
///
/// Negotiation and resource-lookup failures leave the room's state unchanged;
/// teardown failures are never represented here (they are logged and
/// swallowed by the lifecycle controller).
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("session not found for room {0}")]
    SessionNotFound(String),

    #[error("no active publisher in room {0}")]
    NoActivePublisher(String),

    #[error("{kind} is not set up for room {room}")]
    ResourceMissing { room: String, kind: &'static str },

    #[error("{kind} already exists for room {room}")]
    AlreadyExists { room: String, kind: &'static str },

    #[error("cannot consume producer {producer_id} with the supplied capabilities")]
    CannotConsume { producer_id: String },

    #[error("analysis branch failed: {0}")]
    Analysis(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalError {
    /// Stable machine-readable code carried on wire errors.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::SessionNotFound(_) => "sessionNotFound",
            SignalError::NoActivePublisher(_) => "noActivePublisher",
            SignalError::ResourceMissing { .. } => "resourceMissing",
            SignalError::AlreadyExists { .. } => "alreadyExists",
            SignalError::CannotConsume { .. } => "cannotConsume",
            SignalError::Analysis(_) => "analysisFailed",
            SignalError::Engine(_) => "engineFailure",
            SignalError::Io(_) => "ioFailure",
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;
