//! Session lifecycle: the per-room resource registry, the lifecycle
//! controller and the recording branch coordinator.

pub mod manager;
pub mod recording;
pub mod registry;

pub use manager::{AnalysisStart, RoomPhase, SessionManager};
pub use registry::{Resource, ResourceKind, SessionRegistry};
