use std::sync::Arc;

use crate::config::Config;
use crate::session::SessionManager;

/// Shared application state, injected into the signaling transport instead
/// of living in a process-wide singleton.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionManager>) -> Self {
        Self { config, sessions }
    }
}
