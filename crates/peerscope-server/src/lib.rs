//! Peerscope Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod analysis;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod state;
pub mod ws;

use std::sync::Arc;

use analysis::{AnalyzerFactory, Transcoder};
use config::Config;
use engine::SfuEngine;
use session::SessionManager;
use state::AppState;

/// Wire the application together with the given collaborators. Collaborator
/// injection is what lets the test suite run against mock engines and
/// scripted transcoders.
pub fn create_app(
    config: Config,
    engine: Arc<dyn SfuEngine>,
    transcoder: Arc<dyn Transcoder>,
    analyzers: Arc<dyn AnalyzerFactory>,
) -> (axum::Router, Arc<SessionManager>) {
    let config = Arc::new(config);
    let sessions = SessionManager::new(config.clone(), engine, transcoder, analyzers);
    let router = api::create_router(AppState::new(config, sessions.clone()));
    (router, sessions)
}
