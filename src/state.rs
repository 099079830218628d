//! Shared application state.

use std::sync::Arc;

use crate::config::DaemonConfig;
use crate::scheduler::Scheduler;

/// Shared state passed to all handlers.
pub struct AppState {
    pub config: DaemonConfig,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(config: DaemonConfig, scheduler: Arc<Scheduler>) -> Self {
        Self { config, scheduler }
    }
}
