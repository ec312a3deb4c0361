//! HTTP and websocket handlers and the state they share.

pub mod health;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use websocket::ws_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::dispatcher::Dispatcher;

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Routes connect requests to tenants and view syncers.
    pub dispatcher: Arc<Dispatcher>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::view_syncer::SyncerPool;

    AppState {
        registry: Arc::new(ConnectionRegistry::new()),
        shutdown: Arc::new(ShutdownController::new()),
        config: Arc::new(NetworkConfig::default()),
        dispatcher: Arc::new(Dispatcher::single(Arc::new(SyncerPool::detached(1)))),
        start_time: Instant::now(),
    }
}
