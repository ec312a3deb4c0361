//! HTTP server lifecycle.
//!
//! `new()` allocates the shared state, `start()` binds the listener and
//! `serve()` accepts connections until the shutdown future resolves. The
//! binary opens the replica and starts view syncers between `start()` and
//! `serve()`, so the port is taken before the slow part of startup.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::ConnectionRegistry;
use super::handlers::{health_handler, liveness_handler, readiness_handler, ws_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::dispatcher::Dispatcher;

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Shared with background workers and view syncers so they stop together.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - anything else: connect requests, see [`ws_handler`]
    pub fn build_router(&self, dispatcher: Arc<Dispatcher>) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            dispatcher,
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .fallback(ws_handler)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// The address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then closes every connection and
    /// waits for the sessions to drain.
    ///
    /// # Errors
    ///
    /// `start()` was not called, or the server failed with an I/O error.
    pub async fn serve(
        mut self,
        dispatcher: Arc<Dispatcher>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router(dispatcher);
        self.shutdown.set_ready();

        let controller = Arc::clone(&self.shutdown);
        let registry = Arc::clone(&self.registry);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                drain(&registry, &controller);
            })
            .await?;

        if self.shutdown.wait_for_sessions(self.config.drain_timeout).await {
            info!("all sessions closed");
        } else {
            warn!(open = self.shutdown.open_sessions(), "drain timeout expired");
        }
        Ok(())
    }
}

fn drain(registry: &ConnectionRegistry, controller: &ShutdownController) {
    controller.trigger_shutdown();
    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!(connections = handles.len(), "closing connections");
    }
    for handle in &handles {
        handle.close("server shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::test_state;

    #[test]
    fn new_does_not_bind() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(module.listener.is_none());
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
    }

    #[tokio::test]
    async fn start_binds_an_ephemeral_port() {
        let mut module = NetworkModule::new(NetworkConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..NetworkConfig::default()
        });
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_requires_start() {
        let module = NetworkModule::new(NetworkConfig::default());
        let dispatcher = Arc::clone(&test_state().dispatcher);
        assert!(module.serve(dispatcher, async {}).await.is_err());
    }

    #[tokio::test]
    async fn drain_closes_connections() {
        let state = test_state();
        let (handle, mut rx) = state.registry.register(
            &crate::network::ConnectionConfig::default(),
            crate::network::ConnectionMetadata::default(),
        );
        drain(&state.registry, &state.shutdown);
        assert!(state.shutdown.is_shutting_down());
        assert_eq!(state.registry.count(), 0);
        assert!(matches!(
            rx.recv().await,
            Some(crate::network::OutboundMessage::Close(_))
        ));
        drop(handle);
    }
}
