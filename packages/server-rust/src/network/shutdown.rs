//! Process lifecycle: health state, the shutdown signal, and open sync
//! sessions.
//!
//! Every websocket session holds a [`SessionGuard`]. On shutdown the
//! controller moves to `Draining`, signals every background task, and
//! [`ShutdownController::wait_for_sessions`] waits for the sessions to close
//! after their sockets were told to go away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Replica and view syncers are still loading.
    Starting,
    Ready,
    /// No new sessions; existing ones are closing.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    sessions: Arc<AtomicU64>,
    health: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            sessions: Arc::new(AtomicU64::new(0)),
            health: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Flips to `true` once shutdown starts. Background loops select on it.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.health.store(Arc::new(HealthState::Draining));
        // Stored even when no receiver is subscribed yet.
        self.signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    /// Shared view of the health state for handlers.
    #[must_use]
    pub fn health_state_handle(&self) -> Arc<ArcSwap<HealthState>> {
        Arc::clone(&self.health)
    }

    /// Counts one open session until the guard drops.
    #[must_use]
    pub fn session_guard(&self) -> SessionGuard {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            sessions: Arc::clone(&self.sessions),
        }
    }

    #[must_use]
    pub fn open_sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for every session to close. Moves to `Stopped`
    /// and returns `true` if they did.
    pub async fn wait_for_sessions(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.open_sessions() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.health.store(Arc::new(HealthState::Stopped));
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// One open sync session. Dropping it, including while unwinding, releases
/// the count.
#[derive(Debug)]
pub struct SessionGuard {
    sessions: Arc<AtomicU64>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);
        assert!(!controller.is_shutting_down());
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn shutdown_is_recorded_without_receivers() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        assert!(controller.is_shutting_down());
        // Late subscribers start out shut down.
        assert!(*controller.shutdown_receiver().borrow());
    }

    #[test]
    fn session_guards_count_open_sessions() {
        let controller = ShutdownController::new();
        let a = controller.session_guard();
        let b = controller.session_guard();
        assert_eq!(controller.open_sessions(), 2);
        drop(a);
        assert_eq!(controller.open_sessions(), 1);
        drop(b);
        assert_eq!(controller.open_sessions(), 0);
    }

    #[tokio::test]
    async fn receivers_see_the_signal() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());
        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drains_once_sessions_close() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let guard = controller.session_guard();
        controller.trigger_shutdown();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(controller.wait_for_sessions(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_a_stuck_session() {
        let controller = ShutdownController::new();
        let _guard = controller.session_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_sessions(Duration::from_millis(30)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
