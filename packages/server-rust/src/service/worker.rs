//! Background workers.
//!
//! A `BackgroundWorker<R>` runs a [`BackgroundRunnable`] on its own task: it
//! handles submitted tasks, calls `on_tick` at a fixed interval and calls
//! `shutdown` once when stopped. [`CvrGc`] is the one the server runs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::storage::CvrStore;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The first tick fires one `tick_interval` after start.
    /// Queued tasks run before a stop request is seen.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticks.tick().await;

            loop {
                tokio::select! {
                    biased;
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// # Errors
    ///
    /// The worker has stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for its task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// CVR garbage collection
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CvrGcTask {
    /// Sweep as of the given time, in milliseconds since the epoch.
    SweepAt(u64),
}

/// Deletes client view records idle for longer than the TTL, once per tick.
pub struct CvrGc {
    store: Arc<dyn CvrStore>,
    ttl: Duration,
    removed: u64,
}

impl CvrGc {
    #[must_use]
    pub fn new(store: Arc<dyn CvrStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            removed: 0,
        }
    }

    async fn sweep(&mut self, now_ms: u64) {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        match self.store.gc(now_ms, ttl_ms).await {
            Ok(ids) if ids.is_empty() => debug!("no idle client groups"),
            Ok(ids) => {
                self.removed += ids.len() as u64;
                info!(removed = ids.len(), client_groups = ?ids, "collected idle client view records");
            }
            Err(e) => warn!(error = %e, "client view record gc failed"),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for CvrGc {
    type Task = CvrGcTask;

    async fn run(&mut self, task: CvrGcTask) {
        match task {
            CvrGcTask::SweepAt(now_ms) => self.sweep(now_ms).await,
        }
    }

    async fn on_tick(&mut self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.sweep(now_ms).await;
    }

    async fn shutdown(&mut self) {
        debug!(removed = self.removed, "cvr gc stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cvr::CvrRecord;
    use crate::storage::MemoryCvrStore;

    #[derive(Default, Clone)]
    struct Counts {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Counting(Counts);

    #[async_trait]
    impl BackgroundRunnable for Counting {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_ticks_and_stops_once() {
        let counts = Counts::default();
        let mut worker = BackgroundWorker::start(Counting(counts.clone()), Duration::from_secs(10));
        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        worker.stop().await;

        assert_eq!(counts.runs.load(Ordering::SeqCst), 2);
        assert_eq!(counts.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(counts.shutdowns.load(Ordering::SeqCst), 1);
        assert!(worker.submit(3).await.is_err());
    }

    #[tokio::test]
    async fn gc_removes_idle_records() {
        let store = Arc::new(MemoryCvrStore::new());
        store.flush(&CvrRecord::new("idle", 1_000), None).await.unwrap();
        store.flush(&CvrRecord::new("busy", 95_000), None).await.unwrap();

        let gc = CvrGc::new(Arc::clone(&store) as Arc<dyn CvrStore>, Duration::from_secs(60));
        let mut worker = BackgroundWorker::start(gc, Duration::from_secs(3600));
        worker.submit(CvrGcTask::SweepAt(100_000)).await.unwrap();
        worker.stop().await;

        assert_eq!(store.ids().await.unwrap(), vec!["busy".to_string()]);
    }
}
