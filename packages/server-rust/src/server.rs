//! Wiring of one replication stack (replica, CVR store, change streamer,
//! replicator, view syncers, CVR GC) and of the whole process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::network::NetworkModule;
use crate::replication::{
    pump, ChangeStreamer, JsonLinesSource, MemoryUpstream, MutationSink, Publications,
    ReadOnlyUpstream, Replicator,
};
use crate::service::{BackgroundWorker, CvrGc, ServerConfig};
use crate::storage::{CvrStore, MemoryCvrStore, MemoryReplica, ReplicaStore};
use crate::view_syncer::{SyncerConfig, SyncerDeps, SyncerPool};

/// Settings of one stack. The process runs one per tenant.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub name: String,
    pub replica_file: Option<PathBuf>,
    pub cvr_file: Option<PathBuf>,
    pub upstream_file: Option<PathBuf>,
    pub publications: Vec<String>,
    pub backlog: usize,
    pub num_syncers: usize,
    pub syncer: SyncerConfig,
    pub cvr_ttl: Duration,
    pub cvr_gc_interval: Duration,
}

impl StackConfig {
    /// Ephemeral stack fed by its own in-memory upstream.
    #[must_use]
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica_file: None,
            cvr_file: None,
            upstream_file: None,
            publications: Vec::new(),
            backlog: 1024,
            num_syncers: 1,
            syncer: SyncerConfig::default(),
            cvr_ttl: Duration::from_secs(3600),
            cvr_gc_interval: Duration::from_secs(300),
        }
    }
}

#[cfg(feature = "redb")]
fn open_file_stores(
    replica: Option<&Path>,
    cvr: Option<&Path>,
) -> anyhow::Result<(Option<Arc<dyn ReplicaStore>>, Option<Arc<dyn CvrStore>>)> {
    use crate::storage::RedbStore;

    // One database file can hold both; redb refuses a second open.
    if let (Some(r), Some(c)) = (replica, cvr) {
        if r == c {
            let store = Arc::new(RedbStore::persistent(r)?);
            return Ok((
                Some(Arc::clone(&store) as Arc<dyn ReplicaStore>),
                Some(store as Arc<dyn CvrStore>),
            ));
        }
    }
    let replica = replica
        .map(|p| RedbStore::persistent(p).map(|s| Arc::new(s) as Arc<dyn ReplicaStore>))
        .transpose()?;
    let cvr = cvr
        .map(|p| RedbStore::persistent(p).map(|s| Arc::new(s) as Arc<dyn CvrStore>))
        .transpose()?;
    Ok((replica, cvr))
}

#[cfg(not(feature = "redb"))]
fn open_file_stores(
    replica: Option<&Path>,
    cvr: Option<&Path>,
) -> anyhow::Result<(Option<Arc<dyn ReplicaStore>>, Option<Arc<dyn CvrStore>>)> {
    if replica.is_some() || cvr.is_some() {
        anyhow::bail!("durable stores need the `redb` feature");
    }
    Ok((None, None))
}

/// A running stack.
pub struct Stack {
    pub name: String,
    pub pool: Arc<SyncerPool>,
    pub replicator: Arc<Replicator>,
    pub streamer: Arc<ChangeStreamer>,
    /// Present when pushes feed the replica.
    pub upstream: Option<Arc<MemoryUpstream>>,
    pub cvr_store: Arc<dyn CvrStore>,
    gc: BackgroundWorker<CvrGc>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stack {
    /// Opens the stores, then starts replication, the view syncers and GC.
    ///
    /// # Errors
    ///
    /// A store or the upstream feed cannot be opened.
    pub async fn start(config: &StackConfig, shutdown: &watch::Receiver<bool>) -> anyhow::Result<Self> {
        let name = config.name.clone();
        let (replica, cvr_store) =
            open_file_stores(config.replica_file.as_deref(), config.cvr_file.as_deref())
                .with_context(|| format!("stack {name}: failed to open stores"))?;
        let replica = replica.unwrap_or_else(|| Arc::new(MemoryReplica::new()));
        let cvr_store = cvr_store.unwrap_or_else(|| Arc::new(MemoryCvrStore::new()));

        let replicator = Arc::new(Replicator::open(Arc::clone(&replica), config.backlog).await?);
        let streamer = Arc::new(ChangeStreamer::new(
            Publications::new(config.publications.clone()),
            config.backlog,
        ));
        let mut tasks = Vec::new();

        let (upstream, mutations): (Option<Arc<MemoryUpstream>>, Arc<dyn MutationSink>) =
            match &config.upstream_file {
                Some(path) => {
                    let mut source = JsonLinesSource::open(path).await?;
                    let streamer = Arc::clone(&streamer);
                    let shutdown = shutdown.clone();
                    let feed = name.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(e) = pump(&mut source, &streamer, shutdown).await {
                            error!(stack = %feed, error = %e, "upstream feed failed");
                        }
                    }));
                    (None, Arc::new(ReadOnlyUpstream))
                }
                None => {
                    let snapshot = replica.snapshot().await?;
                    let upstream = Arc::new(MemoryUpstream::seeded(Arc::clone(&streamer), &snapshot)?);
                    (Some(Arc::clone(&upstream)), upstream)
                }
            };

        {
            let replicator = Arc::clone(&replicator);
            let streamer = Arc::clone(&streamer);
            let shutdown = shutdown.clone();
            let stack = name.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = replicator.run(&streamer, shutdown).await {
                    error!(stack = %stack, error = %e, "replicator stopped");
                }
            }));
        }

        let deps = SyncerDeps {
            replicator: Arc::clone(&replicator),
            cvr_store: Arc::clone(&cvr_store),
            mutations,
            config: config.syncer.clone(),
        };
        let pool = Arc::new(SyncerPool::start(config.num_syncers, &deps, shutdown));
        let gc = BackgroundWorker::start(
            CvrGc::new(Arc::clone(&cvr_store), config.cvr_ttl),
            config.cvr_gc_interval,
        );
        info!(
            stack = %name,
            syncers = pool.len(),
            durable_replica = config.replica_file.is_some(),
            durable_cvrs = config.cvr_file.is_some(),
            upstream = ?config.upstream_file,
            "stack started"
        );

        Ok(Self {
            name,
            pool,
            replicator,
            streamer,
            upstream,
            cvr_store,
            gc,
            tasks,
        })
    }

    /// Waits for the stack to wind down after the shutdown signal.
    pub async fn stop(mut self) {
        self.gc.stop().await;
        self.pool.join().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(stack = %self.name, "stack stopped");
    }
}

/// Stack settings for the process, one per tenant or a single default one.
#[must_use]
pub fn stack_configs(config: &ServerConfig) -> Vec<(Option<String>, StackConfig)> {
    let base = StackConfig {
        name: "default".into(),
        replica_file: config.replica_file.clone(),
        cvr_file: config.cvr_file.clone(),
        upstream_file: config.upstream_file.clone(),
        publications: config.shard_publications.clone(),
        backlog: config.backlog,
        num_syncers: config.num_syncers,
        syncer: config.syncer(),
        cvr_ttl: config.cvr_ttl(),
        cvr_gc_interval: config.cvr_gc_interval(),
    };
    if config.tenants.0.is_empty() {
        return vec![(None, base)];
    }
    config
        .tenants
        .0
        .iter()
        .map(|tenant| {
            let stack = StackConfig {
                name: tenant.id.clone(),
                replica_file: tenant.replica_file.clone(),
                cvr_file: tenant.cvr_file.clone(),
                upstream_file: tenant.upstream_file.clone(),
                ..base.clone()
            };
            (Some(tenant.path.clone()), stack)
        })
        .collect()
}

/// Runs the server until `shutdown` resolves.
///
/// # Errors
///
/// Invalid configuration, stores that cannot be opened, or a listener that
/// cannot bind.
pub async fn run(
    config: ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    config.validate()?;
    crate::metrics::describe();

    let mut network = NetworkModule::new(config.network());
    let port = network.start().await?;
    let controller = network.shutdown_controller();
    let signal = controller.shutdown_receiver();

    let mut stacks = Vec::new();
    let mut dispatcher = Dispatcher::new();
    for (path, stack_config) in stack_configs(&config) {
        let stack = Stack::start(&stack_config, &signal).await?;
        dispatcher = match path {
            None => Dispatcher::single(Arc::clone(&stack.pool)),
            Some(path) => {
                dispatcher.add_tenant(stack.name.clone(), path, Arc::clone(&stack.pool))?;
                dispatcher
            }
        };
        stacks.push(stack);
    }

    info!(port, shard = %config.shard_id, tenants = stacks.len(), "serving");
    network.serve(Arc::new(dispatcher), shutdown).await?;

    for stack in stacks {
        stack.stop().await;
    }
    info!("server stopped");
    Ok(())
}
