//! View syncer: one shard's client groups, their records and their pokes.
//!
//! Each syncer is a tokio task that owns a [`PipelineDriver`] and every
//! client group routed to its shard. Commands from sessions and updates from
//! the replicator are handled one at a time, so a group's record, its
//! pipelines and its pokes never race.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use viewsync_core::data::Row;
use viewsync_core::hash::route;
use viewsync_core::messages::{
    ConnectedBody, Downstream, Mutation, PokeBody, PullBody, PullResponseBody, PushBody,
    QueryPatchOp, RowPatchOp, Upstream,
};
use viewsync_core::version::version_to_lexi;
use viewsync_core::{Ast, CvrVersion, IvmError};

use super::pipeline::PipelineDriver;
use crate::cvr::{
    catchup, full_resync, prune_history, ConfigUpdater, CvrRecord, QueryChanges, QueryUpdater,
    RowDelta, RowRef,
};
use crate::dispatcher::ConnectParams;
use crate::error::SyncError;
use crate::metrics::{ACTIVE_CLIENT_GROUPS, FULL_RESYNCS_TOTAL, OPERATOR_ERRORS_TOTAL, POKES_TOTAL};
use crate::network::{ConnectionHandle, ConnectionId, SendError};
use crate::replication::{MutationSink, ReplicaUpdate, Replicator};
use crate::storage::{is_conflict, CvrStore};

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Row tombstones kept per client group before history is pruned.
    pub max_row_history: usize,
    pub min_schema_version: u32,
    pub max_schema_version: u32,
    /// Capacity of each syncer's command queue.
    pub command_capacity: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            max_row_history: 1000,
            min_schema_version: 1,
            max_schema_version: 1,
            command_capacity: 1024,
        }
    }
}

/// Everything a syncer needs from the rest of the process.
#[derive(Clone)]
pub struct SyncerDeps {
    pub replicator: Arc<Replicator>,
    pub cvr_store: Arc<dyn CvrStore>,
    pub mutations: Arc<dyn MutationSink>,
    pub config: SyncerConfig,
}

pub enum SyncerCommand {
    Connect {
        params: ConnectParams,
        conn: Arc<ConnectionHandle>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Message {
        client_group_id: String,
        client_id: String,
        conn: ConnectionId,
        message: Upstream,
    },
    Disconnect {
        client_group_id: String,
        client_id: String,
        conn: ConnectionId,
    },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Poke ids only have to differ between the pokes one client sees. The
/// start time keeps them apart across restarts.
fn next_poke_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{seq:x}", now_ms())
}

fn retag(rows: &[RowDelta], query_hash: &str) -> Vec<RowDelta> {
    rows.iter()
        .map(|row| RowDelta {
            query_hash: query_hash.to_string(),
            ..row.clone()
        })
        .collect()
}

/// `clientID -> lastMutationID` for the `_clients` rows of one group.
fn client_lmids(rows: &[Row], client_group_id: &str) -> BTreeMap<String, u64> {
    rows.iter()
        .filter(|row| row.get("clientGroupID").and_then(|v| v.as_str()) == Some(client_group_id))
        .filter_map(|row| {
            let client = row.get("clientID")?.as_str()?.to_string();
            let last = u64::try_from(row.get("lastMutationID")?.as_i64()?).ok()?;
            Some((client, last))
        })
        .collect()
}

struct ClientGroup {
    record: CvrRecord,
    /// Version of the record as last flushed, `None` if never stored.
    stored: Option<CvrVersion>,
    clients: BTreeMap<String, Arc<ConnectionHandle>>,
    /// Query hash to the transformation hash of the pipeline it holds a
    /// reference on.
    held: BTreeMap<String, String>,
    /// Highest mutation id forwarded upstream per client, ahead of `_clients`.
    pending_lmids: BTreeMap<String, u64>,
    /// Counted in the active client groups gauge.
    counted: bool,
}

impl ClientGroup {
    fn client(&self, client_id: &str, conn: ConnectionId) -> Option<&Arc<ConnectionHandle>> {
        self.clients.get(client_id).filter(|c| c.id == conn)
    }

    /// Sends a poke moving every client from `base` to the record's version.
    /// Clients that cannot take it are disconnected.
    fn poke(
        &mut self,
        base: &CvrVersion,
        desired_queries_patches: BTreeMap<String, Vec<QueryPatchOp>>,
        changes: QueryChanges,
        last_mutation_id_changes: BTreeMap<String, u64>,
    ) {
        let body = PokeBody {
            poke_id: next_poke_id(),
            base_cookie: Some(base.cookie()),
            cookie: self.record.version.cookie(),
            desired_queries_patches,
            got_queries_patch: changes.got_patch,
            rows_patch: changes.rows_patch,
            last_mutation_id_changes,
        };
        if body.is_empty() && *base == self.record.version {
            return;
        }
        self.broadcast(&Downstream::Poke(body));
    }

    fn broadcast(&mut self, message: &Downstream) {
        let mut slow = Vec::new();
        for (client_id, conn) in &self.clients {
            if let Err(e) = conn.send(message.clone()) {
                warn!(client_group = %self.record.id, client = %client_id, error = ?e, "dropping client");
                conn.close("client is not keeping up");
                slow.push(client_id.clone());
            } else if matches!(message, Downstream::Poke(_)) {
                metrics::counter!(POKES_TOTAL).increment(1);
            }
        }
        for client_id in slow {
            self.clients.remove(&client_id);
        }
    }
}

pub struct ViewSyncer {
    shard: usize,
    deps: SyncerDeps,
    driver: PipelineDriver,
    groups: BTreeMap<String, ClientGroup>,
}

impl ViewSyncer {
    #[must_use]
    pub fn new(shard: usize, deps: SyncerDeps) -> Self {
        Self {
            shard,
            deps,
            driver: PipelineDriver::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SyncerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut updates = self.deps.replicator.subscribe();
        self.resync().await;
        info!(shard = self.shard, version = ?self.driver.version(), "view syncer started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                update = updates.recv() => match update {
                    Ok(update) => self.advance(&update).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(shard = self.shard, skipped, "replica updates lagged, resyncing");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        self.close_all().await;
        info!(shard = self.shard, "view syncer stopped");
    }

    async fn handle(&mut self, command: SyncerCommand) {
        match command {
            SyncerCommand::Connect {
                params,
                conn,
                reply,
            } => {
                let group_id = params.client_group_id.clone();
                let result = self.connect(params, Arc::clone(&conn)).await;
                if let Err(e) = &result {
                    debug!(client_group = %group_id, error = %e, "connect rejected");
                    let _ = conn.send(Downstream::error(e.kind(), e.to_string()));
                    conn.close("connect rejected");
                    self.release_if_idle(&group_id).await;
                }
                let _ = reply.send(result);
            }
            SyncerCommand::Message {
                client_group_id,
                client_id,
                conn,
                message,
            } => {
                let Some(handle) = self
                    .groups
                    .get(&client_group_id)
                    .and_then(|g| g.client(&client_id, conn))
                    .cloned()
                else {
                    debug!(client_group = %client_group_id, client = %client_id, "message from a replaced connection");
                    return;
                };
                let kind = message.kind();
                if let Err(e) = self
                    .on_message(&client_group_id, &client_id, &handle, message)
                    .await
                {
                    warn!(client_group = %client_group_id, client = %client_id, message = kind, error = %e, "message rejected");
                    let _ = handle.send(Downstream::error(e.kind(), e.to_string()));
                    handle.close("message rejected");
                    if let Some(group) = self.groups.get_mut(&client_group_id) {
                        group.clients.remove(&client_id);
                    }
                    self.release_if_idle(&client_group_id).await;
                }
            }
            SyncerCommand::Disconnect {
                client_group_id,
                client_id,
                conn,
            } => {
                if let Some(group) = self.groups.get_mut(&client_group_id) {
                    if group.client(&client_id, conn).is_some() {
                        group.clients.remove(&client_id);
                        group.record.last_active = now_ms();
                        debug!(client_group = %client_group_id, client = %client_id, "client disconnected");
                    }
                }
                self.release_if_idle(&client_group_id).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client groups
    // -----------------------------------------------------------------------

    /// Loads `client_group_id` and registers its desired queries with the
    /// driver, unless it is already active.
    async fn activate(&mut self, client_group_id: &str, has_cookie: bool) -> Result<(), SyncError> {
        if self.groups.contains_key(client_group_id) {
            return Ok(());
        }
        let loaded = self.deps.cvr_store.load(client_group_id).await?;
        if loaded.is_none() && has_cookie {
            return Err(SyncError::ClientNotFound(client_group_id.to_string()));
        }
        let stored = loaded.as_ref().map(|r| r.version.clone());
        let mut record = loaded.unwrap_or_else(|| CvrRecord::new(client_group_id, now_ms()));

        let desired: Vec<(String, Ast)> = record
            .queries
            .iter()
            .filter(|(_, q)| !q.desired_by.is_empty())
            .map(|(hash, q)| (hash.clone(), q.ast.clone()))
            .collect();
        let mut hydrated = Vec::new();
        for (hash, ast) in desired {
            match self.driver.add_query(&ast) {
                Ok((transformation, rows)) => hydrated.push((hash, transformation, rows)),
                Err(e) => {
                    for (_, transformation, _) in &hydrated {
                        self.driver.remove_query(transformation);
                    }
                    return Err(e.into());
                }
            }
        }

        let replica_version = self.replica_version();
        let version = record.next_version_for(&replica_version);
        let mut held = BTreeMap::new();
        {
            let mut updater = QueryUpdater::new(&mut record, version);
            for (hash, transformation, rows) in hydrated {
                updater.track_executed(&hash, &transformation);
                updater.replace_query_rows(&hash, retag(&rows, &hash));
                held.insert(hash, transformation);
            }
            let _ = updater.flush();
        }
        record.replica_version = Some(replica_version);
        debug!(client_group = %client_group_id, queries = held.len(), "client group activated");

        self.groups.insert(
            client_group_id.to_string(),
            ClientGroup {
                record,
                stored,
                clients: BTreeMap::new(),
                held,
                pending_lmids: BTreeMap::new(),
                counted: false,
            },
        );
        Ok(())
    }

    fn replica_version(&self) -> String {
        self.driver
            .version()
            .map_or_else(|| version_to_lexi(0), ToString::to_string)
    }

    fn known_lmid(&self, client_group_id: &str, client_id: &str) -> u64 {
        let replicated = self
            .driver
            .last_mutation_ids(client_group_id)
            .get(client_id)
            .copied()
            .unwrap_or(0);
        let pending = self
            .groups
            .get(client_group_id)
            .and_then(|g| g.pending_lmids.get(client_id).copied())
            .unwrap_or(0);
        replicated.max(pending)
    }

    async fn connect(
        &mut self,
        params: ConnectParams,
        conn: Arc<ConnectionHandle>,
    ) -> Result<(), SyncError> {
        let config = &self.deps.config;
        if let Some(requested) = params.schema_version {
            if !(config.min_schema_version..=config.max_schema_version).contains(&requested) {
                return Err(SyncError::SchemaVersionNotSupported {
                    requested,
                    min: config.min_schema_version,
                    max: config.max_schema_version,
                });
            }
        }
        let base = params
            .base_cookie
            .as_deref()
            .map(CvrVersion::from_cookie)
            .transpose()?;
        let group_id = params.client_group_id.as_str();
        self.activate(group_id, base.is_some()).await?;

        let known = self.known_lmid(group_id, &params.client_id);
        if params.lmid > known {
            return Err(SyncError::InvalidConnectionRequest(format!(
                "client {} reports mutation {} but the server has only seen {known}",
                params.client_id, params.lmid
            )));
        }
        let lmids = self.driver.last_mutation_ids(group_id);

        let Some(group) = self.groups.get_mut(group_id) else {
            return Err(SyncError::ClientNotFound(group_id.to_string()));
        };
        {
            let mut updater = ConfigUpdater::new(&mut group.record);
            updater.ensure_client(&params.client_id);
            let _ = updater.flush();
        }
        group.record.last_active = now_ms();

        let catchup = match catchup(&group.record, base.as_ref()) {
            Ok(catchup) => catchup,
            Err(SyncError::ReplicationGap { base, floor }) => {
                info!(client_group = %group_id, %base, %floor, "cookie predates history, full resync");
                metrics::counter!(FULL_RESYNCS_TOTAL).increment(1);
                full_resync(&group.record, true)
            }
            Err(e) => return Err(e),
        };

        let mut rows_patch = Vec::with_capacity(catchup.rows.len() + 1);
        if catchup.clear {
            rows_patch.push(RowPatchOp::Clear);
        }
        for row in catchup.rows {
            rows_patch.push(match row {
                RowRef::Put { table, id } => match self.driver.get_row(&table, &id) {
                    Some(value) => RowPatchOp::Put {
                        table_name: table,
                        value,
                    },
                    None => RowPatchOp::Del {
                        table_name: table,
                        id,
                    },
                },
                RowRef::Del { table, id } => RowPatchOp::Del {
                    table_name: table,
                    id,
                },
            });
        }
        let poke = PokeBody {
            poke_id: next_poke_id(),
            base_cookie: params.base_cookie.clone(),
            cookie: catchup.version.cookie(),
            desired_queries_patches: catchup.desired_patches,
            got_queries_patch: catchup.got_patch,
            rows_patch,
            last_mutation_id_changes: lmids,
        };

        let send_failed = |e: SendError| SyncError::Internal(anyhow!("client went away during connect: {e:?}"));
        conn.send(Downstream::Connected(ConnectedBody {
            wsid: params.wsid.clone(),
            timestamp: now_ms(),
        }))
        .map_err(send_failed)?;
        if !poke.is_empty() || params.base_cookie.as_deref() != Some(poke.cookie.as_str()) {
            conn.send(Downstream::Poke(poke)).map_err(send_failed)?;
            metrics::counter!(POKES_TOTAL).increment(1);
        }

        if !group.counted {
            group.counted = true;
            metrics::gauge!(ACTIVE_CLIENT_GROUPS).increment(1.0);
        }
        if let Some(previous) = group.clients.insert(params.client_id.clone(), conn) {
            previous.close("replaced by a newer connection");
        }
        info!(
            shard = self.shard,
            client_group = %group_id,
            client = %params.client_id,
            cookie = %group.record.version,
            "client connected"
        );
        self.flush(group_id).await;
        Ok(())
    }

    /// Drops an in-memory group without clients: its pipeline references are
    /// released and its record is flushed.
    async fn release_if_idle(&mut self, client_group_id: &str) {
        let idle = self
            .groups
            .get(client_group_id)
            .is_some_and(|g| g.clients.is_empty());
        if !idle {
            return;
        }
        self.flush(client_group_id).await;
        if let Some(group) = self.groups.remove(client_group_id) {
            for transformation in group.held.values() {
                self.driver.remove_query(transformation);
            }
            if group.counted {
                metrics::gauge!(ACTIVE_CLIENT_GROUPS).decrement(1.0);
            }
            debug!(client_group = %client_group_id, "client group released");
        }
    }

    /// Ends a group after an unrecoverable error: every client gets the error
    /// and is disconnected.
    fn fail_group(&mut self, client_group_id: &str, error: &SyncError) {
        let Some(group) = self.groups.remove(client_group_id) else {
            return;
        };
        error!(client_group = %client_group_id, error = %error, "client group failed");
        for conn in group.clients.values() {
            let _ = conn.send(Downstream::error(error.kind(), error.to_string()));
            conn.close("client group failed");
        }
        for transformation in group.held.values() {
            self.driver.remove_query(transformation);
        }
        if group.counted {
            metrics::gauge!(ACTIVE_CLIENT_GROUPS).decrement(1.0);
        }
    }

    async fn flush(&mut self, client_group_id: &str) {
        let Some(group) = self.groups.get_mut(client_group_id) else {
            return;
        };
        match self
            .deps
            .cvr_store
            .flush(&group.record, group.stored.as_ref())
            .await
        {
            Ok(()) => group.stored = Some(group.record.version.clone()),
            Err(e) if is_conflict(&e) => {
                self.fail_group(client_group_id, &SyncError::Internal(e));
            }
            Err(e) => {
                error!(client_group = %client_group_id, error = %e, "failed to flush client view record");
            }
        }
    }

    async fn close_all(&mut self) {
        let ids: Vec<String> = self.groups.keys().cloned().collect();
        for id in ids {
            self.flush(&id).await;
            if let Some(group) = self.groups.get(&id) {
                for conn in group.clients.values() {
                    conn.close("server shutting down");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    async fn on_message(
        &mut self,
        client_group_id: &str,
        client_id: &str,
        conn: &Arc<ConnectionHandle>,
        message: Upstream,
    ) -> Result<(), SyncError> {
        if let Some(group) = self.groups.get_mut(client_group_id) {
            group.record.last_active = now_ms();
        }
        match message {
            Upstream::InitConnection(body) => {
                self.change_desired_queries(client_group_id, client_id, body.desired_queries_patch)
                    .await
            }
            Upstream::ChangeDesiredQueries(body) => {
                self.change_desired_queries(client_group_id, client_id, body.desired_queries_patch)
                    .await
            }
            Upstream::Push(body) => self.push(client_group_id, body).await,
            Upstream::Pull(body) => self.pull(client_group_id, conn, body),
            Upstream::Ping => conn
                .send(Downstream::Pong)
                .map_err(|e| SyncError::Internal(anyhow!("pong not delivered: {e:?}"))),
        }
    }

    async fn change_desired_queries(
        &mut self,
        client_group_id: &str,
        client_id: &str,
        patch: Vec<QueryPatchOp>,
    ) -> Result<(), SyncError> {
        let Some(group) = self.groups.get_mut(client_group_id) else {
            return Err(SyncError::ClientNotFound(client_group_id.to_string()));
        };
        let before = group.record.clone();

        // A put without an AST re-desires a query the group already knows.
        let mut ops = Vec::with_capacity(patch.len());
        for op in patch {
            ops.push(match op {
                QueryPatchOp::Put { hash, ast: None } => {
                    let ast = before.queries.get(&hash).map(|q| q.ast.clone()).ok_or_else(|| {
                        IvmError::InvalidQuery(format!("query {hash} has no AST"))
                    })?;
                    QueryPatchOp::put(hash, ast)
                }
                op => op,
            });
        }

        let changes = {
            let mut updater = ConfigUpdater::new(&mut group.record);
            for op in ops {
                match op {
                    QueryPatchOp::Put {
                        hash,
                        ast: Some(ast),
                    } => updater.put_desired_queries(client_id, vec![(hash, ast)]),
                    QueryPatchOp::Put { .. } => {}
                    QueryPatchOp::Del { hash } => updater.delete_desired_queries(client_id, &[hash]),
                    QueryPatchOp::Clear => updater.clear_desired_queries(client_id),
                }
            }
            updater.flush()
        };
        let Some(version) = changes.version else {
            return Ok(());
        };

        let mut added = Vec::with_capacity(changes.added.len());
        for (hash, ast) in &changes.added {
            match self.driver.add_query(ast) {
                Ok((transformation, rows)) => added.push((hash.clone(), transformation, rows)),
                Err(e) => {
                    for (_, transformation, _) in &added {
                        self.driver.remove_query(transformation);
                    }
                    group.record = before;
                    return Err(e.into());
                }
            }
        }
        for hash in &changes.removed {
            if let Some(transformation) = group.held.remove(hash) {
                self.driver.remove_query(&transformation);
            }
        }

        let query_changes = {
            let mut updater = QueryUpdater::new(&mut group.record, version);
            for (hash, transformation, rows) in added {
                updater.track_executed(&hash, &transformation);
                updater.replace_query_rows(&hash, retag(&rows, &hash));
                group.held.insert(hash, transformation);
            }
            for hash in &changes.removed {
                updater.remove_query(hash);
            }
            updater.flush()
        };
        prune_history(&mut group.record, self.deps.config.max_row_history);
        debug!(
            client_group = %client_group_id,
            client = %client_id,
            cookie = %group.record.version,
            rows = query_changes.rows_patch.len(),
            "desired queries changed"
        );
        group.poke(
            &before.version,
            changes.desired_patches,
            query_changes,
            BTreeMap::new(),
        );
        self.flush(client_group_id).await;
        Ok(())
    }

    async fn push(&mut self, client_group_id: &str, body: PushBody) -> Result<(), SyncError> {
        if body.client_group_id != client_group_id {
            return Err(SyncError::InvalidPush(format!(
                "push for client group {} on a connection of {client_group_id}",
                body.client_group_id
            )));
        }
        let mut next: BTreeMap<String, u64> = BTreeMap::new();
        let mut accepted: Vec<Mutation> = Vec::new();
        for mutation in body.mutations {
            let last = match next.get(&mutation.client_id) {
                Some(last) => *last,
                None => self.known_lmid(client_group_id, &mutation.client_id),
            };
            if mutation.id <= last {
                debug!(client = %mutation.client_id, id = mutation.id, "skipping applied mutation");
                continue;
            }
            if mutation.id != last + 1 {
                return Err(SyncError::InvalidPush(format!(
                    "mutation {} from client {} does not follow {last}",
                    mutation.id, mutation.client_id
                )));
            }
            if mutation.crud_args().is_none() {
                return Err(SyncError::InvalidPush(format!(
                    "unsupported mutation {}",
                    mutation.name
                )));
            }
            next.insert(mutation.client_id.clone(), mutation.id);
            accepted.push(mutation);
        }
        if accepted.is_empty() {
            return Ok(());
        }
        self.deps
            .mutations
            .apply(client_group_id, &accepted)
            .await
            .map_err(SyncError::Internal)?;
        if let Some(group) = self.groups.get_mut(client_group_id) {
            group.pending_lmids.extend(next);
        }
        Ok(())
    }

    fn pull(
        &self,
        client_group_id: &str,
        conn: &Arc<ConnectionHandle>,
        body: PullBody,
    ) -> Result<(), SyncError> {
        if body.client_group_id != client_group_id {
            return Err(SyncError::InvalidConnectionRequest(format!(
                "pull for client group {} on a connection of {client_group_id}",
                body.client_group_id
            )));
        }
        let Some(group) = self.groups.get(client_group_id) else {
            return Err(SyncError::ClientNotFound(client_group_id.to_string()));
        };
        conn.send(Downstream::PullResponse(PullResponseBody {
            cookie: group.record.version.cookie(),
            request_id: body.request_id,
            last_mutation_id_changes: self.driver.last_mutation_ids(client_group_id),
        }))
        .map_err(|e| SyncError::Internal(anyhow!("pull response not delivered: {e:?}")))
    }

    // -----------------------------------------------------------------------
    // Replica updates
    // -----------------------------------------------------------------------

    /// Rebuilds the driver from a fresh replica snapshot and brings every
    /// group's rows in line with it.
    async fn resync(&mut self) {
        let snapshot = match self.deps.replicator.replica().snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(shard = self.shard, error = %e, "replica snapshot failed");
                return;
            }
        };
        let results = self.driver.reset(&snapshot);
        let replica_version = self.replica_version();
        let ids: Vec<String> = self.groups.keys().cloned().collect();
        for id in ids {
            self.refresh_group(&id, &replica_version, &BTreeMap::new(), &results, &[])
                .await;
        }
    }

    async fn advance(&mut self, update: &ReplicaUpdate) {
        if self
            .driver
            .version()
            .is_some_and(|current| update.version.as_str() <= current)
        {
            return;
        }
        let advance = match self.driver.advance(update) {
            Ok(advance) => advance,
            Err(e) => {
                warn!(shard = self.shard, version = %update.version, error = %e, "replica update not applicable, resyncing");
                self.resync().await;
                return;
            }
        };

        let mut rehydrated = BTreeMap::new();
        for (transformation, e) in advance.failed {
            metrics::counter!(OPERATOR_ERRORS_TOTAL).increment(1);
            warn!(pipeline = %transformation, error = %e, "operator error, rehydrating");
            let result = self.driver.rehydrate(&transformation);
            rehydrated.insert(transformation, result);
        }

        let ids: Vec<String> = self.groups.keys().cloned().collect();
        for id in ids {
            self.refresh_group(
                &id,
                &update.version,
                &advance.deltas,
                &rehydrated,
                &advance.clients,
            )
            .await;
        }
    }

    /// Applies pipeline output to one group and pokes its clients.
    /// `replaced` holds full row sets of rebuilt pipelines, `deltas` the
    /// incremental output of the others.
    async fn refresh_group(
        &mut self,
        client_group_id: &str,
        replica_version: &str,
        deltas: &BTreeMap<String, Vec<RowDelta>>,
        replaced: &BTreeMap<String, Result<Vec<RowDelta>, IvmError>>,
        clients: &[Row],
    ) {
        let Some(group) = self.groups.get_mut(client_group_id) else {
            return;
        };
        let base = group.record.version.clone();
        let version = group.record.next_version_for(replica_version);
        let mut failure = None;
        let changes = {
            let mut updater = QueryUpdater::new(&mut group.record, version.clone());
            for (hash, transformation) in &group.held {
                match replaced.get(transformation) {
                    Some(Ok(rows)) => updater.replace_query_rows(hash, retag(rows, hash)),
                    Some(Err(e)) => failure = Some(e.clone()),
                    None => {
                        if let Some(rows) = deltas.get(transformation) {
                            updater.received(retag(rows, hash));
                        }
                    }
                }
            }
            updater.flush()
        };
        if let Some(e) = failure {
            self.fail_group(client_group_id, &SyncError::from(e));
            return;
        }

        let lmids = client_lmids(clients, client_group_id);
        if !lmids.is_empty() && group.record.version < version {
            group.record.version = version;
        }
        group.record.replica_version = Some(replica_version.to_string());
        if changes.is_empty() && lmids.is_empty() {
            return;
        }
        prune_history(&mut group.record, self.deps.config.max_row_history);
        group.poke(&base, BTreeMap::new(), changes, lmids);
        self.flush(client_group_id).await;
    }
}

// ---------------------------------------------------------------------------
// Handles and pool
// ---------------------------------------------------------------------------

/// Sends commands to one view syncer.
#[derive(Clone)]
pub struct SyncerHandle {
    shard: usize,
    tx: mpsc::Sender<SyncerCommand>,
}

fn stopped() -> SyncError {
    SyncError::Internal(anyhow!("view syncer is not running"))
}

impl SyncerHandle {
    #[must_use]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Connects a client. On error the client has already been sent the
    /// error and its socket asked to close.
    ///
    /// # Errors
    ///
    /// Whatever rejected the connection.
    pub async fn connect(
        &self,
        params: ConnectParams,
        conn: Arc<ConnectionHandle>,
    ) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncerCommand::Connect {
                params,
                conn,
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// # Errors
    ///
    /// The syncer has stopped.
    pub async fn message(
        &self,
        client_group_id: &str,
        client_id: &str,
        conn: ConnectionId,
        message: Upstream,
    ) -> Result<(), SyncError> {
        self.tx
            .send(SyncerCommand::Message {
                client_group_id: client_group_id.to_string(),
                client_id: client_id.to_string(),
                conn,
                message,
            })
            .await
            .map_err(|_| stopped())
    }

    pub async fn disconnect(&self, client_group_id: &str, client_id: &str, conn: ConnectionId) {
        // A stopped syncer has nothing left to clean up.
        let _ = self
            .tx
            .send(SyncerCommand::Disconnect {
                client_group_id: client_group_id.to_string(),
                client_id: client_id.to_string(),
                conn,
            })
            .await;
    }
}

/// A fixed set of view syncers; client groups are routed by hash.
pub struct SyncerPool {
    syncers: Vec<SyncerHandle>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncerPool {
    /// Spawns `count` syncers (at least one).
    #[must_use]
    pub fn start(count: usize, deps: &SyncerDeps, shutdown: &watch::Receiver<bool>) -> Self {
        let mut syncers = Vec::new();
        let mut tasks = Vec::new();
        for shard in 0..count.max(1) {
            let (tx, rx) = mpsc::channel(deps.config.command_capacity.max(1));
            let syncer = ViewSyncer::new(shard, deps.clone());
            tasks.push(tokio::spawn(syncer.run(rx, shutdown.clone())));
            syncers.push(SyncerHandle { shard, tx });
        }
        Self {
            syncers,
            tasks: parking_lot::Mutex::new(tasks),
        }
    }

    /// Handles whose syncers never run.
    #[cfg(test)]
    pub(crate) fn detached(count: usize) -> Self {
        let syncers = (0..count.max(1))
            .map(|shard| SyncerHandle {
                shard,
                tx: mpsc::channel(1).0,
            })
            .collect();
        Self {
            syncers,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.syncers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.syncers.is_empty()
    }

    /// The syncer that owns `client_group_id`. Stable for a given pool size.
    #[must_use]
    pub fn route(&self, client_group_id: &str) -> &SyncerHandle {
        &self.syncers[route(client_group_id, self.syncers.len())]
    }

    /// Waits for every syncer task to finish.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "view syncer task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use viewsync_core::data::make_row;
    use viewsync_core::messages::ErrorKind;
    use viewsync_core::messages::InitConnectionBody;
    use viewsync_core::version::format_lsn;
    use viewsync_core::Value;

    use super::*;
    use crate::network::{ConnectionConfig, ConnectionMetadata, ConnectionRegistry, OutboundMessage};
    use crate::replication::{ChangeSourceEvent, ChangeStreamer, Publications, Transaction};
    use crate::storage::{MemoryCvrStore, MemoryReplica, ReplicaStore};

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<(String, Vec<u64>)>>,
    }

    #[async_trait]
    impl MutationSink for RecordingSink {
        async fn apply(&self, client_group_id: &str, mutations: &[Mutation]) -> anyhow::Result<()> {
            self.applied.lock().push((
                client_group_id.to_string(),
                mutations.iter().map(|m| m.id).collect(),
            ));
            Ok(())
        }
    }

    struct Harness {
        streamer: ChangeStreamer,
        replicator: Arc<Replicator>,
        sink: Arc<RecordingSink>,
        cvr_store: Arc<MemoryCvrStore>,
        pool: SyncerPool,
        registry: ConnectionRegistry,
        _shutdown: watch::Sender<bool>,
    }

    fn issue(id: i64, title: &str) -> Row {
        make_row([("id", Value::from(id)), ("title", title.into())])
    }

    #[test]
    fn poke_ids_are_distinct() {
        let a = next_poke_id();
        let b = next_poke_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    fn commit(streamer: &ChangeStreamer, lsn: u64, events: Vec<ChangeSourceEvent>) -> Arc<Transaction> {
        let lsn = format_lsn(lsn);
        streamer
            .process(ChangeSourceEvent::Begin { lsn: lsn.clone() })
            .unwrap();
        for event in events {
            streamer.process(event).unwrap();
        }
        streamer
            .process(ChangeSourceEvent::Commit { lsn })
            .unwrap()
            .unwrap()
    }

    fn insert(row: Row) -> ChangeSourceEvent {
        ChangeSourceEvent::Insert {
            table: "issue".into(),
            row,
        }
    }

    async fn harness() -> Harness {
        let replica: Arc<dyn ReplicaStore> = Arc::new(MemoryReplica::new());
        let replicator = Arc::new(Replicator::open(replica, 16).await.unwrap());
        let streamer = ChangeStreamer::new(Publications::default(), 16);
        let txn = commit(&streamer, 1, vec![insert(issue(1, "a")), insert(issue(2, "b"))]);
        replicator.apply(&txn).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let cvr_store = Arc::new(MemoryCvrStore::new());
        let deps = SyncerDeps {
            replicator: Arc::clone(&replicator),
            cvr_store: Arc::clone(&cvr_store) as Arc<dyn CvrStore>,
            mutations: Arc::clone(&sink) as Arc<dyn MutationSink>,
            config: SyncerConfig::default(),
        };
        let (shutdown, rx) = watch::channel(false);
        let pool = SyncerPool::start(1, &deps, &rx);
        Harness {
            streamer,
            replicator,
            sink,
            cvr_store,
            pool,
            registry: ConnectionRegistry::new(),
            _shutdown: shutdown,
        }
    }

    fn params(client: &str, cookie: Option<&str>) -> ConnectParams {
        ConnectParams {
            client_id: client.into(),
            client_group_id: "g1".into(),
            base_cookie: cookie.map(Into::into),
            timestamp: 0,
            lmid: 0,
            wsid: "ws".into(),
            schema_version: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<OutboundMessage>) -> Downstream {
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no message within 2s")
            .expect("channel closed");
        match received {
            OutboundMessage::Message(message) => *message,
            OutboundMessage::Close(reason) => panic!("closed: {reason:?}"),
        }
    }

    async fn next_poke(rx: &mut mpsc::Receiver<OutboundMessage>) -> PokeBody {
        match next(rx).await {
            Downstream::Poke(poke) => poke,
            other => panic!("expected a poke, got {other:?}"),
        }
    }

    impl Harness {
        async fn connect(
            &self,
            params: ConnectParams,
        ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>, Result<(), SyncError>) {
            let (conn, rx) = self
                .registry
                .register(&ConnectionConfig::default(), ConnectionMetadata::default());
            let result = self
                .pool
                .route(&params.client_group_id)
                .connect(params, Arc::clone(&conn))
                .await;
            (conn, rx, result)
        }

        async fn send(&self, client: &str, conn: &ConnectionHandle, message: Upstream) {
            self.pool
                .route("g1")
                .message("g1", client, conn.id, message)
                .await
                .unwrap();
        }
    }

    fn desire_issues() -> Upstream {
        Upstream::InitConnection(InitConnectionBody {
            desired_queries_patch: vec![QueryPatchOp::put("q1", Ast::table("issue"))],
        })
    }

    #[tokio::test]
    async fn connect_then_desire_a_query() {
        let h = harness().await;
        let (conn, mut rx, result) = h.connect(params("c1", None)).await;
        result.unwrap();
        assert!(matches!(next(&mut rx).await, Downstream::Connected(_)));
        let first = next_poke(&mut rx).await;
        assert_eq!(first.base_cookie, None);

        h.send("c1", &conn, desire_issues()).await;
        let poke = next_poke(&mut rx).await;
        assert_eq!(poke.base_cookie.as_deref(), Some(first.cookie.as_str()));
        assert!(poke.cookie > first.cookie);
        assert_eq!(poke.desired_queries_patches["c1"].len(), 1);
        assert_eq!(poke.got_queries_patch.len(), 1);
        let puts = poke
            .rows_patch
            .iter()
            .filter(|op| matches!(op, RowPatchOp::Put { .. }))
            .count();
        assert_eq!(puts, 2);
    }

    #[tokio::test]
    async fn replicated_rows_are_poked() {
        let h = harness().await;
        let (conn, mut rx, result) = h.connect(params("c1", None)).await;
        result.unwrap();
        next(&mut rx).await;
        next_poke(&mut rx).await;
        h.send("c1", &conn, desire_issues()).await;
        let hydrated = next_poke(&mut rx).await;

        let txn = commit(&h.streamer, 2, vec![insert(issue(3, "c"))]);
        h.replicator.apply(&txn).await.unwrap();
        let poke = next_poke(&mut rx).await;
        assert_eq!(poke.base_cookie.as_deref(), Some(hydrated.cookie.as_str()));
        assert_eq!(
            poke.rows_patch,
            vec![RowPatchOp::Put {
                table_name: "issue".into(),
                value: issue(3, "c"),
            }]
        );
    }

    #[tokio::test]
    async fn reconnect_with_cookie_catches_up() {
        let h = harness().await;
        let (conn, mut rx, result) = h.connect(params("c1", None)).await;
        result.unwrap();
        next(&mut rx).await;
        next_poke(&mut rx).await;
        h.send("c1", &conn, desire_issues()).await;
        let hydrated = next_poke(&mut rx).await;

        // A second connection for the same client replaces the first.
        let (_conn2, mut rx2, result) = h.connect(params("c1", Some(&hydrated.cookie))).await;
        result.unwrap();
        assert!(matches!(next(&mut rx2).await, Downstream::Connected(_)));
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Close(_))));
        assert!(tokio::time::timeout(Duration::from_millis(100), rx2.recv())
            .await
            .is_err());
        assert_eq!(h.cvr_store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_cookie_is_rejected() {
        let h = harness().await;
        let cookie = CvrVersion::new(version_to_lexi(5)).cookie();
        let (_conn, mut rx, result) = h.connect(params("c1", Some(&cookie))).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ClientNotFound);
        match next(&mut rx).await {
            Downstream::Error(body) => assert_eq!(body.kind, ErrorKind::ClientNotFound),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_version_outside_range_is_rejected() {
        let h = harness().await;
        let mut p = params("c1", None);
        p.schema_version = Some(7);
        let (_conn, _rx, result) = h.connect(p).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::SchemaVersionNotSupported);
    }

    fn push(ids: &[u64]) -> Upstream {
        Upstream::Push(PushBody {
            client_group_id: "g1".into(),
            mutations: ids
                .iter()
                .map(|id| Mutation {
                    id: *id,
                    client_id: "c1".into(),
                    name: viewsync_core::messages::upstream::CRUD_MUTATION_NAME.into(),
                    args: serde_json::json!({"ops": []}),
                    timestamp: 0,
                })
                .collect(),
            push_version: 1,
            request_id: "r1".into(),
            timestamp: 0,
        })
    }

    #[tokio::test]
    async fn pushes_must_be_contiguous() {
        let h = harness().await;
        let (conn, mut rx, result) = h.connect(params("c1", None)).await;
        result.unwrap();
        next(&mut rx).await;
        next_poke(&mut rx).await;

        h.send("c1", &conn, push(&[1, 2])).await;
        h.send("c1", &conn, push(&[2, 3])).await;
        h.send("c1", &conn, Upstream::Ping).await;
        assert_eq!(next(&mut rx).await, Downstream::Pong);
        assert_eq!(
            *h.sink.applied.lock(),
            vec![("g1".to_string(), vec![1, 2]), ("g1".to_string(), vec![3])]
        );

        h.send("c1", &conn, push(&[7])).await;
        match next(&mut rx).await {
            Downstream::Error(body) => assert_eq!(body.kind, ErrorKind::InvalidPush),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[test]
    fn client_rows_become_lmid_changes() {
        let rows = vec![
            make_row([
                ("clientGroupID", Value::from("g1")),
                ("clientID", "c1".into()),
                ("lastMutationID", Value::from(4)),
            ]),
            make_row([
                ("clientGroupID", Value::from("g2")),
                ("clientID", "c9".into()),
                ("lastMutationID", Value::from(1)),
            ]),
        ];
        let lmids = client_lmids(&rows, "g1");
        assert_eq!(lmids.len(), 1);
        assert_eq!(lmids["c1"], 4);
    }
}
