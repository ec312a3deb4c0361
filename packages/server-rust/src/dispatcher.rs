//! Connection dispatcher.
//!
//! Parses `[/{tenantPath}]/api/sync/v{N}/connect?clientID=..&clientGroupID=..`
//! and picks the view syncer that owns the client group. Everything is
//! validated here, before any view syncer state is touched.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::view_syncer::{SyncerHandle, SyncerPool};

/// Oldest protocol version the server still speaks.
pub const MIN_PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_VERSION: u32 = 1;

/// Query parameters of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: String,
    pub client_group_id: String,
    pub base_cookie: Option<String>,
    /// Client clock at connect, milliseconds.
    pub timestamp: u64,
    /// Last mutation id the client saw acknowledged.
    pub lmid: u64,
    pub wsid: String,
    pub schema_version: Option<u32>,
}

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::InvalidConnectionRequest(message.into())
}

fn required<'a>(query: &'a HashMap<String, String>, name: &str) -> Result<&'a str, SyncError> {
    query
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid(format!("missing query parameter {name}")))
}

fn integer<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, SyncError> {
    value
        .parse()
        .map_err(|_| invalid(format!("query parameter {name} must be an integer, got {value:?}")))
}

impl ConnectParams {
    /// # Errors
    ///
    /// [`SyncError::InvalidConnectionRequest`] naming the missing or
    /// malformed parameter.
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, SyncError> {
        let optional = |name: &str| query.get(name).filter(|v| !v.is_empty()).cloned();
        Ok(Self {
            client_id: required(query, "clientID")?.to_string(),
            client_group_id: required(query, "clientGroupID")?.to_string(),
            base_cookie: optional("baseCookie"),
            timestamp: integer("ts", required(query, "ts")?)?,
            lmid: integer("lmid", required(query, "lmid")?)?,
            wsid: optional("wsid").unwrap_or_default(),
            schema_version: optional("schemaVersion")
                .map(|v| integer("schemaVersion", &v))
                .transpose()?,
        })
    }
}

/// Where a connection goes.
#[derive(Clone)]
pub struct Route {
    pub tenant: String,
    pub protocol_version: u32,
    pub params: ConnectParams,
    pub syncer: SyncerHandle,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("tenant", &self.tenant)
            .field("protocol_version", &self.protocol_version)
            .field("params", &self.params)
            .field("shard", &self.syncer.shard())
            .finish()
    }
}

struct Tenant {
    id: String,
    /// `None` for the single default tenant served without a path prefix.
    path: Option<String>,
    pool: Arc<SyncerPool>,
}

#[derive(Default)]
pub struct Dispatcher {
    tenants: Vec<Tenant>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with one tenant served at the root.
    #[must_use]
    pub fn single(pool: Arc<SyncerPool>) -> Self {
        Self {
            tenants: vec![Tenant {
                id: "default".into(),
                path: None,
                pool,
            }],
        }
    }

    /// Adds a tenant served under `/{path}`.
    ///
    /// # Errors
    ///
    /// The id or path is already taken, or the path is not a single
    /// component.
    pub fn add_tenant(
        &mut self,
        id: impl Into<String>,
        path: impl Into<String>,
        pool: Arc<SyncerPool>,
    ) -> anyhow::Result<()> {
        let id = id.into();
        let path = path.into().trim_matches('/').to_string();
        if path.is_empty() || path.contains('/') {
            anyhow::bail!("tenant {id}: path {path:?} must be a single path component");
        }
        if self
            .tenants
            .iter()
            .any(|t| t.id == id || t.path.as_deref() == Some(path.as_str()))
        {
            anyhow::bail!("tenant {id} or path {path} is already registered");
        }
        self.tenants.push(Tenant {
            id,
            path: Some(path),
            pool,
        });
        Ok(())
    }

    fn has_paths(&self) -> bool {
        self.tenants.iter().any(|t| t.path.is_some())
    }

    /// Every tenant pool, for shutdown.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<SyncerPool>> {
        self.tenants.iter().map(|t| &t.pool)
    }

    /// Resolves a connect request.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConnectionRequest`] for unknown paths, tenants and
    /// protocol versions, and for bad query parameters.
    pub fn dispatch(
        &self,
        path: &str,
        query: &HashMap<String, String>,
    ) -> Result<Route, SyncError> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (tenant_path, rest) = match segments.as_slice() {
            [tenant, rest @ ..] if rest.len() == 4 => (Some(*tenant), rest),
            rest if rest.len() == 4 => (None, rest),
            _ => return Err(invalid(format!("unknown path {path}"))),
        };
        let ["api", "sync", version, "connect"] = rest else {
            return Err(invalid(format!("unknown path {path}")));
        };
        let protocol_version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| invalid(format!("malformed protocol version {version}")))?;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&protocol_version) {
            return Err(invalid(format!(
                "protocol version {protocol_version} is not supported \
                 ({MIN_PROTOCOL_VERSION}..={PROTOCOL_VERSION})"
            )));
        }

        let tenant = match tenant_path {
            Some(_) if !self.has_paths() => {
                return Err(invalid(format!("unknown path {path}")));
            }
            None if self.has_paths() => {
                return Err(invalid("a tenant path is required"));
            }
            Some(p) => self.tenants.iter().find(|t| t.path.as_deref() == Some(p)),
            None => self.tenants.first(),
        }
        .ok_or_else(|| invalid(format!("unknown tenant in {path}")))?;

        let params = ConnectParams::from_query(query)?;
        let syncer = tenant.pool.route(&params.client_group_id).clone();
        Ok(Route {
            tenant: tenant.id.clone(),
            protocol_version,
            params,
            syncer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewsync_core::messages::ErrorKind;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn connect_query() -> HashMap<String, String> {
        query(&[
            ("clientID", "c1"),
            ("clientGroupID", "g1"),
            ("ts", "1700000000000"),
            ("lmid", "0"),
            ("baseCookie", "01"),
            ("schemaVersion", "3"),
        ])
    }

    #[test]
    fn params_parse() {
        let params = ConnectParams::from_query(&connect_query()).unwrap();
        assert_eq!(params.client_id, "c1");
        assert_eq!(params.base_cookie.as_deref(), Some("01"));
        assert_eq!(params.schema_version, Some(3));
        assert_eq!(params.wsid, "");
    }

    #[test]
    fn params_errors_name_the_parameter() {
        let mut q = connect_query();
        q.remove("clientGroupID");
        let err = ConnectParams::from_query(&q).unwrap_err();
        assert!(err.to_string().contains("clientGroupID"));

        let mut q = connect_query();
        q.insert("lmid".into(), "three".into());
        let err = ConnectParams::from_query(&q).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConnectionRequest);
        assert!(err.to_string().contains("lmid"));
    }

    #[tokio::test]
    async fn routes_by_path() {
        let pool = Arc::new(SyncerPool::detached(3));
        let dispatcher = Dispatcher::single(Arc::clone(&pool));
        let route = dispatcher
            .dispatch("/api/sync/v1/connect", &connect_query())
            .unwrap();
        assert_eq!(route.tenant, "default");
        assert_eq!(route.protocol_version, 1);
        assert_eq!(route.syncer.shard(), pool.route("g1").shard());

        for bad in ["/api/sync/v9/connect", "/api/sync/vx/connect", "/api/pull", "/t1/api/sync/v1/connect"] {
            let err = dispatcher.dispatch(bad, &connect_query()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConnectionRequest, "{bad}");
        }
    }

    #[tokio::test]
    async fn tenants_are_selected_by_path() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .add_tenant("a", "alpha", Arc::new(SyncerPool::detached(1)))
            .unwrap();
        dispatcher
            .add_tenant("b", "/beta/", Arc::new(SyncerPool::detached(1)))
            .unwrap();
        assert!(dispatcher
            .add_tenant("c", "alpha", Arc::new(SyncerPool::detached(1)))
            .is_err());
        assert!(dispatcher
            .add_tenant("d", "x/y", Arc::new(SyncerPool::detached(1)))
            .is_err());

        let route = dispatcher
            .dispatch("/beta/api/sync/v1/connect", &connect_query())
            .unwrap();
        assert_eq!(route.tenant, "b");
        assert!(dispatcher
            .dispatch("/gamma/api/sync/v1/connect", &connect_query())
            .is_err());
        assert!(dispatcher
            .dispatch("/api/sync/v1/connect", &connect_query())
            .is_err());
    }
}
