//! Process configuration: command-line flags with `VIEWSYNC_*` environment
//! fallbacks.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::network::{ConnectionConfig, NetworkConfig};
use crate::view_syncer::SyncerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One tenant served under `/{path}`. Stores and feed default to in-memory
/// and the built-in upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenantConfig {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub replica_file: Option<PathBuf>,
    #[serde(default)]
    pub cvr_file: Option<PathBuf>,
    #[serde(default)]
    pub upstream_file: Option<PathBuf>,
}

/// The `--tenants` JSON list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantList(pub Vec<TenantConfig>);

fn parse_tenants(raw: &str) -> Result<TenantList, String> {
    serde_json::from_str(raw)
        .map(TenantList)
        .map_err(|e| format!("tenants must be a JSON list of {{id, path}}: {e}"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "viewsync-server", version, about = "Query-driven sync server")]
pub struct ServerConfig {
    #[arg(long, env = "VIEWSYNC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "VIEWSYNC_PORT", default_value_t = 4848)]
    pub port: u16,

    /// Origins allowed on the health routes, comma separated.
    #[arg(long, env = "VIEWSYNC_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// Sessions silent for this long are closed.
    #[arg(long, env = "VIEWSYNC_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Downstream messages queued per client before it is evicted.
    #[arg(long, env = "VIEWSYNC_OUTBOUND_CAPACITY", default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Identifies this replication shard in logs.
    #[arg(long, env = "VIEWSYNC_SHARD_ID", default_value = "0")]
    pub shard_id: String,

    /// Tables to replicate, comma separated. Empty means all.
    #[arg(long, env = "VIEWSYNC_SHARD_PUBLICATIONS", value_delimiter = ',')]
    pub shard_publications: Vec<String>,

    /// Durable replica. In memory when absent.
    #[arg(long, env = "VIEWSYNC_REPLICA_FILE")]
    pub replica_file: Option<PathBuf>,

    /// Durable client view records. In memory when absent.
    #[arg(long, env = "VIEWSYNC_CVR_FILE")]
    pub cvr_file: Option<PathBuf>,

    /// JSON-lines replication feed. Without it pushed mutations feed the
    /// replica.
    #[arg(long, env = "VIEWSYNC_UPSTREAM_FILE")]
    pub upstream_file: Option<PathBuf>,

    #[arg(long, env = "VIEWSYNC_NUM_SYNCERS", default_value_t = 2)]
    pub num_syncers: usize,

    /// Idle client groups are forgotten after this long.
    #[arg(long, env = "VIEWSYNC_CVR_TTL_SECS", default_value_t = 3600)]
    pub cvr_ttl_secs: u64,

    #[arg(long, env = "VIEWSYNC_CVR_GC_INTERVAL_SECS", default_value_t = 300)]
    pub cvr_gc_interval_secs: u64,

    /// Row tombstones kept per client group.
    #[arg(long, env = "VIEWSYNC_MAX_ROW_HISTORY", default_value_t = 1000)]
    pub max_row_history: usize,

    #[arg(long, env = "VIEWSYNC_MIN_SCHEMA_VERSION", default_value_t = 1)]
    pub min_schema_version: u32,

    #[arg(long, env = "VIEWSYNC_MAX_SCHEMA_VERSION", default_value_t = 1)]
    pub max_schema_version: u32,

    /// Transactions kept for subscribers catching up.
    #[arg(long, env = "VIEWSYNC_BACKLOG", default_value_t = 1024)]
    pub backlog: usize,

    #[arg(long, env = "VIEWSYNC_TENANTS", value_parser = parse_tenants, default_value = "[]")]
    pub tenants: TenantList,

    #[arg(long, env = "VIEWSYNC_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "VIEWSYNC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// # Errors
    ///
    /// The first setting that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_syncers == 0 {
            bail!("num-syncers must be at least 1");
        }
        if self.min_schema_version > self.max_schema_version {
            bail!(
                "min-schema-version {} is above max-schema-version {}",
                self.min_schema_version,
                self.max_schema_version
            );
        }
        if self.idle_timeout_secs == 0 || self.outbound_capacity == 0 {
            bail!("idle-timeout-secs and outbound-capacity must be positive");
        }
        if self.cvr_gc_interval_secs == 0 {
            bail!("cvr-gc-interval-secs must be positive");
        }
        let mut ids = BTreeSet::new();
        let mut paths = BTreeSet::new();
        for tenant in &self.tenants.0 {
            let path = tenant.path.trim_matches('/');
            if path.is_empty() || path.contains('/') {
                bail!(
                    "tenant {}: path {:?} must be a single path component",
                    tenant.id,
                    tenant.path
                );
            }
            if !ids.insert(tenant.id.as_str()) {
                bail!("duplicate tenant id {}", tenant.id);
            }
            if !paths.insert(path) {
                bail!("duplicate tenant path {path}");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            connection: ConnectionConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                outbound_capacity: self.outbound_capacity,
                ..ConnectionConfig::default()
            },
            ..NetworkConfig::default()
        }
    }

    #[must_use]
    pub fn syncer(&self) -> SyncerConfig {
        SyncerConfig {
            max_row_history: self.max_row_history,
            min_schema_version: self.min_schema_version,
            max_schema_version: self.max_schema_version,
            ..SyncerConfig::default()
        }
    }

    #[must_use]
    pub fn cvr_ttl(&self) -> Duration {
        Duration::from_secs(self.cvr_ttl_secs)
    }

    #[must_use]
    pub fn cvr_gc_interval(&self) -> Duration {
        Duration::from_secs(self.cvr_gc_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        ServerConfig::try_parse_from(std::iter::once("viewsync-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.port, 4848);
        assert_eq!(config.num_syncers, 2);
        assert_eq!(config.cvr_ttl(), Duration::from_secs(3600));
        assert!(config.shard_publications.is_empty());
        assert!(config.tenants.0.is_empty());
        assert_eq!(config.log_format, LogFormat::Text);
        config.validate().unwrap();
    }

    #[test]
    fn flags_parse() {
        let config = parse(&[
            "--port",
            "9000",
            "--shard-publications",
            "issue,comment",
            "--log-format",
            "json",
            "--log-level",
            "debug",
            "--tenants",
            r#"[{"id":"a","path":"alpha","replicaFile":"/tmp/a.redb"}]"#,
        ]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.shard_publications, vec!["issue", "comment"]);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.tenants.0[0].path, "alpha");
        assert_eq!(
            config.tenants.0[0].replica_file.as_deref(),
            Some(std::path::Path::new("/tmp/a.redb"))
        );
        assert_eq!(config.network().port, 9000);
        assert_eq!(config.network().cors_origins, vec!["*"]);

        let config = parse(&["--idle-timeout-secs", "5", "--cors-origins", "https://a.test,https://b.test"]);
        let network = config.network();
        assert_eq!(network.connection.idle_timeout, Duration::from_secs(5));
        assert_eq!(network.cors_origins.len(), 2);
    }

    #[test]
    fn malformed_tenants_are_a_parse_error() {
        let result = ServerConfig::try_parse_from(["viewsync-server", "--tenants", "{nope"]);
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = parse(&["--num-syncers", "0"]);
        assert!(config.validate().is_err());
        config.num_syncers = 1;
        config.min_schema_version = 3;
        assert!(config.validate().is_err());

        let config = parse(&[
            "--tenants",
            r#"[{"id":"a","path":"x"},{"id":"a","path":"y"}]"#,
        ]);
        assert!(config.validate().unwrap_err().to_string().contains("duplicate tenant id"));

        let config = parse(&["--tenants", r#"[{"id":"a","path":"x/y"}]"#]);
        assert!(config.validate().is_err());

        let config = parse(&[
            "--tenants",
            r#"[{"id":"a","path":"x"},{"id":"b","path":"/x/"}]"#,
        ]);
        assert!(config.validate().unwrap_err().to_string().contains("duplicate tenant path"));
    }
}
