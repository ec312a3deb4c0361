//! Listener and per-socket settings of the sync endpoint.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick.
    pub port: u16,
    pub connection: ConnectionConfig,
    /// `*` allows any origin on the health routes.
    pub cors_origins: Vec<String>,
    /// Applies to plain HTTP requests, not to upgraded sessions.
    pub request_timeout: Duration,
    /// How long shutdown waits for open sessions to end.
    pub drain_timeout: Duration,
}

impl NetworkConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4848,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".into()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Backpressure and timeouts of one sync session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Downstream messages queued per client before it counts as too slow
    /// and is evicted.
    pub outbound_capacity: usize,
    pub send_timeout: Duration,
    /// A session without upstream frames for this long is closed. Clients
    /// ping to stay alive.
    pub idle_timeout: Duration,
    /// Largest upstream frame accepted, in bytes.
    pub max_message_size: usize,
    pub write_buffer_size: usize,
    pub max_write_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            send_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            max_message_size: 4 << 20,
            write_buffer_size: 128 << 10,
            max_write_buffer_size: 512 << 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = NetworkConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..NetworkConfig::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn write_buffer_fits_under_its_cap() {
        let config = ConnectionConfig::default();
        assert!(config.write_buffer_size < config.max_write_buffer_size);
        assert!(config.outbound_capacity > 0);
    }
}
