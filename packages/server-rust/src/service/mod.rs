//! Process services: configuration, logging setup and background workers.

pub mod config;
pub mod telemetry;
pub mod worker;

pub use config::{LogFormat, LogLevel, ServerConfig, TenantConfig, TenantList};
pub use telemetry::init_tracing;
pub use worker::{BackgroundRunnable, BackgroundWorker, CvrGc, CvrGcTask};
