//! viewsync server: replicates an upstream database into a local replica,
//! keeps a client view record per client group, and pokes connected clients
//! with the row and query changes of their desired queries.

pub mod cvr;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod network;
pub mod replication;
pub mod server;
pub mod service;
pub mod storage;
pub mod view_syncer;

pub use dispatcher::{ConnectParams, Dispatcher};
pub use error::SyncError;
pub use server::{Stack, StackConfig};
