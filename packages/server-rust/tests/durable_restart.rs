//! A stack backed by a redb file keeps its replica and client view records
//! across restarts.

#![cfg(feature = "redb")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use viewsync_core::data::make_row;
use viewsync_core::{Row, Value};
use viewsync_server::cvr::CvrRecord;
use viewsync_server::replication::ChangeSourceEvent;
use viewsync_server::storage::ReplicaStore;
use viewsync_server::{Stack, StackConfig};

fn issue(id: i64, title: &str) -> Row {
    make_row([("id", Value::from(id)), ("title", title.into())])
}

fn config(path: &Path) -> StackConfig {
    StackConfig {
        replica_file: Some(path.to_path_buf()),
        cvr_file: Some(path.to_path_buf()),
        ..StackConfig::in_memory("durable")
    }
}

async fn wait_past(replica: &Arc<dyn ReplicaStore>, previous: Option<&str>) -> String {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(watermark) = replica.watermark().await.unwrap() {
                if previous.map_or(true, |p| watermark.as_str() > p) {
                    return watermark;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transaction was not replicated")
}

#[tokio::test]
async fn replica_and_records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.redb");

    let (signal, signal_rx) = watch::channel(false);
    let stack = Stack::start(&config(&path), &signal_rx).await.unwrap();
    stack
        .upstream
        .as_ref()
        .unwrap()
        .commit(vec![ChangeSourceEvent::Insert {
            table: "issue".into(),
            row: issue(1, "first"),
        }])
        .unwrap();
    let first = wait_past(stack.replicator.replica(), None).await;
    stack
        .cvr_store
        .flush(&CvrRecord::new("g1", 1_000), None)
        .await
        .unwrap();
    signal.send(true).unwrap();
    timeout(Duration::from_secs(5), stack.stop()).await.unwrap();

    let (signal, signal_rx) = watch::channel(false);
    let stack = Stack::start(&config(&path), &signal_rx).await.unwrap();
    let replica = Arc::clone(stack.replicator.replica());
    assert_eq!(replica.watermark().await.unwrap().as_deref(), Some(first.as_str()));
    assert_eq!(replica.scan("issue").await.unwrap(), vec![issue(1, "first")]);
    assert_eq!(stack.cvr_store.ids().await.unwrap(), vec!["g1".to_string()]);

    // The rebuilt upstream continues after the stored watermark.
    stack
        .upstream
        .as_ref()
        .unwrap()
        .commit(vec![ChangeSourceEvent::Insert {
            table: "issue".into(),
            row: issue(2, "second"),
        }])
        .unwrap();
    wait_past(&replica, Some(&first)).await;
    assert_eq!(replica.scan("issue").await.unwrap().len(), 2);

    signal.send(true).unwrap();
    timeout(Duration::from_secs(5), stack.stop()).await.unwrap();
}
