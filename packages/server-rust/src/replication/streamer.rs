//! Change streamer: turns the upstream event stream into whole transactions.
//!
//! Data events are buffered until their commit arrives, so subscribers only
//! ever see complete transactions. Committed transactions go out over a
//! broadcast channel and are kept in a bounded backlog that late subscribers
//! catch up from.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use viewsync_core::version::{parse_lsn, version_to_lexi};

use super::event::{ChangeSourceEvent, DataChange, Publications};
use crate::error::ReplicationError;

/// A committed upstream transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Watermark of the previous commit, `None` for the first one seen.
    pub previous_watermark: Option<String>,
    /// Previous commit plus one: the version stamped on the begin and data
    /// events.
    pub begin_watermark: String,
    /// Lexi-encoded commit LSN.
    pub watermark: String,
    pub commit_lsn: String,
    pub changes: Vec<DataChange>,
}

/// Backlog catch-up plus a live receiver, taken atomically so that no
/// transaction is missed or seen twice.
pub struct Subscription {
    pub catchup: Vec<Arc<Transaction>>,
    pub rx: broadcast::Receiver<Arc<Transaction>>,
}

struct OpenTransaction {
    lsn: String,
    changes: Vec<DataChange>,
}

#[derive(Default)]
struct State {
    open: Option<OpenTransaction>,
    last_commit: Option<u64>,
    backlog: VecDeque<Arc<Transaction>>,
    /// Watermark of the newest transaction dropped from the backlog.
    evicted_through: Option<String>,
}

pub struct ChangeStreamer {
    publications: Publications,
    backlog_capacity: usize,
    state: Mutex<State>,
    tx: broadcast::Sender<Arc<Transaction>>,
}

impl ChangeStreamer {
    #[must_use]
    pub fn new(publications: Publications, backlog_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog_capacity.max(1));
        Self {
            publications,
            backlog_capacity: backlog_capacity.max(1),
            state: Mutex::new(State::default()),
            tx,
        }
    }

    /// Feeds one upstream event. Returns the transaction a commit completes.
    ///
    /// # Errors
    ///
    /// Nested begins, data or commits outside a transaction, commits that do
    /// not advance, and malformed LSNs.
    pub fn process(
        &self,
        event: ChangeSourceEvent,
    ) -> Result<Option<Arc<Transaction>>, ReplicationError> {
        let mut state = self.state.lock();
        match event {
            ChangeSourceEvent::Begin { lsn } => {
                if let Some(open) = &state.open {
                    return Err(ReplicationError::NestedBegin {
                        open: open.lsn.clone(),
                        lsn,
                    });
                }
                parse_lsn(&lsn)?;
                trace!(%lsn, "begin");
                state.open = Some(OpenTransaction {
                    lsn,
                    changes: Vec::new(),
                });
                Ok(None)
            }
            ChangeSourceEvent::Commit { lsn } => {
                let Some(open) = state.open.take() else {
                    return Err(ReplicationError::OutsideTransaction { event: "commit" });
                };
                let commit = parse_lsn(&lsn)?;
                if let Some(previous) = state.last_commit {
                    if commit <= previous {
                        return Err(ReplicationError::NonMonotonicCommit {
                            previous: viewsync_core::version::format_lsn(previous),
                            commit: lsn,
                        });
                    }
                }
                let txn = Arc::new(Transaction {
                    previous_watermark: state.last_commit.map(version_to_lexi),
                    begin_watermark: version_to_lexi(state.last_commit.unwrap_or(0) + 1),
                    watermark: version_to_lexi(commit),
                    commit_lsn: lsn,
                    changes: open.changes,
                });
                state.last_commit = Some(commit);
                debug!(
                    begin = %open.lsn,
                    watermark = %txn.watermark,
                    changes = txn.changes.len(),
                    "transaction committed"
                );

                state.backlog.push_back(Arc::clone(&txn));
                while state.backlog.len() > self.backlog_capacity {
                    if let Some(evicted) = state.backlog.pop_front() {
                        state.evicted_through = Some(evicted.watermark.clone());
                    }
                }
                // No receivers is fine: subscribers catch up from the backlog.
                let _ = self.tx.send(Arc::clone(&txn));
                Ok(Some(txn))
            }
            data => {
                let kind = data.kind();
                let Some(open) = state.open.as_mut() else {
                    return Err(ReplicationError::OutsideTransaction { event: kind });
                };
                if let Some(change) = data.into_data().and_then(|c| self.publications.filter(c)) {
                    open.changes.push(change);
                }
                Ok(None)
            }
        }
    }

    /// Subscribes to transactions committed after `from` (all retained ones
    /// when `None`).
    ///
    /// # Errors
    ///
    /// [`ReplicationError::BacklogExhausted`] if transactions after `from`
    /// were already evicted.
    pub fn subscribe(&self, from: Option<&str>) -> Result<Subscription, ReplicationError> {
        let state = self.state.lock();
        if let Some(evicted) = &state.evicted_through {
            if from.map_or(true, |from| from < evicted.as_str()) {
                return Err(ReplicationError::BacklogExhausted {
                    from: from.unwrap_or_default().to_string(),
                });
            }
        }
        let catchup = state
            .backlog
            .iter()
            .filter(|txn| from.map_or(true, |from| txn.watermark.as_str() > from))
            .cloned()
            .collect();
        Ok(Subscription {
            catchup,
            rx: self.tx.subscribe(),
        })
    }

    /// Watermark of the last committed transaction.
    #[must_use]
    pub fn watermark(&self) -> Option<String> {
        self.state.lock().last_commit.map(version_to_lexi)
    }
}
