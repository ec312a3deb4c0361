//! Metric names and descriptions.
//!
//! Recorded through the `metrics` facade. No exporter is installed here; the
//! binary or an embedding application chooses one.

use metrics::{describe_counter, describe_gauge, Unit};

pub const POKES_TOTAL: &str = "viewsync_pokes_total";
pub const FULL_RESYNCS_TOTAL: &str = "viewsync_full_resyncs_total";
pub const TRANSACTIONS_APPLIED_TOTAL: &str = "viewsync_transactions_applied_total";
pub const ACTIVE_CLIENT_GROUPS: &str = "viewsync_active_client_groups";
pub const OPERATOR_ERRORS_TOTAL: &str = "viewsync_operator_errors_total";

pub fn describe() {
    describe_counter!(POKES_TOTAL, Unit::Count, "Pokes sent to clients");
    describe_counter!(
        FULL_RESYNCS_TOTAL,
        Unit::Count,
        "Catch-ups answered with a full resync"
    );
    describe_counter!(
        TRANSACTIONS_APPLIED_TOTAL,
        Unit::Count,
        "Upstream transactions applied to the replica"
    );
    describe_gauge!(
        ACTIVE_CLIENT_GROUPS,
        Unit::Count,
        "Client groups with at least one connected client"
    );
    describe_counter!(
        OPERATOR_ERRORS_TOTAL,
        Unit::Count,
        "Pipelines torn down after an operator error"
    );
}
