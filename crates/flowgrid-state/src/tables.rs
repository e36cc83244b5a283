//! redb table definitions for the run store.
//!
//! Values are JSON-serialized domain types, except `RUN_KEYS` which maps an
//! idempotency key straight to a run id and `RUNNING_SLOTS` which stores the
//! run id of each slot holder.

use redb::TableDefinition;

/// Runs keyed by their UUID in hyphenated form.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Uniqueness index keyed by `{deployment_id}|{idempotency_key}`.
pub const RUN_KEYS: TableDefinition<&str, &str> = TableDefinition::new("run_keys");

/// Runs currently holding a concurrency slot, keyed by
/// `{deployment_id}|{run_id}`.
pub const RUNNING_SLOTS: TableDefinition<&str, &str> = TableDefinition::new("running_slots");

/// Deployments keyed by id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

pub(crate) fn run_key_entry(deployment_id: &str, idempotency_key: &str) -> String {
    format!("{deployment_id}|{idempotency_key}")
}

pub(crate) fn slot_entry(deployment_id: &str, run_id: &str) -> String {
    format!("{deployment_id}|{run_id}")
}

/// Half-open key range covering every slot of one deployment.
pub(crate) fn slot_range(deployment_id: &str) -> (String, String) {
    // '}' sorts directly after the '|' separator.
    (format!("{deployment_id}|"), format!("{deployment_id}}}"))
}
