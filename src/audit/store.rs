//! audit/store.rs
//! The pluggable audit store contract.

use crate::audit::models::{AuditRecord, EventFilters};

/// Capability interface over the two audit backends (embedded SQLite and
/// remote row store), selected once at process init by the factory.
///
/// Semantics every implementation must honor:
/// - `log` never propagates an error to the caller; call sites are
///   fire-and-forget. Duplicate `scan_id`s are silently absorbed.
/// - `query` returns newest-first and honors every non-`None` filter field.
/// - `count` is exact, never materializes rows, and ignores paging fields.
/// - `prune_older_than` uses a strict `<` boundary: a record stamped exactly
///   at `now − retention_days` is kept.
/// - `health_check` and `close` never fail loudly.
pub trait AuditStore: Send + Sync {
    fn log(&self, record: &AuditRecord);

    fn query(&self, filters: &EventFilters) -> Vec<AuditRecord>;

    fn count(&self, filters: &EventFilters) -> u64;

    fn health_check(&self) -> bool;

    fn prune_older_than(&self, retention_days: i64) -> u64;

    fn close(&self);
}

/// No-op store: used when the remote variant is configured but unavailable,
/// and as a test stub.
#[derive(Debug, Default)]
pub struct NullAuditStore;

impl AuditStore for NullAuditStore {
    fn log(&self, record: &AuditRecord) {
        tracing::debug!(scan_id = %record.scan_id, "null audit store: log discarded");
    }

    fn query(&self, _filters: &EventFilters) -> Vec<AuditRecord> {
        Vec::new()
    }

    fn count(&self, _filters: &EventFilters) -> u64 {
        0
    }

    fn health_check(&self) -> bool {
        true
    }

    fn prune_older_than(&self, _retention_days: i64) -> u64 {
        0
    }

    fn close(&self) {}
}
