//! Audit trail: decision records, the pluggable store contract, and the
//! factory that picks a backend from configuration.

pub mod models;
#[cfg(feature = "remote-audit")]
pub mod remote;
pub mod sqlite;
pub mod store;
pub mod writer;

use std::sync::Arc;

use crate::config::AuditSettings;

pub use models::{Action, AuditRecord, Direction, EventFilters, AUDIT_SCHEMA_VERSION};
pub use sqlite::{spawn_retention_task, AuditOpenError, SqliteAuditStore};
pub use store::{AuditStore, NullAuditStore};
pub use writer::AuditWriter;

/// Select and initialize the audit backend.
///
/// Remote URL and key both configured → remote variant; otherwise the
/// embedded SQLite variant. Only the SQLite path can fail, and only on the
/// schema-version guard; that error must abort startup.
pub fn create_audit_store(settings: &AuditSettings) -> Result<Arc<dyn AuditStore>, AuditOpenError> {
    if let (Some(url), Some(key)) = (&settings.remote_url, &settings.remote_key) {
        #[cfg(feature = "remote-audit")]
        {
            tracing::info!("audit backend selected: remote");
            return Ok(Arc::new(remote::RemoteAuditStore::new(url, key)));
        }
        #[cfg(not(feature = "remote-audit"))]
        {
            let _ = (url, key);
            tracing::warn!(
                "remote audit configured but the remote-audit feature is disabled; auditing is a no-op"
            );
            return Ok(Arc::new(NullAuditStore));
        }
    }

    tracing::info!(db_path = %settings.db_path.display(), "audit backend selected: sqlite");
    Ok(Arc::new(SqliteAuditStore::open(&settings.db_path)?))
}
