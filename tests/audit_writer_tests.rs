//! Fire-and-forget writer, retention task cancellation, and the closed-set
//! serialization boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use ongarde_core::audit::{
    spawn_retention_task, Action, AuditRecord, AuditStore, AuditWriter, Direction, EventFilters,
    NullAuditStore, SqliteAuditStore,
};
use ongarde_core::scanner::definitions::RiskLevel;
use ongarde_core::utils::generate_scan_id;

#[test]
fn writer_drains_queued_records_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let store: Arc<SqliteAuditStore> =
        Arc::new(SqliteAuditStore::open(dir.path().join("audit.db")).expect("open"));
    let mut writer = AuditWriter::spawn(store.clone());

    for _ in 0..3 {
        writer.enqueue(AuditRecord::new(
            generate_scan_id(),
            "alice",
            Action::Block,
            Direction::Request,
        ));
    }
    writer.shutdown();

    assert_eq!(store.count(&EventFilters::default()), 3);
}

#[test]
fn enqueue_after_shutdown_drops_without_blocking() {
    let mut writer = AuditWriter::spawn(Arc::new(NullAuditStore));
    writer.shutdown();
    // Must not panic or hang.
    writer.enqueue(AuditRecord::new(
        generate_scan_id(),
        "alice",
        Action::Allow,
        Direction::Request,
    ));
}

#[test]
fn retention_task_cancels_during_sleep() {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = spawn_retention_task(Arc::new(NullAuditStore), 90, rx);

    // The task is parked waiting for the next 03:00 UTC; cancellation must
    // cut that sleep short.
    let t0 = Instant::now();
    tx.send(()).expect("send shutdown");
    handle.join().expect("join retention task");
    assert!(t0.elapsed() < Duration::from_secs(10));
}

#[test]
fn retention_task_stops_when_sender_drops() {
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    let handle = spawn_retention_task(Arc::new(NullAuditStore), 90, rx);
    drop(tx);
    handle.join().expect("join retention task");
}

#[test]
fn closed_sets_serialize_to_wire_strings() {
    assert_eq!(serde_json::to_string(&Action::Allow).unwrap(), "\"ALLOW\"");
    assert_eq!(serde_json::to_string(&Action::Block).unwrap(), "\"BLOCK\"");
    assert_eq!(
        serde_json::to_string(&Action::AllowSuppressed).unwrap(),
        "\"ALLOW_SUPPRESSED\""
    );
    assert_eq!(serde_json::to_string(&Direction::Request).unwrap(), "\"REQUEST\"");
    assert_eq!(serde_json::to_string(&Direction::Response).unwrap(), "\"RESPONSE\"");
    assert_eq!(serde_json::to_string(&RiskLevel::Critical).unwrap(), "\"CRITICAL\"");
    assert_eq!(serde_json::to_string(&RiskLevel::Low).unwrap(), "\"LOW\"");
}

#[test]
fn risk_levels_order_by_severity() {
    assert!(RiskLevel::Critical > RiskLevel::High);
    assert!(RiskLevel::High > RiskLevel::Medium);
    assert!(RiskLevel::Medium > RiskLevel::Low);
}

#[test]
fn audit_record_serialization_omits_suppression_hint_shaped_fields() {
    let mut record =
        AuditRecord::new(generate_scan_id(), "alice", Action::Block, Direction::Request);
    record.rule_id = Some("CREDENTIAL_DETECTED".into());
    record.risk_level = Some(RiskLevel::Critical);
    let json = serde_json::to_value(&record).unwrap();
    let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
    assert!(!keys.iter().any(|k| k.contains("suppression")), "{keys:?}");
    // The optional test flag serializes under its wire name.
    assert!(keys.contains(&"test"));
    assert!(!keys.contains(&"is_test"));
}
