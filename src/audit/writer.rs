//! audit/writer.rs
//! Fire-and-forget audit writes.
//!
//! Call sites enqueue a record and move on; a dedicated writer thread drains
//! a bounded channel into the backing store. Backpressure policy is drop
//! with log: the hot path never blocks on the audit trail.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};

use crate::audit::models::AuditRecord;
use crate::audit::store::AuditStore;

/// Queue depth before records start being dropped.
const QUEUE_CAPACITY: usize = 1024;

pub struct AuditWriter {
    tx: Option<Sender<AuditRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl AuditWriter {
    /// Spawn the single writer thread draining into `store`.
    pub fn spawn(store: Arc<dyn AuditStore>) -> Self {
        let (tx, rx) = bounded::<AuditRecord>(QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("audit_writer".into())
            .spawn(move || {
                for record in rx {
                    store.log(&record);
                }
            })
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn audit writer thread; records will be dropped");
        }
        Self { tx: Some(tx), handle }
    }

    /// Enqueue a record without waiting. A full queue drops the record and
    /// logs the loss; the request path continues either way.
    pub fn enqueue(&self, record: AuditRecord) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(scan_id = %dropped.scan_id, "audit queue full, record dropped");
            }
            Err(TrySendError::Disconnected(dropped)) => {
                tracing::warn!(scan_id = %dropped.scan_id, "audit writer gone, record dropped");
            }
        }
    }

    /// Stop accepting records, drain what is queued, and join the writer.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("audit writer thread panicked");
            }
        }
    }
}

impl Drop for AuditWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
