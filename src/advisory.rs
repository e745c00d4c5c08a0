//! Advisory PII scan: out-of-band, timeout-bounded, never authoritative.
//!
//! The hot path never calls into this module. A stream forwarder snapshots
//! the scanner's advisory buffer, hands it to [`run_advisory_scan`], and
//! keeps streaming; between chunks it checks [`AdvisorySignal::should_abort`].
//! The engine's findings are entity-type names only; raw matches stay
//! inside the worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::scanner::definitions::PatternRegistry;

/// Ceiling on a single advisory pass.
pub const ADVISORY_TIMEOUT: Duration = Duration::from_secs(2);

/// What an advisory pass concluded.
#[derive(Debug, Clone, Default)]
pub struct AdvisoryOutcome {
    /// Entity-type names, e.g. `["US_SSN", "EMAIL"]`. Never raw matches.
    pub entities: Vec<String>,
    /// Whether the forwarder should stop the stream.
    pub abort: bool,
}

/// Detector contract. The production engine may be a heavyweight NER model;
/// the built-in default reuses the registry's PII fast-path shapes.
pub trait AdvisoryEngine: Send + Sync {
    fn detect(&self, text: &str) -> AdvisoryOutcome;
}

/// Regex-backed advisory engine over the registry's PII group.
pub struct RegexAdvisoryEngine {
    registry: Arc<PatternRegistry>,
}

impl RegexAdvisoryEngine {
    pub fn new(registry: Arc<PatternRegistry>) -> Self {
        Self { registry }
    }
}

impl AdvisoryEngine for RegexAdvisoryEngine {
    fn detect(&self, text: &str) -> AdvisoryOutcome {
        let mut entities = Vec::new();
        for entry in self.registry.pii_fast_path() {
            if entry.pattern().is_match(text) {
                // "PII_DETECTED_US_SSN" → "US_SSN"
                let entity = entry
                    .rule_id()
                    .strip_prefix("PII_DETECTED_")
                    .unwrap_or(entry.rule_id());
                entities.push(entity.to_string());
            }
        }
        let abort = !entities.is_empty();
        AdvisoryOutcome { entities, abort }
    }
}

/// Shared signal between the advisory runner and the stream forwarder.
#[derive(Clone, Default)]
pub struct AdvisorySignal {
    abort: Arc<AtomicBool>,
    entities: Arc<Mutex<Vec<String>>>,
}

impl AdvisorySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checked by the forwarder between chunks; the advisory path's only
    /// effect on the hot path.
    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Entity types found so far, for the audit record.
    pub fn entities(&self) -> Vec<String> {
        self.entities
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn apply(&self, outcome: AdvisoryOutcome) {
        if let Ok(mut entities) = self.entities.lock() {
            *entities = outcome.entities;
        }
        if outcome.abort {
            self.abort.store(true, Ordering::SeqCst);
        }
    }
}

/// Run one advisory pass over `text` in the background.
///
/// The engine executes on a worker thread; a second thread enforces the
/// timeout and applies the outcome to `signal`. A pass that overruns the
/// timeout is abandoned (its thread finishes and its result is discarded);
/// the advisory scan is best-effort by definition.
pub fn run_advisory_scan(
    engine: Arc<dyn AdvisoryEngine>,
    text: String,
    timeout: Duration,
    signal: AdvisorySignal,
) {
    let spawned = std::thread::Builder::new()
        .name("advisory_scan".into())
        .spawn(move || {
            let (tx, rx) = bounded::<AdvisoryOutcome>(1);
            let worker = std::thread::Builder::new()
                .name("advisory_detect".into())
                .spawn(move || {
                    let _ = tx.send(engine.detect(&text));
                });
            if worker.is_err() {
                tracing::warn!("advisory worker spawn failed");
                return;
            }
            match rx.recv_timeout(timeout) {
                Ok(outcome) => {
                    if !outcome.entities.is_empty() {
                        tracing::info!(
                            entities = ?outcome.entities,
                            abort = outcome.abort,
                            "advisory scan found entities"
                        );
                    }
                    signal.apply(outcome);
                }
                Err(_) => {
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "advisory scan timed out");
                }
            }
        });
    if spawned.is_err() {
        tracing::warn!("advisory scan spawn failed");
    }
}
