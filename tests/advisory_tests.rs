//! Advisory engine: out-of-band detection, shared signal, timeout bound.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ongarde_core::advisory::{
    run_advisory_scan, AdvisoryEngine, AdvisoryOutcome, AdvisorySignal, RegexAdvisoryEngine,
};
use ongarde_core::scanner::definitions::PatternRegistry;

fn registry() -> Arc<PatternRegistry> {
    Arc::new(PatternRegistry::compile().expect("registry must compile"))
}

fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn regex_engine_reports_entity_types_only() {
    let engine = RegexAdvisoryEngine::new(registry());
    let outcome = engine.detect("reach me at user@example.com, SSN 123-45-6789");
    assert!(outcome.abort);
    assert!(outcome.entities.contains(&"EMAIL".to_string()), "{:?}", outcome.entities);
    assert!(outcome.entities.contains(&"US_SSN".to_string()), "{:?}", outcome.entities);
    // Entity names, never the matched text.
    for entity in &outcome.entities {
        assert!(!entity.contains('@'));
        assert!(!entity.contains("123-45"));
    }
}

#[test]
fn clean_text_produces_no_signal() {
    let engine = RegexAdvisoryEngine::new(registry());
    let outcome = engine.detect("nothing sensitive in here");
    assert!(!outcome.abort);
    assert!(outcome.entities.is_empty());
}

#[test]
fn background_scan_flips_shared_signal() {
    let signal = AdvisorySignal::new();
    let engine: Arc<dyn AdvisoryEngine> = Arc::new(RegexAdvisoryEngine::new(registry()));
    run_advisory_scan(
        engine,
        "ssn is 123-45-6789".to_string(),
        Duration::from_secs(2),
        signal.clone(),
    );
    assert!(wait_for(|| signal.should_abort(), Duration::from_secs(3)));
    assert!(signal.entities().contains(&"US_SSN".to_string()));
}

struct StalledEngine;

impl AdvisoryEngine for StalledEngine {
    fn detect(&self, _text: &str) -> AdvisoryOutcome {
        std::thread::sleep(Duration::from_secs(5));
        AdvisoryOutcome { entities: vec!["LATE".into()], abort: true }
    }
}

/// An engine that overruns its budget never reaches the hot-path signal.
#[test]
fn timed_out_scan_leaves_signal_untouched() {
    let signal = AdvisorySignal::new();
    run_advisory_scan(
        Arc::new(StalledEngine),
        "anything".to_string(),
        Duration::from_millis(50),
        signal.clone(),
    );
    std::thread::sleep(Duration::from_millis(300));
    assert!(!signal.should_abort());
    assert!(signal.entities().is_empty());
}
