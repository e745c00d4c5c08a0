//! Streaming scanner: window accumulation, overlap detection, abort latching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ongarde_core::scanner::definitions::{PatternRegistry, RULE_CREDENTIAL};
use ongarde_core::scanner::streaming::{StreamingScanner, OVERLAP_SIZE, WINDOW_SIZE};

const SCAN_ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

fn registry() -> Arc<PatternRegistry> {
    Arc::new(PatternRegistry::compile().expect("registry must compile"))
}

/// n characters of clean text that trips no pattern.
fn clean_text(n: usize) -> String {
    let base = "The quick brown fox jumps over the lazy dog. ";
    base.repeat(n / base.len() + 2).chars().take(n).collect()
}

#[test]
fn add_content_accumulates_below_window_size() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    assert!(scanner.add_content(&clean_text(100)).is_none());
    assert!(scanner.add_content(&clean_text(100)).is_none());
    assert_eq!(scanner.window_count(), 0);
    assert_eq!(scanner.tokens_delivered(), 50);
}

#[test]
fn full_window_scans_and_rotates_overlap() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    let window = clean_text(WINDOW_SIZE);
    assert!(scanner.add_content(&window).is_none());
    assert_eq!(scanner.window_count(), 1);
    let expected: String = window
        .chars()
        .skip(WINDOW_SIZE - OVERLAP_SIZE)
        .collect();
    assert_eq!(scanner.overlap_buffer(), expected);
    assert_eq!(scanner.window_scan_latencies().len(), 1);
}

#[test]
fn flush_scans_partial_window() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    assert!(scanner.add_content("clean tail without trouble").is_none());
    assert!(scanner.flush().is_none());
}

#[test]
fn flush_on_empty_buffer_is_none() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    assert!(scanner.flush().is_none());
}

#[test]
fn credential_inside_single_window_blocks() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    let cred = format!("sk-proj-{}", "a".repeat(48));
    let chunk = format!("{}{}", clean_text(WINDOW_SIZE - cred.len()), cred);
    let block = scanner.add_content(&chunk).expect("block");
    assert_eq!(block.rule_id, RULE_CREDENTIAL);
    assert_eq!(block.scan_id, SCAN_ID);
    assert!(scanner.aborted());
}

/// A credential split across the window boundary is caught in the next
/// window because the overlap buffer is prepended to the scan text.
#[test]
fn split_credential_detected_via_overlap() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    let cred = format!("sk-proj-{}", "a".repeat(48)); // 56 chars
    let (head, tail) = cred.split_at(10);

    let window1 = format!("{}{}", clean_text(WINDOW_SIZE - head.len()), head);
    assert_eq!(window1.len(), WINDOW_SIZE);
    assert!(scanner.add_content(&window1).is_none(), "partial credential must pass");
    assert!(scanner.overlap_buffer().contains(head));

    let window2 = format!("{}{}", tail, clean_text(WINDOW_SIZE - tail.len()));
    let block = scanner.add_content(&window2).expect("second window must block");
    assert_eq!(block.rule_id, RULE_CREDENTIAL);
    assert_eq!(block.tokens_delivered, (2 * WINDOW_SIZE / 4) as u64);
    assert!(block.suppression_hint.is_some());
}

/// Abort latching: after a block, no further call re-runs the scan.
#[test]
fn abort_is_idempotent_and_never_rescans() {
    let scans = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&scans);
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID)
        .with_window_scan_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let cred = format!("sk-proj-{}", "a".repeat(48));
    let chunk = format!("{}{}", clean_text(WINDOW_SIZE), cred);
    let first = scanner.add_content(&chunk).expect("block");
    assert_eq!(scans.load(Ordering::SeqCst), 1);

    for _ in 0..5 {
        let again = scanner.add_content(&clean_text(WINDOW_SIZE)).expect("latched");
        assert_eq!(again.rule_id, first.rule_id);
        assert_eq!(again.scan_id, first.scan_id);
        assert_eq!(again.tokens_delivered, first.tokens_delivered);
    }
    let flushed = scanner.flush().expect("latched");
    assert_eq!(flushed.rule_id, first.rule_id);
    // The scan primitive ran exactly once.
    assert_eq!(scans.load(Ordering::SeqCst), 1);
}

#[test]
fn tokens_delivered_tracks_chars_over_4() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    scanner.add_content(&clean_text(400));
    assert_eq!(scanner.tokens_delivered(), 100);
    scanner.add_content(&clean_text(112));
    assert_eq!(scanner.tokens_delivered(), 128);
}

#[test]
fn advisory_buffer_accumulates_everything() {
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID);
    scanner.add_content("one ");
    scanner.add_content("two ");
    scanner.add_content("three");
    assert_eq!(scanner.advisory_buffer(), "one two three");
}

#[test]
fn window_scan_hook_sees_each_scan() {
    let samples = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&samples);
    let mut scanner = StreamingScanner::new(registry(), SCAN_ID)
        .with_window_scan_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    scanner.add_content(&clean_text(WINDOW_SIZE));
    scanner.add_content(&clean_text(WINDOW_SIZE));
    scanner.add_content("tail");
    scanner.flush();
    assert_eq!(samples.load(Ordering::SeqCst), 3);
    assert_eq!(scanner.window_scan_latencies().len(), 3);
}
