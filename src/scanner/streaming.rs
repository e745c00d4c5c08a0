//! scanner/streaming.rs
//! Per-stream window accumulator over the scan primitive.
//!
//! One [`StreamingScanner`] is created per in-flight streaming response. The
//! forwarder feeds it extracted text chunks; every 512 accumulated characters
//! it scans `overlap ‖ window` synchronously and either passes (rotating the
//! 128-character overlap buffer) or aborts the stream. The overlap buffer is
//! what catches credentials split across a window boundary.
//!
//! Calls are strictly serial per stream; the scanner shares nothing between
//! streams. Once aborted, every further call returns the latched block
//! result without re-scanning.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::scanner::definitions::{
    PatternRegistry, RiskLevel, RULE_SCANNER_ERROR, RULE_SCANNER_TIMEOUT,
};
use crate::scanner::engine::{
    make_redacted_excerpt, make_suppression_hint, scan, EXCERPT_MAX_LEN,
};

/// Scan window size in characters. A window scan triggers once this many
/// characters have accumulated since the last scan (or stream start).
pub const WINDOW_SIZE: usize = 512;

/// Overlap carried between windows, in characters. The last `OVERLAP_SIZE`
/// characters of a passed window are prepended to the next scan text so a
/// secret split across the boundary is still seen whole.
pub const OVERLAP_SIZE: usize = 128;

// ─── StreamBlock ────────────────────────────────────────────────────────────

/// Block decision produced by a window scan. This is what the stream
/// forwarder turns into an aborted upstream and a terminator frame.
#[derive(Debug, Clone, Serialize)]
pub struct StreamBlock {
    pub scan_id: String,
    pub rule_id: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression_hint: Option<String>,
    pub is_test: bool,
    /// Byte-length token approximation of content already forwarded.
    pub tokens_delivered: u64,
}

// ─── StreamingScanner ───────────────────────────────────────────────────────

/// Per-stream state machine: accumulating → accumulating (pass) → aborted.
///
/// Not safe for concurrent calls; the surrounding forwarder guarantees
/// serial `add_content` / `flush` invocations.
pub struct StreamingScanner {
    registry: Arc<PatternRegistry>,
    scan_id: String,
    /// Content accumulated since the last window scan.
    window_buffer: String,
    /// Character count of `window_buffer`, tracked incrementally.
    window_chars: usize,
    /// Last OVERLAP_SIZE chars of the previous window.
    overlap_buffer: String,
    /// Full accumulated content for the out-of-band advisory scan.
    /// Append-only; never consulted by the window scan itself.
    advisory_buffer: String,
    tokens_delivered: u64,
    window_count: u32,
    aborted: bool,
    abort_result: Option<StreamBlock>,
    window_scan_latencies: Vec<f64>,
    on_window_scan: Option<Box<dyn Fn(f64) + Send>>,
}

impl StreamingScanner {
    pub fn new(registry: Arc<PatternRegistry>, scan_id: impl Into<String>) -> Self {
        Self {
            registry,
            scan_id: scan_id.into(),
            window_buffer: String::new(),
            window_chars: 0,
            overlap_buffer: String::new(),
            advisory_buffer: String::new(),
            tokens_delivered: 0,
            window_count: 0,
            aborted: false,
            abort_result: None,
            window_scan_latencies: Vec::new(),
            on_window_scan: None,
        }
    }

    /// Register an observability hook invoked with the elapsed milliseconds
    /// of every window scan.
    pub fn with_window_scan_hook(mut self, hook: impl Fn(f64) + Send + 'static) -> Self {
        self.on_window_scan = Some(Box::new(hook));
        self
    }

    /// Accumulate extracted chunk text; scan when the window fills.
    ///
    /// Returns `Some(StreamBlock)` on a block decision (pattern match or
    /// fail-safe) and `None` while the stream may continue. Once aborted,
    /// always returns the latched block without scanning again.
    pub fn add_content(&mut self, content: &str) -> Option<StreamBlock> {
        if self.aborted {
            return self.abort_result.clone();
        }

        self.window_buffer.push_str(content);
        self.advisory_buffer.push_str(content);

        let chars = content.chars().count();
        self.window_chars += chars;
        self.tokens_delivered += (chars / 4) as u64;

        if self.window_chars >= WINDOW_SIZE {
            return self.do_window_scan();
        }
        None
    }

    /// Scan whatever remains after the upstream stream ends. Call exactly
    /// once at stream completion.
    pub fn flush(&mut self) -> Option<StreamBlock> {
        if self.aborted {
            return self.abort_result.clone();
        }
        if !self.window_buffer.is_empty() {
            return self.do_window_scan();
        }
        None
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn tokens_delivered(&self) -> u64 {
        self.tokens_delivered
    }

    pub fn window_count(&self) -> u32 {
        self.window_count
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Content accumulated for the advisory engine since stream start.
    pub fn advisory_buffer(&self) -> &str {
        &self.advisory_buffer
    }

    /// Overlap carried from the previous window (test visibility).
    pub fn overlap_buffer(&self) -> &str {
        &self.overlap_buffer
    }

    /// Elapsed-ms samples of every window scan so far.
    pub fn window_scan_latencies(&self) -> &[f64] {
        &self.window_scan_latencies
    }

    // ── Internal ───────────────────────────────────────────────────────────

    fn do_window_scan(&mut self) -> Option<StreamBlock> {
        let scan_text = format!("{}{}", self.overlap_buffer, self.window_buffer);

        let t0 = Instant::now();
        let scanned = catch_unwind(AssertUnwindSafe(|| {
            let outcome = scan(&self.registry, &scan_text);
            if !outcome.is_block {
                return None;
            }
            let rule_id = outcome.rule_id.unwrap_or(RULE_SCANNER_ERROR);
            // No suppression hint for fail-safe blocks: there is nothing a
            // user could meaningfully allowlist.
            let hint = if rule_id == RULE_SCANNER_ERROR || rule_id == RULE_SCANNER_TIMEOUT {
                None
            } else {
                Some(make_suppression_hint(
                    rule_id,
                    outcome.matched_slug.unwrap_or("unknown"),
                ))
            };
            Some(StreamBlock {
                scan_id: self.scan_id.clone(),
                rule_id: rule_id.to_string(),
                risk_level: outcome.risk_level.unwrap_or(RiskLevel::Critical),
                redacted_excerpt: make_redacted_excerpt(&scan_text, &outcome, EXCERPT_MAX_LEN),
                suppression_hint: hint,
                is_test: outcome.is_test,
                tokens_delivered: self.tokens_delivered,
            })
        }));

        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;
        self.window_scan_latencies.push(elapsed_ms);
        if let Some(hook) = &self.on_window_scan {
            // Metric recording is best-effort and must never fail a scan.
            let _ = catch_unwind(AssertUnwindSafe(|| hook(elapsed_ms)));
        }

        match scanned {
            Ok(None) => {
                // Pass: rotate buffers and keep streaming.
                self.rotate_buffers();
                self.window_count += 1;
                None
            }
            Ok(Some(block)) => {
                tracing::info!(
                    scan_id = %self.scan_id,
                    rule_id = %block.rule_id,
                    risk_level = %block.risk_level,
                    window = self.window_count,
                    "streaming window block"
                );
                self.latch_abort(block)
            }
            Err(_) => {
                tracing::error!(
                    scan_id = %self.scan_id,
                    "window scan panicked, blocking fail-safe"
                );
                let block = StreamBlock {
                    scan_id: self.scan_id.clone(),
                    rule_id: RULE_SCANNER_ERROR.to_string(),
                    risk_level: RiskLevel::Critical,
                    redacted_excerpt: None,
                    suppression_hint: None,
                    is_test: false,
                    tokens_delivered: self.tokens_delivered,
                };
                self.latch_abort(block)
            }
        }
    }

    fn latch_abort(&mut self, block: StreamBlock) -> Option<StreamBlock> {
        self.aborted = true;
        self.abort_result = Some(block);
        self.abort_result.clone()
    }

    fn rotate_buffers(&mut self) {
        if self.window_chars <= OVERLAP_SIZE {
            std::mem::swap(&mut self.overlap_buffer, &mut self.window_buffer);
        } else {
            let skip = self.window_chars - OVERLAP_SIZE;
            let cut = self
                .window_buffer
                .char_indices()
                .nth(skip)
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            self.overlap_buffer = self.window_buffer[cut..].to_string();
        }
        self.window_buffer = String::new();
        self.window_chars = 0;
    }
}
