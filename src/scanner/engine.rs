//! scanner/engine.rs
//! The synchronous scan primitive and its companions.
//!
//! - [`apply_input_cap`] — hard 8192-character input limit; the caller's
//!   first step, never re-applied by [`scan`] itself.
//! - [`scan`] — apply the registry in priority order; first match wins;
//!   fail-safe (an internal panic becomes a SCANNER_ERROR block, never an
//!   allow).
//! - [`make_redacted_excerpt`] / [`make_suppression_hint`] — the only
//!   sanctioned ways to turn a match into user-visible or persisted text.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::scanner::definitions::{
    PatternEntry, PatternRegistry, RiskLevel, RULE_SCANNER_ERROR,
};

/// Hard input cap for the scan pipeline, in characters. Inputs longer than
/// this are truncated before [`scan`] is called.
pub const INPUT_HARD_CAP: usize = 8192;

/// Context chars kept on each side of the match in the redacted excerpt.
const EXCERPT_CONTEXT: usize = 20;

// ─── ScanContext ────────────────────────────────────────────────────────────

/// Per-scan audit metadata accumulated by the pipeline around the primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanContext {
    /// Set by [`apply_input_cap`] when the input exceeded the hard cap.
    pub truncated: bool,
    /// Original character length, recorded only on truncation.
    pub original_length: Option<usize>,
}

// ─── apply_input_cap ────────────────────────────────────────────────────────

/// Cap `text` at [`INPUT_HARD_CAP`] characters.
///
/// Returns the input unchanged when it fits, otherwise a prefix slice ending
/// on a character boundary. On truncation, records `truncated` and
/// `original_length` in `ctx`. Never fails, never allocates.
///
/// Calling this before [`scan`] is the caller's contract; the primitive does
/// not re-apply it.
pub fn apply_input_cap<'a>(text: &'a str, ctx: &mut ScanContext) -> &'a str {
    // Cheap path: a string of n bytes has at most n chars.
    if text.len() <= INPUT_HARD_CAP {
        return text;
    }
    match text.char_indices().nth(INPUT_HARD_CAP) {
        Some((byte_idx, _)) => {
            ctx.truncated = true;
            ctx.original_length = Some(text.chars().count());
            tracing::warn!(
                original_length = ctx.original_length,
                cap = INPUT_HARD_CAP,
                "scan input truncated"
            );
            &text[..byte_idx]
        }
        // More bytes than the cap but not more characters.
        None => text,
    }
}

// ─── ScanOutcome ────────────────────────────────────────────────────────────

/// Result of a single [`scan`] call.
///
/// Internal type: never serialized to HTTP responses or audit events. The
/// `raw_match` field in particular must only ever feed
/// [`make_redacted_excerpt`].
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub is_block: bool,
    pub rule_id: Option<&'static str>,
    pub risk_level: Option<RiskLevel>,
    pub matched_slug: Option<&'static str>,
    /// The matched text itself. Never crosses a process boundary.
    pub raw_match: Option<String>,
    /// Byte offset of the match start in the scanned text.
    pub match_start: Option<usize>,
    /// Byte offset one past the match end in the scanned text.
    pub match_end: Option<usize>,
    /// True when the match is the known OnGarde test credential.
    pub is_test: bool,
}

impl ScanOutcome {
    pub fn allow() -> Self {
        Self::default()
    }

    /// Fail-safe block: the scanner itself failed, no match offsets exist.
    pub fn scanner_error() -> Self {
        Self {
            is_block: true,
            rule_id: Some(RULE_SCANNER_ERROR),
            risk_level: Some(RiskLevel::Critical),
            ..Self::default()
        }
    }

    fn from_match(entry: &PatternEntry, m: &regex::Match<'_>) -> Self {
        Self {
            is_block: true,
            rule_id: Some(entry.rule_id()),
            risk_level: Some(entry.risk_level()),
            matched_slug: Some(entry.slug()),
            raw_match: Some(m.as_str().to_string()),
            match_start: Some(m.start()),
            match_end: Some(m.end()),
            is_test: entry.is_test_key(),
        }
    }
}

// ─── scan ───────────────────────────────────────────────────────────────────

/// Apply every registry pattern to `text` in priority order.
///
/// First match wins: exact test key, then credentials, dangerous commands,
/// prompt injection, PII fast path; within a group the first entry to match
/// wins. Synchronous, no I/O, no allocation proportional to the registry.
///
/// Fail-safe: a panic anywhere inside the matching loop is caught and turned
/// into `is_block = true, rule_id = SCANNER_ERROR, risk_level = CRITICAL`.
/// That is the only way this function blocks without a pattern match.
///
/// Precondition: `text` has already been capped by [`apply_input_cap`].
pub fn scan(registry: &PatternRegistry, text: &str) -> ScanOutcome {
    let scanned = catch_unwind(AssertUnwindSafe(|| scan_inner(registry, text)));
    match scanned {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!("scan primitive panicked, blocking fail-safe");
            ScanOutcome::scanner_error()
        }
    }
}

fn scan_inner(registry: &PatternRegistry, text: &str) -> ScanOutcome {
    if let Some(m) = registry.test_key().pattern().find(text) {
        return ScanOutcome::from_match(registry.test_key(), &m);
    }

    let groups = [
        registry.credentials(),
        registry.dangerous_commands(),
        registry.prompt_injection(),
        registry.pii_fast_path(),
    ];
    for group in groups {
        for entry in group {
            if let Some(m) = entry.pattern().find(text) {
                return ScanOutcome::from_match(entry, &m);
            }
        }
    }

    ScanOutcome::allow()
}

// ─── Redaction helpers ──────────────────────────────────────────────────────

/// Build the sanitized excerpt for a block response or audit event.
///
/// CRITICAL/HIGH: the matched span is replaced with `[REDACTED:<slug>]` and
/// up to 20 characters of context survive on each side. MEDIUM/LOW: the
/// first 10 characters of the match followed by `…` as a partial hint.
///
/// Returns `None` for system-error blocks (no offsets). Output is clamped to
/// `max_len` characters. The raw match never appears in CRITICAL/HIGH output.
pub fn make_redacted_excerpt(
    text: &str,
    outcome: &ScanOutcome,
    max_len: usize,
) -> Option<String> {
    let (start, end) = match (outcome.match_start, outcome.match_end) {
        (Some(s), Some(e)) if s <= e && e <= text.len() => (s, e),
        _ => return None,
    };

    let before: String = text[..start]
        .chars()
        .rev()
        .take(EXCERPT_CONTEXT)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let after: String = text[end..].chars().take(EXCERPT_CONTEXT).collect();
    let slug = outcome
        .matched_slug
        .or(outcome.rule_id)
        .unwrap_or("unknown");

    let redacted = match outcome.risk_level {
        Some(RiskLevel::Critical) | Some(RiskLevel::High) => {
            format!("{before}[REDACTED:{slug}]{after}")
        }
        _ => {
            let raw = outcome.raw_match.as_deref().unwrap_or("");
            let partial: String = raw.chars().take(10).collect();
            let ellipsis = if raw.chars().count() > 10 { "…" } else { "" };
            format!("{before}[{partial}{ellipsis}]{after}")
        }
    };

    Some(redacted.chars().take(max_len).collect())
}

/// Default excerpt length used by the block pipeline.
pub const EXCERPT_MAX_LEN: usize = 100;

/// Generate a ready-to-paste allowlist snippet for a blocked rule.
///
/// Deterministic: identical inputs yield byte-identical output. The snippet
/// parses as YAML and references the triggering rule id; the slug only feeds
/// the explanatory note template.
pub fn make_suppression_hint(rule_id: &str, slug: &str) -> String {
    format!(
        "# Add to .ongarde/config.yaml allowlist section:\n\
         allowlist:\n  - rule_id: {rule_id}\n    \
         note: \"explain why this {slug} is safe in your context\"\n"
    )
}
